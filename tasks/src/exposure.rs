//! Exposure tasks
//!
//! Prepares cooler and filter wheel, takes one exposure and hands the
//! image to an [`ImageSink`]. A cancelled exposure is aborted on the
//! camera, and the task only reports `Cancelled` once the camera has
//! stopped exposing.

use crate::config::ExposureWorkConfig;
use crate::entry::{TaskInfo, TaskParameters};
use crate::error::{TaskError, TaskResult};
use crate::work::{DeviceLocator, TaskWork, WorkContext};
use polaris_common::{
    ExposureStatus, FilterWheelState, Image, SharedCcd, SharedCooler, SharedFilterWheel,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Destination for finished images
pub trait ImageSink: Send + Sync {
    /// Keep the image and return the name it was stored under
    fn save(&self, image: &Image, parameters: &TaskParameters) -> TaskResult<String>;
}

/// Keeps images in memory under generated names
#[derive(Default)]
pub struct MemoryImageSink {
    images: Mutex<Vec<(String, Image)>>,
}

impl MemoryImageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn images(&self) -> Vec<(String, Image)> {
        self.images.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ImageSink for MemoryImageSink {
    fn save(&self, image: &Image, parameters: &TaskParameters) -> TaskResult<String> {
        let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        let project = if parameters.project.is_empty() {
            "image"
        } else {
            parameters.project.as_str()
        };
        let name = format!("{}-{:05}.fits", project, images.len() + 1);
        images.push((name.clone(), image.clone()));
        Ok(name)
    }
}

fn secs(what: &str, value: f64) -> TaskResult<Duration> {
    Duration::try_from_secs_f64(value.max(0.0))
        .map_err(|_| TaskError::Unsupported(format!("{} of {}s is out of range", what, value)))
}

pub struct ExposureWork {
    parameters: TaskParameters,
    ccd: SharedCcd,
    cooler: Option<SharedCooler>,
    filterwheel: Option<SharedFilterWheel>,
    sink: Arc<dyn ImageSink>,
    config: ExposureWorkConfig,
}

impl ExposureWork {
    pub fn new(
        parameters: TaskParameters,
        devices: &dyn DeviceLocator,
        sink: Arc<dyn ImageSink>,
        config: ExposureWorkConfig,
    ) -> TaskResult<Self> {
        if parameters.ccd.is_empty() {
            return Err(TaskError::Unsupported("exposure task without a ccd".to_string()));
        }
        config.validate()?;
        let ccd = devices.ccd(&parameters.ccd)?;
        let cooler = match parameters.cooler.as_str() {
            "" => None,
            name => Some(devices.cooler(name)?),
        };
        let filterwheel = match parameters.filterwheel.as_str() {
            "" => None,
            name => Some(devices.filterwheel(name)?),
        };
        Ok(Self {
            parameters,
            ccd,
            cooler,
            filterwheel,
            sink,
            config,
        })
    }

    fn wait_filterwheel(
        &self,
        ctx: &WorkContext,
        filterwheel: &SharedFilterWheel,
        timeout: f64,
    ) -> TaskResult<bool> {
        ctx.wait(secs("filter wheel timeout", timeout)?, || {
            Ok(filterwheel.state()? == FilterWheelState::Idle)
        })
    }

    fn prepare(&self, ctx: &WorkContext) -> TaskResult<()> {
        let temperature = self.parameters.ccd_temperature;
        if let (Some(cooler), Some(celsius)) = (&self.cooler, temperature) {
            tracing::debug!("{}: set point {:.1}°C", cooler.name(), celsius);
            cooler.set_temperature(celsius)?;
            cooler.set_on(true)?;
        }

        let filter = self.parameters.filter.as_str();
        let filterwheel = self.filterwheel.as_ref().filter(|_| !filter.is_empty());
        if let Some(filterwheel) = filterwheel {
            if !self.wait_filterwheel(ctx, filterwheel, self.config.filterwheel_idle_timeout_secs)? {
                return Err(TaskError::Timeout(format!("{} to become idle", filterwheel.name())));
            }
            filterwheel.select(filter)?;
        }

        if let (Some(cooler), Some(_)) = (&self.cooler, temperature) {
            let timeout = secs("cooler timeout", self.config.cooler_stable_timeout_secs)?;
            let stable = ctx.wait(timeout, || {
                Ok(cooler.is_stable()?)
            })?;
            if !stable {
                tracing::warn!("{} not stable, exposing anyway", cooler.name());
            }
        }

        if let Some(filterwheel) = filterwheel {
            if !self.wait_filterwheel(
                ctx,
                filterwheel,
                self.config.filterwheel_settle_timeout_secs,
            )? {
                return Err(TaskError::Timeout(format!("{} to reach {}", filterwheel.name(), filter)));
            }
        }
        Ok(())
    }

    /// Cancel the running exposure and wait for the camera to stop
    fn abort(&self) {
        if let Err(e) = self.ccd.cancel_exposure() {
            tracing::error!("cannot cancel exposure on {}: {}", self.ccd.name(), e);
            return;
        }
        let deadline = secs("cancel timeout", self.config.cancel_settle_timeout_secs)
            .ok()
            .and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            match self.ccd.exposure_status() {
                Ok(ExposureStatus::Cancelling) | Ok(ExposureStatus::Exposing) => {}
                Ok(_) => return,
                Err(e) => {
                    tracing::error!("cannot query {}: {}", self.ccd.name(), e);
                    return;
                }
            }
            if deadline.map_or(true, |deadline| Instant::now() >= deadline) {
                tracing::warn!("{} still busy after cancel", self.ccd.name());
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl TaskWork for ExposureWork {
    fn run(&mut self, ctx: &WorkContext, info: &mut TaskInfo) -> TaskResult<()> {
        let exposure = &self.parameters.exposure;
        let budget = secs(
            "exposure time",
            exposure.exposure_time + self.config.exposure_grace_secs,
        )?;
        self.prepare(ctx)?;

        tracing::info!(
            "task {}: exposing {:.2}s on {}",
            info.id,
            exposure.exposure_time,
            self.ccd.name()
        );
        self.ccd.start_exposure(exposure)?;
        let ccd = &self.ccd;
        match ctx.wait(budget, || Ok(ccd.exposure_status()? == ExposureStatus::Exposed)) {
            Ok(true) => {}
            Ok(false) => {
                self.abort();
                return Err(TaskError::Timeout(format!("exposure on {}", ccd.name())));
            }
            Err(TaskError::Cancelled) => {
                tracing::info!("task {}: cancelling exposure", info.id);
                self.abort();
                return Err(TaskError::Cancelled);
            }
            Err(e) => return Err(e),
        }

        let mut image = (*self.ccd.get_image()?).clone();
        if !self.parameters.instrument.is_empty() {
            image.set_metadata("INSTRUME", self.parameters.instrument.as_str());
        }
        if !self.parameters.filter.is_empty() {
            image.set_metadata("FILTER", self.parameters.filter.as_str());
        }
        if !self.parameters.project.is_empty() {
            image.set_metadata("PROJECT", self.parameters.project.as_str());
        }
        info.filename = self.sink.save(&image, &self.parameters)?;
        info.frame = image.frame;
        tracing::info!("task {}: image saved as {}", info.id, info.filename);
        Ok(())
    }
}

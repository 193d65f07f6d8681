//! In-process simulated devices
//!
//! Enough behavior to exercise the guiding loop and task executors
//! without hardware: exposures take real (wall clock) time, cancellation
//! passes through a short `cancelling` phase, and the filter wheel moves.

use crate::device_ops::*;
use crate::error::{DeviceError, DeviceResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
enum CcdPhase {
    Idle,
    Exposing { started: Instant, exposure: Exposure },
    Cancelling { since: Instant },
    Exposed { exposure: Exposure },
}

/// Simulated camera
pub struct SimCcd {
    name: String,
    sensor: ImageRectangle,
    phase: Mutex<CcdPhase>,
    cancel_delay: Duration,
    fail_start: AtomicBool,
    exposures: AtomicUsize,
}

impl SimCcd {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sensor: ImageRectangle::new(0, 0, 64, 48),
            phase: Mutex::new(CcdPhase::Idle),
            cancel_delay: Duration::from_millis(50),
            fail_start: AtomicBool::new(false),
            exposures: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent `start_exposure` fail
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Number of exposures started so far
    pub fn exposure_count(&self) -> usize {
        self.exposures.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CcdPhase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance time-driven transitions
    fn settle(&self, phase: &mut CcdPhase) {
        let next = match phase {
            CcdPhase::Exposing { started, exposure }
                if started.elapsed().as_secs_f64() >= exposure.exposure_time =>
            {
                Some(CcdPhase::Exposed {
                    exposure: exposure.clone(),
                })
            }
            CcdPhase::Cancelling { since } if since.elapsed() >= self.cancel_delay => {
                Some(CcdPhase::Idle)
            }
            _ => None,
        };
        if let Some(next) = next {
            *phase = next;
        }
    }
}

impl Ccd for SimCcd {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_exposure(&self, exposure: &Exposure) -> DeviceResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DeviceError::communication(&self.name, "simulated start failure"));
        }
        let mut phase = self.lock();
        self.settle(&mut phase);
        if matches!(*phase, CcdPhase::Exposing { .. } | CcdPhase::Cancelling { .. }) {
            return Err(DeviceError::bad_state(&self.name, "exposure already in progress"));
        }
        *phase = CcdPhase::Exposing {
            started: Instant::now(),
            exposure: exposure.clone(),
        };
        self.exposures.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("{}: exposing {:.3}s", self.name, exposure.exposure_time);
        Ok(())
    }

    fn exposure_status(&self) -> DeviceResult<ExposureStatus> {
        let mut phase = self.lock();
        self.settle(&mut phase);
        Ok(match *phase {
            CcdPhase::Idle => ExposureStatus::Idle,
            CcdPhase::Exposing { .. } => ExposureStatus::Exposing,
            CcdPhase::Cancelling { .. } => ExposureStatus::Cancelling,
            CcdPhase::Exposed { .. } => ExposureStatus::Exposed,
        })
    }

    fn get_image(&self) -> DeviceResult<ImagePtr> {
        // a pending exposure is waited out, as drivers do
        let remaining = {
            let phase = self.lock();
            match &*phase {
                CcdPhase::Exposing { started, exposure } => {
                    Duration::try_from_secs_f64(exposure.exposure_time.max(0.0))
                        .unwrap_or(Duration::ZERO)
                        .saturating_sub(started.elapsed())
                }
                _ => Duration::ZERO,
            }
        };
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        let mut phase = self.lock();
        self.settle(&mut phase);
        match std::mem::replace(&mut *phase, CcdPhase::Idle) {
            CcdPhase::Exposed { exposure } => {
                let frame = exposure.frame.unwrap_or(self.sensor);
                Ok(std::sync::Arc::new(Image::blank(frame, exposure.exposure_time)))
            }
            other => {
                *phase = other;
                Err(DeviceError::NoImage(self.name.clone()))
            }
        }
    }

    fn cancel_exposure(&self) -> DeviceResult<()> {
        let mut phase = self.lock();
        self.settle(&mut phase);
        if matches!(*phase, CcdPhase::Exposing { .. }) {
            tracing::debug!("{}: cancelling exposure", self.name);
            *phase = CcdPhase::Cancelling {
                since: Instant::now(),
            };
        }
        Ok(())
    }
}

/// Simulated cooler; stability is set by the test
pub struct SimCooler {
    name: String,
    target: Mutex<Option<f64>>,
    on: AtomicBool,
    stable: AtomicBool,
}

impl SimCooler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: Mutex::new(None),
            on: AtomicBool::new(false),
            stable: AtomicBool::new(true),
        }
    }

    pub fn set_stable(&self, stable: bool) {
        self.stable.store(stable, Ordering::SeqCst);
    }

    pub fn target(&self) -> Option<f64> {
        *self.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

impl Cooler for SimCooler {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_temperature(&self, celsius: f64) -> DeviceResult<()> {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(celsius);
        Ok(())
    }

    fn set_on(&self, on: bool) -> DeviceResult<()> {
        self.on.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn is_stable(&self) -> DeviceResult<bool> {
        Ok(self.on.load(Ordering::SeqCst) && self.stable.load(Ordering::SeqCst))
    }
}

struct WheelPosition {
    filter: String,
    moved_at: Option<Instant>,
}

/// Simulated filter wheel with a fixed travel time
pub struct SimFilterWheel {
    name: String,
    filters: Vec<String>,
    travel: Duration,
    position: Mutex<WheelPosition>,
}

impl SimFilterWheel {
    pub fn new(name: impl Into<String>, filters: &[&str]) -> Self {
        Self {
            name: name.into(),
            filters: filters.iter().map(|f| f.to_string()).collect(),
            travel: Duration::from_millis(50),
            position: Mutex::new(WheelPosition {
                filter: filters.first().map(|f| f.to_string()).unwrap_or_default(),
                moved_at: None,
            }),
        }
    }
}

impl FilterWheel for SimFilterWheel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> DeviceResult<FilterWheelState> {
        let position = self.position.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match position.moved_at {
            Some(at) if at.elapsed() < self.travel => FilterWheelState::Moving,
            _ => FilterWheelState::Idle,
        })
    }

    fn select(&self, filter: &str) -> DeviceResult<()> {
        if !self.filters.iter().any(|f| f == filter) {
            return Err(DeviceError::communication(
                &self.name,
                format!("unknown filter '{}'", filter),
            ));
        }
        let mut position = self.position.lock().unwrap_or_else(|e| e.into_inner());
        if position.filter != filter {
            position.filter = filter.to_string();
            position.moved_at = Some(Instant::now());
        }
        Ok(())
    }

    fn current_filter(&self) -> DeviceResult<String> {
        Ok(self
            .position
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .filter
            .clone())
    }
}

/// Guide port that records every activation
pub struct SimGuidePort {
    name: String,
    activations: Mutex<Vec<[f64; 4]>>,
}

impl SimGuidePort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            activations: Mutex::new(Vec::new()),
        }
    }

    /// All activations as `[ra_plus, ra_minus, dec_plus, dec_minus]`
    pub fn activations(&self) -> Vec<[f64; 4]> {
        self.activations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_activation(&self) -> Option<[f64; 4]> {
        self.activations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .copied()
    }
}

impl GuidePort for SimGuidePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn activate(&self, ra_plus: f64, ra_minus: f64, dec_plus: f64, dec_minus: f64) -> DeviceResult<()> {
        self.activations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push([ra_plus, ra_minus, dec_plus, dec_minus]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ccd_exposure_cycle() {
        let ccd = SimCcd::new("ccd:sim/0/Imaging");
        assert_eq!(ccd.exposure_status().unwrap(), ExposureStatus::Idle);
        ccd.start_exposure(&Exposure::with_time(0.05)).unwrap();
        assert_eq!(ccd.exposure_status().unwrap(), ExposureStatus::Exposing);
        let image = ccd.get_image().unwrap();
        assert_eq!(image.width, 64);
        assert_eq!(ccd.exposure_status().unwrap(), ExposureStatus::Idle);
        assert_eq!(ccd.exposure_count(), 1);
    }

    #[test]
    fn test_ccd_cancel_passes_through_cancelling() {
        let ccd = SimCcd::new("ccd:sim/0/Imaging");
        ccd.start_exposure(&Exposure::with_time(10.0)).unwrap();
        ccd.cancel_exposure().unwrap();
        assert_eq!(ccd.exposure_status().unwrap(), ExposureStatus::Cancelling);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(ccd.exposure_status().unwrap(), ExposureStatus::Idle);
        assert!(ccd.get_image().is_err());
    }

    #[test]
    fn test_ccd_fail_start() {
        let ccd = SimCcd::new("ccd:sim/0/Imaging");
        ccd.set_fail_start(true);
        assert!(ccd.start_exposure(&Exposure::default()).is_err());
    }

    #[test]
    fn test_filterwheel_moves() {
        let wheel = SimFilterWheel::new("filterwheel:sim/0", &["L", "R", "G", "B"]);
        assert_eq!(wheel.current_filter().unwrap(), "L");
        wheel.select("R").unwrap();
        assert_eq!(wheel.state().unwrap(), FilterWheelState::Moving);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(wheel.state().unwrap(), FilterWheelState::Idle);
        assert!(wheel.select("Ha").is_err());
    }

    #[test]
    fn test_guideport_records() {
        let port = SimGuidePort::new("guideport:sim/0");
        port.activate(0.5, 0.0, 0.0, 0.25).unwrap();
        assert_eq!(port.last_activation(), Some([0.5, 0.0, 0.0, 0.25]));
        assert_eq!(port.activations().len(), 1);
    }
}

//! Guider process
//!
//! Owns one guiding session: a measurement thread running
//! [`TrackingWork`] and an actuation thread running [`DrivingWork`].
//! Before the first measurement the actuation loop already applies the
//! drift compensation derived from the calibration.

use crate::calibration::BasicCalibration;
use crate::config::GuidingConfig;
use crate::driving::DrivingWork;
use crate::error::{GuidingError, GuidingResult};
use crate::point::Point;
use crate::store::{GuidingRun, TrackingPoint, TrackingStore};
use crate::tracking::{Tracker, TrackingWork};
use polaris_common::{CancellationToken, Exposure, SharedCcd, SharedGuidePort};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Devices used for guiding
#[derive(Clone)]
pub struct GuiderDevices {
    pub instrument: String,
    pub ccd: SharedCcd,
    pub guideport: SharedGuidePort,
    /// Exposure used for every guide image
    pub exposure: Exposure,
}

/// Counts live worker threads; decremented even if a worker panics
#[derive(Default)]
struct ExitLatch {
    running: Mutex<usize>,
    cond: Condvar,
}

struct ExitGuard(Arc<ExitLatch>);

impl ExitLatch {
    fn enter(self: &Arc<Self>) -> ExitGuard {
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        ExitGuard(self.clone())
    }

    /// Wait until no worker is running, returns false on timeout
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        while *running > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            running = self
                .cond
                .wait_timeout(running, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut running = self.0.running.lock().unwrap_or_else(|e| e.into_inner());
        *running = running.saturating_sub(1);
        self.0.cond.notify_all();
    }
}

pub struct GuiderProcess {
    devices: GuiderDevices,
    calibration: BasicCalibration,
    config: GuidingConfig,
    baseline: Point,
    store: Option<Arc<dyn TrackingStore>>,
    driving: Arc<DrivingWork>,
    tracking: Option<Arc<TrackingWork>>,
    run_id: Option<Uuid>,
    token: CancellationToken,
    latch: Arc<ExitLatch>,
    measurement: Option<JoinHandle<()>>,
    actuation: Option<JoinHandle<()>>,
}

impl GuiderProcess {
    pub fn new(
        devices: GuiderDevices,
        calibration: BasicCalibration,
        config: GuidingConfig,
    ) -> GuidingResult<Self> {
        config.validate()?;
        if !calibration.is_usable() {
            return Err(GuidingError::Uncalibrated);
        }
        let baseline = -calibration.defaultcorrection()?;
        let limit = config.max_activation_secs;
        if baseline.x.abs() > limit || baseline.y.abs() > limit {
            return Err(GuidingError::ActivationOutOfRange {
                tx: baseline.x,
                ty: baseline.y,
                limit,
            });
        }
        tracing::info!(
            "guider on {} with calibration {}, baseline activation {}",
            devices.ccd.name(),
            calibration,
            baseline
        );
        let driving = Arc::new(DrivingWork::new(
            devices.guideport.clone(),
            config.actuation_period_secs,
        ));
        driving.set_correction(baseline.x, baseline.y);
        Ok(Self {
            devices,
            calibration,
            config,
            baseline,
            store: None,
            driving,
            tracking: None,
            run_id: None,
            token: CancellationToken::new(),
            latch: Arc::new(ExitLatch::default()),
            measurement: None,
            actuation: None,
        })
    }

    /// Record tracking history of future sessions in `store`
    pub fn set_store(&mut self, store: Arc<dyn TrackingStore>) {
        self.store = Some(store);
    }

    pub fn gain(&self) -> f64 {
        self.config.gain
    }

    /// Takes effect at the next `start`
    pub fn set_gain(&mut self, gain: f64) {
        self.config.gain = gain;
    }

    pub fn interval(&self) -> f64 {
        self.config.interval_secs
    }

    /// Takes effect at the next `start`
    pub fn set_interval(&mut self, interval: f64) -> GuidingResult<()> {
        if !(interval >= 1.0) {
            return Err(GuidingError::InvalidInterval(interval));
        }
        self.config.interval_secs = interval;
        Ok(())
    }

    pub fn calibration(&self) -> &BasicCalibration {
        &self.calibration
    }

    /// Activation applied when the star sits still
    pub fn baseline(&self) -> Point {
        self.baseline
    }

    /// Activation currently applied by the actuation loop
    pub fn correction(&self) -> Point {
        self.driving.correction()
    }

    pub fn last_action(&self) -> Option<TrackingPoint> {
        self.tracking.as_ref().and_then(|t| t.last_action())
    }

    /// Id of the guiding run being recorded
    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    pub fn is_tracking(&self) -> bool {
        self.measurement
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn is_running(&self) -> bool {
        self.measurement.is_some() || self.actuation.is_some()
    }

    /// Start both loops with the given tracker
    pub fn start(&mut self, tracker: Arc<dyn Tracker>) -> GuidingResult<()> {
        if self.is_running() {
            return Err(GuidingError::AlreadyRunning);
        }
        self.token = CancellationToken::new();
        self.driving.set_correction(self.baseline.x, self.baseline.y);

        let mut work = TrackingWork::new(
            self.calibration.clone(),
            tracker,
            self.devices.clone(),
            self.driving.clone(),
            &self.config,
        )?;
        self.run_id = None;
        if let Some(store) = &self.store {
            let run = GuidingRun::new(
                &self.devices.instrument,
                self.devices.ccd.name(),
                self.devices.guideport.name(),
                self.calibration.id,
            );
            store.add_run(&run)?;
            self.run_id = Some(run.id);
            work = work.with_recorder(store.clone(), run.id);
        }
        let work = Arc::new(work);
        self.tracking = Some(work.clone());

        let driving = self.driving.clone();
        let token = self.token.clone();
        let guard = self.latch.enter();
        self.actuation = Some(std::thread::spawn(move || {
            let _guard = guard;
            driving.run(&token);
        }));

        let token = self.token.clone();
        let guard = self.latch.enter();
        self.measurement = Some(std::thread::spawn(move || {
            let _guard = guard;
            if let Err(e) = work.run(&token) {
                tracing::error!("tracking failed: {}", e);
            }
        }));
        Ok(())
    }

    /// Ask both loops to terminate
    pub fn stop(&self) {
        tracing::debug!("stopping guider");
        self.token.cancel();
    }

    /// Wait for both loops to end, joining them if they did
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if !self.latch.wait(timeout) {
            return false;
        }
        for handle in [self.measurement.take(), self.actuation.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                tracing::error!("guider thread panicked");
            }
        }
        true
    }
}

impl Drop for GuiderProcess {
    fn drop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.stop();
        let grace = Duration::from_secs_f64(self.config.interval_secs + 1.0);
        if !self.wait(grace) {
            tracing::warn!(
                "guider threads did not terminate within {:.0}s, detaching",
                grace.as_secs_f64()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polaris_common::simulator::{SimCcd, SimGuidePort};

    fn devices() -> GuiderDevices {
        GuiderDevices {
            instrument: "test".to_string(),
            ccd: Arc::new(SimCcd::new("ccd:sim/0/Guider")),
            guideport: Arc::new(SimGuidePort::new("guideport:sim/0")),
            exposure: Exposure::with_time(0.0),
        }
    }

    #[test]
    fn test_baseline_is_negated_drift_correction() {
        let calibration =
            BasicCalibration::from_coefficients([10.0, 0.0, 0.5, 0.0, 10.0, -0.2]);
        let guider =
            GuiderProcess::new(devices(), calibration.clone(), GuidingConfig::default()).unwrap();
        let dc = calibration.defaultcorrection().unwrap();
        assert_eq!(guider.baseline(), -dc);
        assert_eq!(guider.correction(), -dc);
        assert!(!guider.is_tracking());
    }

    #[test]
    fn test_uncalibrated_guider_rejected() {
        let result = GuiderProcess::new(devices(), BasicCalibration::new(), GuidingConfig::default());
        assert!(matches!(result, Err(GuidingError::Uncalibrated)));
    }

    #[test]
    fn test_excessive_drift_rejected() {
        let calibration = BasicCalibration::from_coefficients([1.0, 0.0, 5.0, 0.0, 1.0, 0.0]);
        let result = GuiderProcess::new(devices(), calibration, GuidingConfig::default());
        assert!(matches!(result, Err(GuidingError::ActivationOutOfRange { .. })));
    }

    #[test]
    fn test_interval_validation() {
        let calibration = BasicCalibration::from_coefficients([10.0, 0.0, 0.0, 0.0, 10.0, 0.0]);
        let mut guider = GuiderProcess::new(devices(), calibration, GuidingConfig::default()).unwrap();
        assert!(guider.set_interval(0.2).is_err());
        guider.set_interval(2.0).unwrap();
        assert_eq!(guider.interval(), 2.0);
        guider.set_gain(0.8);
        assert_eq!(guider.gain(), 0.8);
    }

    #[test]
    fn test_exit_latch() {
        let latch = Arc::new(ExitLatch::default());
        assert!(latch.wait(Duration::from_millis(1)));
        let guard = latch.enter();
        assert!(!latch.wait(Duration::from_millis(10)));
        drop(guard);
        assert!(latch.wait(Duration::from_millis(10)));
    }
}

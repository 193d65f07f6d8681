//! Measurement loop
//!
//! Each cycle takes a guide exposure, asks the tracker where the star
//! went, converts that into an activation through the calibration and
//! publishes it to the actuation loop:
//!
//! expose → wait exposure time → get image → measure → correct → clamp →
//! publish → sleep out the rest of the interval.

use crate::calibration::BasicCalibration;
use crate::config::GuidingConfig;
use crate::driving::DrivingWork;
use crate::error::{GuidingError, GuidingResult};
use crate::guider::GuiderDevices;
use crate::point::Point;
use crate::store::{TrackingPoint, TrackingStore};
use chrono::Utc;
use polaris_common::{CancellationToken, ImagePtr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

/// Measures the star offset in a guide image
///
/// Returns NaN in either coordinate when the star is lost.
pub trait Tracker: Send + Sync {
    fn offset(&self, image: &ImagePtr) -> Point;
}

impl<F> Tracker for F
where
    F: Fn(&ImagePtr) -> Point + Send + Sync,
{
    fn offset(&self, image: &ImagePtr) -> Point {
        self(image)
    }
}

enum Cycle {
    Continue,
    Lost,
    Cancelled,
}

pub struct TrackingWork {
    devices: GuiderDevices,
    tracker: Arc<dyn Tracker>,
    calibration: BasicCalibration,
    driving: Arc<DrivingWork>,
    gain: f64,
    interval: f64,
    max_activation: f64,
    recorder: Option<(Arc<dyn TrackingStore>, Uuid)>,
    last: Mutex<Option<TrackingPoint>>,
}

impl TrackingWork {
    pub fn new(
        calibration: BasicCalibration,
        tracker: Arc<dyn Tracker>,
        devices: GuiderDevices,
        driving: Arc<DrivingWork>,
        config: &GuidingConfig,
    ) -> GuidingResult<Self> {
        config.validate()?;
        if !calibration.is_usable() {
            return Err(GuidingError::Uncalibrated);
        }
        Ok(Self {
            devices,
            tracker,
            calibration,
            driving,
            gain: config.gain,
            interval: config.interval_secs,
            max_activation: config.max_activation_secs,
            recorder: None,
            last: Mutex::new(None),
        })
    }

    /// Record every cycle under the given guiding run
    pub fn with_recorder(mut self, store: Arc<dyn TrackingStore>, run: Uuid) -> Self {
        self.recorder = Some((store, run));
        self
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f64) {
        self.gain = gain;
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn set_interval(&mut self, interval: f64) -> GuidingResult<()> {
        if !(interval >= 1.0) {
            return Err(GuidingError::InvalidInterval(interval));
        }
        self.interval = interval;
        Ok(())
    }

    /// The most recent cycle's measurement and published activation
    pub fn last_action(&self) -> Option<TrackingPoint> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run(&self, token: &CancellationToken) -> GuidingResult<()> {
        tracing::info!(
            "tracking with {} started: gain={}, interval={}s",
            self.devices.ccd.name(),
            self.gain,
            self.interval
        );
        let mut previous: Option<Instant> = None;
        while !token.is_cancelled() {
            let start = Instant::now();
            match self.cycle(token, start, previous)? {
                Cycle::Continue => {}
                Cycle::Lost => {
                    tracing::error!("loss of tracking");
                    return Ok(());
                }
                Cycle::Cancelled => break,
            }
            previous = Some(start);

            if token.is_cancelled() {
                break;
            }
            let remaining = self.interval - start.elapsed().as_secs_f64();
            if token.wait_secs(remaining) {
                break;
            }
        }
        tracing::info!("tracking terminated");
        Ok(())
    }

    fn cycle(
        &self,
        token: &CancellationToken,
        start: Instant,
        previous: Option<Instant>,
    ) -> GuidingResult<Cycle> {
        let ccd = &self.devices.ccd;
        ccd.start_exposure(&self.devices.exposure)?;
        if token.wait_secs(self.devices.exposure.exposure_time) {
            if let Err(e) = ccd.cancel_exposure() {
                tracing::warn!("cannot cancel guide exposure: {}", e);
            }
            return Ok(Cycle::Cancelled);
        }
        let image = ccd.get_image()?;

        let offset = self.tracker.offset(&image);
        if offset.is_nan() {
            return Ok(Cycle::Lost);
        }

        let since_last = previous.unwrap_or(start).elapsed().as_secs_f64();
        let correctiontime = since_last.max(self.interval);
        let correction = self.gain * self.calibration.correction(offset, correctiontime)?;
        // the actuation loop repeats the value every second
        let per_second = (1.0 / correctiontime) * correction;
        let limit = self.max_activation;
        let tx = (-per_second.x).clamp(-limit, limit);
        let ty = (-per_second.y).clamp(-limit, limit);
        self.driving.set_correction(tx, ty);

        let point = TrackingPoint {
            when: Utc::now(),
            tracking_offset: offset,
            correction: Point::new(tx, ty),
        };
        tracing::debug!(
            "offset {} over {:.2}s -> activation {}",
            offset,
            correctiontime,
            point.correction
        );
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(point);
        if let Some((store, run)) = &self.recorder {
            if let Err(e) = store.add_point(*run, &point) {
                tracing::warn!("cannot record tracking point: {}", e);
            }
        }
        Ok(Cycle::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polaris_common::simulator::{SimCcd, SimGuidePort};
    use polaris_common::Exposure;

    fn devices() -> GuiderDevices {
        GuiderDevices {
            instrument: "test".to_string(),
            ccd: Arc::new(SimCcd::new("ccd:sim/0/Guider")),
            guideport: Arc::new(SimGuidePort::new("guideport:sim/0")),
            exposure: Exposure::with_time(0.0),
        }
    }

    fn work(calibration: BasicCalibration, tracker: Arc<dyn Tracker>) -> GuidingResult<TrackingWork> {
        let devices = devices();
        let driving = Arc::new(DrivingWork::new(devices.guideport.clone(), 1.0));
        let config = GuidingConfig {
            interval_secs: 1.0,
            ..GuidingConfig::default()
        };
        TrackingWork::new(calibration, tracker, devices, driving, &config)
    }

    #[test]
    fn test_uncalibrated_rejected() {
        let result = work(BasicCalibration::new(), Arc::new(|_: &ImagePtr| Point::default()));
        assert!(matches!(result, Err(GuidingError::Uncalibrated)));
    }

    #[test]
    fn test_interval_setter() {
        let calibration = BasicCalibration::from_coefficients([10.0, 0.0, 0.0, 0.0, 10.0, 0.0]);
        let mut work = work(calibration, Arc::new(|_: &ImagePtr| Point::default())).unwrap();
        assert_eq!(work.set_interval(0.5), Err(GuidingError::InvalidInterval(0.5)));
        work.set_interval(5.0).unwrap();
        assert_eq!(work.interval(), 5.0);
        work.set_gain(0.5);
        assert_eq!(work.gain(), 0.5);
    }

    #[test]
    fn test_loss_of_tracking_ends_loop() {
        let calibration = BasicCalibration::from_coefficients([10.0, 0.0, 0.0, 0.0, 10.0, 0.0]);
        let work = work(
            calibration,
            Arc::new(|_: &ImagePtr| Point::new(f64::NAN, 0.0)),
        )
        .unwrap();
        let token = CancellationToken::new();
        assert!(work.run(&token).is_ok());
        assert!(work.last_action().is_none());
    }

    #[test]
    fn test_correction_is_clamped() {
        let calibration = BasicCalibration::from_coefficients([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let work = work(calibration, Arc::new(|_: &ImagePtr| Point::new(50.0, -50.0))).unwrap();
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(matches!(work.cycle(&token, start, None), Ok(Cycle::Continue)));
        let last = work.last_action().unwrap();
        assert_eq!(last.correction, Point::new(-1.0, 1.0));
        assert_eq!(last.tracking_offset, Point::new(50.0, -50.0));
    }

    #[test]
    fn test_device_failure_propagates() {
        let devices = devices();
        let ccd = Arc::new(SimCcd::new("ccd:sim/1/Guider"));
        ccd.set_fail_start(true);
        let devices = GuiderDevices { ccd, ..devices };
        let driving = Arc::new(DrivingWork::new(devices.guideport.clone(), 1.0));
        let calibration = BasicCalibration::from_coefficients([10.0, 0.0, 0.0, 0.0, 10.0, 0.0]);
        let work = TrackingWork::new(
            calibration,
            Arc::new(|_: &ImagePtr| Point::default()),
            devices,
            driving,
            &GuidingConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            work.run(&CancellationToken::new()),
            Err(GuidingError::Device(_))
        ));
    }
}

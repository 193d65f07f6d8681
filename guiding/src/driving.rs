//! Actuation loop
//!
//! Applies the most recently published correction to the guide port
//! about once per period, until cancelled. The correction pair is the
//! only state shared with the measurement loop.

use crate::point::Point;
use polaris_common::{CancellationToken, SharedGuidePort};
use std::sync::Mutex;
use std::time::Duration;

pub struct DrivingWork {
    guideport: SharedGuidePort,
    correction: Mutex<Point>,
    period: Duration,
}

impl DrivingWork {
    pub fn new(guideport: SharedGuidePort, period_secs: f64) -> Self {
        Self {
            guideport,
            correction: Mutex::new(Point::default()),
            period: Duration::from_secs_f64(period_secs),
        }
    }

    /// Publish a new correction; it replaces whatever was there
    pub fn set_correction(&self, tx: f64, ty: f64) {
        *self.correction.lock().unwrap_or_else(|e| e.into_inner()) = Point::new(tx, ty);
    }

    pub fn correction(&self) -> Point {
        *self.correction.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Split a signed duration into (plus, minus) magnitudes
    pub fn split(value: f64) -> (f64, f64) {
        (value.max(0.0), (-value).max(0.0))
    }

    pub fn run(&self, token: &CancellationToken) {
        tracing::debug!("actuation loop on {} started", self.guideport.name());
        loop {
            let correction = self.correction();
            let (ra_plus, ra_minus) = Self::split(correction.x);
            let (dec_plus, dec_minus) = Self::split(correction.y);
            if let Err(e) = self
                .guideport
                .activate(ra_plus, ra_minus, dec_plus, dec_minus)
            {
                tracing::warn!("guide port activation failed: {}", e);
            }
            if token.wait_timeout(self.period) {
                break;
            }
        }
        tracing::debug!("actuation loop on {} terminated", self.guideport.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polaris_common::simulator::SimGuidePort;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_split() {
        assert_eq!(DrivingWork::split(0.4), (0.4, 0.0));
        assert_eq!(DrivingWork::split(-0.3), (0.0, 0.3));
        assert_eq!(DrivingWork::split(0.0), (0.0, 0.0));
    }

    #[test]
    fn test_applies_latest_correction() {
        let port = Arc::new(SimGuidePort::new("guideport:sim/0"));
        let driving = Arc::new(DrivingWork::new(port.clone(), 0.02));
        driving.set_correction(0.5, -0.25);
        let token = CancellationToken::new();
        let handle = {
            let driving = driving.clone();
            let token = token.clone();
            thread::spawn(move || driving.run(&token))
        };
        thread::sleep(Duration::from_millis(100));
        driving.set_correction(-0.1, 0.2);
        thread::sleep(Duration::from_millis(100));
        token.cancel();
        handle.join().unwrap();

        let activations = port.activations();
        assert!(activations.len() >= 2);
        assert_eq!(activations[0], [0.5, 0.0, 0.0, 0.25]);
        assert_eq!(port.last_activation(), Some([0.0, 0.1, 0.2, 0.0]));
    }
}

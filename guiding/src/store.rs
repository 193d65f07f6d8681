//! Tracking history
//!
//! Every guiding session is a `GuidingRun`; each guide cycle appends a
//! `TrackingPoint` to it.

use crate::error::{GuidingError, GuidingResult};
use crate::point::Point;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidingRun {
    pub id: Uuid,
    pub instrument: String,
    pub ccd: String,
    pub guideport: String,
    pub calibration_id: i64,
    pub started: DateTime<Utc>,
}

impl GuidingRun {
    pub fn new(instrument: &str, ccd: &str, guideport: &str, calibration_id: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            ccd: ccd.to_string(),
            guideport: guideport.to_string(),
            calibration_id,
            started: Utc::now(),
        }
    }
}

/// Result of one guide cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackingPoint {
    pub when: DateTime<Utc>,
    /// Star offset measured by the tracker
    pub tracking_offset: Point,
    /// Activation published to the guide port
    pub correction: Point,
}

pub trait TrackingStore: Send + Sync {
    fn add_run(&self, run: &GuidingRun) -> GuidingResult<()>;

    fn add_point(&self, run: Uuid, point: &TrackingPoint) -> GuidingResult<()>;

    fn runs(&self) -> GuidingResult<Vec<GuidingRun>>;

    fn points(&self, run: Uuid) -> GuidingResult<Vec<TrackingPoint>>;
}

#[derive(Debug, Default)]
pub struct MemoryTrackingStore {
    runs: Mutex<Vec<GuidingRun>>,
    points: Mutex<HashMap<Uuid, Vec<TrackingPoint>>>,
}

impl MemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrackingStore for MemoryTrackingStore {
    fn add_run(&self, run: &GuidingRun) -> GuidingResult<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.iter().any(|r| r.id == run.id) {
            return Err(GuidingError::Store(format!("run {} already exists", run.id)));
        }
        runs.push(run.clone());
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id, Vec::new());
        Ok(())
    }

    fn add_point(&self, run: Uuid, point: &TrackingPoint) -> GuidingResult<()> {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let history = points
            .get_mut(&run)
            .ok_or_else(|| GuidingError::Store(format!("unknown run {}", run)))?;
        history.push(*point);
        Ok(())
    }

    fn runs(&self) -> GuidingResult<Vec<GuidingRun>> {
        Ok(self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn points(&self, run: Uuid) -> GuidingResult<Vec<TrackingPoint>> {
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run)
            .cloned()
            .ok_or_else(|| GuidingError::Store(format!("unknown run {}", run)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_append_to_run() {
        let store = MemoryTrackingStore::new();
        let run = GuidingRun::new("EQ", "ccd:sim/0/Guider", "guideport:sim/0", 4);
        store.add_run(&run).unwrap();
        let point = TrackingPoint {
            when: Utc::now(),
            tracking_offset: Point::new(0.1, -0.2),
            correction: Point::new(-0.01, 0.02),
        };
        store.add_point(run.id, &point).unwrap();
        store.add_point(run.id, &point).unwrap();
        assert_eq!(store.points(run.id).unwrap().len(), 2);
        assert_eq!(store.runs().unwrap(), vec![run]);
    }

    #[test]
    fn test_unknown_run() {
        let store = MemoryTrackingStore::new();
        let point = TrackingPoint {
            when: Utc::now(),
            tracking_offset: Point::default(),
            correction: Point::default(),
        };
        assert!(store.add_point(Uuid::new_v4(), &point).is_err());
        assert!(store.points(Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_duplicate_run_rejected() {
        let store = MemoryTrackingStore::new();
        let run = GuidingRun::new("EQ", "ccd", "port", 0);
        store.add_run(&run).unwrap();
        assert!(store.add_run(&run).is_err());
    }
}

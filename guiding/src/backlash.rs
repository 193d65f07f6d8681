//! Backlash analysis
//!
//! A backlash probe moves one axis in a repeating four phase cycle
//! (forward, forward, backward, backward) and records the star position
//! after each move. The analysis finds the axis the star moves along,
//! removes drift, and fits separate run rates for the phases so that lost
//! motion on direction reversal shows up as a difference between them.

use crate::error::{GuidingError, GuidingResult};
use crate::regression::{least_squares, LinearRegression};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BacklashDirection {
    #[default]
    Ra,
    Dec,
}

impl fmt::Display for BacklashDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BacklashDirection::Ra => f.write_str("RA"),
            BacklashDirection::Dec => f.write_str("DEC"),
        }
    }
}

/// Star position recorded after one probe move
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacklashPoint {
    pub id: usize,
    pub time: f64,
    pub xoffset: f64,
    pub yoffset: f64,
}

impl BacklashPoint {
    pub fn new(id: usize, time: f64, xoffset: f64, yoffset: f64) -> Self {
        Self {
            id,
            time,
            xoffset,
            yoffset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BacklashResult {
    pub direction: BacklashDirection,
    pub interval: f64,
    pub lastpoints: usize,
    /// Unit vector of the axis the star moves along
    pub x: f64,
    pub y: f64,
    /// Drift along the axis in pixels per second
    pub drift: f64,
    /// Standard deviation perpendicular to the axis
    pub lateral: f64,
    /// Variance of the residuals along the axis
    pub longitudinal: f64,
    pub f: f64,
    pub forward: f64,
    pub b: f64,
    pub backward: f64,
    pub offset: f64,
}

impl BacklashResult {
    /// Position along the axis predicted for a point, given the number of
    /// moves made so far in each phase
    pub fn model(&self, k: &[usize; 4], point: &BacklashPoint) -> f64 {
        self.f * k[0] as f64 + self.forward * k[1] as f64
            - self.b * k[2] as f64
            - self.backward * k[3] as f64
            + self.offset
            + self.drift * point.time
    }

    pub fn project(&self, point: &BacklashPoint) -> f64 {
        point.xoffset * self.x + point.yoffset * self.y
    }
}

impl fmt::Display for BacklashResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} axis=({:.3},{:.3}) drift={:.4} f={:.3} forward={:.3} b={:.3} backward={:.3} \
             offset={:.3} lateral={:.4} longitudinal={:.4}",
            self.direction,
            self.x,
            self.y,
            self.drift,
            self.f,
            self.forward,
            self.b,
            self.backward,
            self.offset,
            self.lateral,
            self.longitudinal
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacklashAnalysis {
    pub direction: BacklashDirection,
    /// Seconds between probe moves
    pub interval: f64,
    /// Analyse only about this many trailing points, 0 for all
    pub lastpoints: usize,
}

impl BacklashAnalysis {
    pub fn new(direction: BacklashDirection, interval: f64) -> Self {
        Self {
            direction,
            interval,
            lastpoints: 0,
        }
    }

    pub fn with_lastpoints(mut self, lastpoints: usize) -> Self {
        self.lastpoints = lastpoints;
        self
    }

    /// Index of the first point of the analysis window
    ///
    /// Always a multiple of four, so the window starts on phase 0.
    pub fn begin(&self, points: &[BacklashPoint]) -> usize {
        if self.lastpoints == 0 {
            return 0;
        }
        let limit = points.len() as i64 - self.lastpoints as i64 - 4;
        let mut counter = 0i64;
        while counter < limit {
            counter += 4;
        }
        counter as usize
    }

    pub fn analyze(&self, points: &[BacklashPoint]) -> GuidingResult<BacklashResult> {
        if points.len() < 8 {
            return Err(GuidingError::NotEnoughPoints {
                needed: 8,
                got: points.len(),
            });
        }
        let start = self.begin(points);
        let window = &points[start..];
        let n = window.len();
        if n < 5 {
            return Err(GuidingError::NotEnoughPoints { needed: 5, got: n });
        }
        tracing::debug!(
            "analysing {} of {} backlash points in {}",
            n,
            points.len(),
            self.direction
        );

        let mut r = BacklashResult {
            direction: self.direction,
            interval: self.interval,
            lastpoints: self.lastpoints,
            ..BacklashResult::default()
        };

        let (x, y) = principal_axis(&covariance(window));
        r.x = x;
        r.y = y;
        r.drift = drift(points, x, y)?;

        let nf = n as f64;
        let correction = nf / (nf - 1.0);
        let (l, l2) = window.iter().fold((0.0, 0.0), |(l, l2), p| {
            let lateral = p.xoffset * y - p.yoffset * x;
            (l + lateral, l2 + lateral * lateral)
        });
        r.lateral = (((l2 / nf) - (l / nf).powi(2)) * correction).max(0.0).sqrt();

        let mut a = DMatrix::<f64>::zeros(n, 5);
        let mut b = DVector::<f64>::zeros(n);
        let mut k = [0usize; 4];
        for (s, p) in window.iter().enumerate() {
            a[(s, 0)] = k[0] as f64;
            a[(s, 1)] = k[1] as f64;
            a[(s, 2)] = -(k[2] as f64);
            a[(s, 3)] = -(k[3] as f64);
            a[(s, 4)] = 1.0;
            b[s] = r.project(p) - r.drift * p.time;
            k[s % 4] += 1;
        }
        // successive differences, from the bottom up
        for t in (1..n).rev() {
            for c in 0..5 {
                a[(t, c)] -= a[(t - 1, c)];
            }
            b[t] -= b[t - 1];
        }

        let solution = least_squares(&a, &b)?;
        r.f = solution[0];
        r.forward = solution[1];
        r.b = solution[2];
        r.backward = solution[3];
        r.offset = solution[4];

        let mut k = [0usize; 4];
        let (d, d2) = window.iter().enumerate().fold((0.0, 0.0), |(d, d2), (s, p)| {
            let delta = r.project(p) - r.model(&k, p);
            k[s % 4] += 1;
            (d + delta, d2 + delta * delta)
        });
        r.longitudinal = ((d2 / nf) - (d / nf).powi(2)) * correction;

        tracing::info!("backlash analysis: {}", r);
        Ok(r)
    }
}

/// Covariance `[cxx, cxy, cyx, cyy]` of the point offsets
fn covariance(points: &[BacklashPoint]) -> [f64; 4] {
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.xoffset).sum::<f64>() / n;
    let my = points.iter().map(|p| p.yoffset).sum::<f64>() / n;
    let mut c = [0.0; 4];
    for p in points {
        let dx = p.xoffset - mx;
        let dy = p.yoffset - my;
        c[0] += dx * dx;
        c[1] += dx * dy;
        c[3] += dy * dy;
    }
    c[2] = c[1];
    c.map(|v| v / n)
}

/// Unit eigenvector of the largest eigenvalue of a symmetric 2x2 matrix
fn principal_axis(c: &[f64; 4]) -> (f64, f64) {
    let trace = c[0] + c[3];
    let det = c[0] * c[3] - c[1] * c[2];
    let lambda1 = trace / 2.0 + ((trace * trace / 4.0) - det).max(0.0).sqrt();
    let (x, y) = (lambda1 - c[3], c[2]);
    let length = x.hypot(y);
    if length > f64::EPSILON * lambda1.abs().max(1.0) {
        (x / length, y / length)
    } else if c[0] >= c[3] {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    }
}

/// Drift along the axis, averaged over the per-phase regressions
fn drift(points: &[BacklashPoint], x: f64, y: f64) -> GuidingResult<f64> {
    let mut phases: [Vec<(f64, f64)>; 4] = Default::default();
    for (j, p) in points.iter().enumerate() {
        phases[j % 4].push((p.time, p.xoffset * x + p.yoffset * y));
    }
    let mut total = 0.0;
    for phase in &phases {
        total += LinearRegression::new(phase)?.a;
    }
    Ok(total / 4.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const AXIS: (f64, f64) = (0.6, 0.8);

    /// Points generated from the model itself, with optional noise across
    /// the axis
    fn synthetic(truth: &BacklashResult, cycles: usize, lateral_noise: f64) -> Vec<BacklashPoint> {
        let mut k = [0usize; 4];
        (0..4 * cycles)
            .map(|s| {
                let time = s as f64 * 5.0;
                let along = truth.model(&k, &BacklashPoint::new(s, time, 0.0, 0.0));
                k[s % 4] += 1;
                let across = if s % 2 == 0 { lateral_noise } else { -lateral_noise };
                BacklashPoint::new(
                    s,
                    time,
                    along * AXIS.0 + across * AXIS.1,
                    along * AXIS.1 - across * AXIS.0,
                )
            })
            .collect()
    }

    fn truth() -> BacklashResult {
        BacklashResult {
            drift: 0.02,
            f: 2.0,
            forward: 3.0,
            b: 1.0,
            backward: 4.0,
            offset: 0.5,
            ..BacklashResult::default()
        }
    }

    #[test]
    fn test_begin_window() {
        let points: Vec<BacklashPoint> = (0..40)
            .map(|i| BacklashPoint::new(i, i as f64, 0.0, 0.0))
            .collect();
        let all = BacklashAnalysis::new(BacklashDirection::Ra, 5.0);
        assert_eq!(all.begin(&points), 0);
        assert_eq!(all.with_lastpoints(16).begin(&points), 20);
        assert_eq!(all.with_lastpoints(38).begin(&points), 0);
        assert_eq!(all.with_lastpoints(8).begin(&points), 28);
    }

    #[test]
    fn test_recovers_clean_model() {
        let points = synthetic(&truth(), 6, 0.0);
        let result = BacklashAnalysis::new(BacklashDirection::Dec, 5.0)
            .analyze(&points)
            .unwrap();
        assert_abs_diff_eq!(result.x, AXIS.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.y, AXIS.1, epsilon = 1e-9);
        assert_abs_diff_eq!(result.drift, 0.02, epsilon = 1e-9);
        assert_abs_diff_eq!(result.f, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.forward, 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.b, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.backward, 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.offset, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(result.lateral, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.longitudinal, 0.0, epsilon = 1e-6);
        assert_eq!(result.direction, BacklashDirection::Dec);
    }

    #[test]
    fn test_lateral_noise() {
        let noise = 0.01;
        let points = synthetic(&truth(), 8, noise);
        let result = BacklashAnalysis::new(BacklashDirection::Ra, 5.0)
            .analyze(&points)
            .unwrap();
        assert!(result.lateral > 0.5 * noise && result.lateral < 2.0 * noise);
        assert_abs_diff_eq!(result.forward, 3.0, epsilon = 0.1);
        assert_abs_diff_eq!(result.backward, 4.0, epsilon = 0.1);
    }

    #[test]
    fn test_too_few_points() {
        let points = synthetic(&truth(), 1, 0.0);
        assert_eq!(
            BacklashAnalysis::new(BacklashDirection::Ra, 5.0).analyze(&points),
            Err(GuidingError::NotEnoughPoints { needed: 8, got: 4 })
        );
    }

    #[test]
    fn test_principal_axis_degenerate() {
        assert_eq!(principal_axis(&[0.0, 0.0, 0.0, 2.0]), (0.0, 1.0));
        assert_eq!(principal_axis(&[0.0; 4]), (1.0, 0.0));
        let (x, y) = principal_axis(&[1.0, 1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(x, y, epsilon = 1e-12);
    }
}

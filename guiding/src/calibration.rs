//! Guider calibration
//!
//! A calibration is the affine map from guide port activation to star
//! displacement on the guide camera:
//!
//! ```text
//! offset(p, Δt) = s·L·p + d·Δt      L = [a0 a1; a3 a4], d = (a2, a5)
//! ```
//!
//! where `s` is -1 for a flipped calibration and +1 otherwise. The
//! coefficients are fitted by least squares from calibration points.

use crate::error::{GuidingError, GuidingResult};
use crate::point::Point;
use crate::regression::least_squares;
use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One observation made while calibrating
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Seconds since the start of the calibration run
    pub t: f64,
    /// Activation applied, x = RA seconds, y = DEC seconds
    pub offset: Point,
    /// Measured star position in pixels
    pub star: Point,
}

impl CalibrationPoint {
    pub fn new(t: f64, offset: Point, star: Point) -> Self {
        Self { t, offset, star }
    }
}

/// Which control device a calibration drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalibrationType {
    #[default]
    GuiderPort,
    AdaptiveOptics,
}

impl fmt::Display for CalibrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationType::GuiderPort => f.write_str("GP"),
            CalibrationType::AdaptiveOptics => f.write_str("AO"),
        }
    }
}

impl FromStr for CalibrationType {
    type Err = GuidingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GP" => Ok(CalibrationType::GuiderPort),
            "AO" => Ok(CalibrationType::AdaptiveOptics),
            other => Err(GuidingError::Parse(format!("unknown calibration type {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicCalibration {
    /// Database id, 0 while unsaved
    pub id: i64,
    pub calibration_type: CalibrationType,
    a: [f64; 6],
    complete: bool,
    flipped: bool,
    when: DateTime<Utc>,
    points: Vec<CalibrationPoint>,
}

impl Default for BasicCalibration {
    fn default() -> Self {
        Self {
            id: 0,
            calibration_type: CalibrationType::GuiderPort,
            a: [0.0; 6],
            complete: false,
            flipped: false,
            when: Utc::now(),
            points: Vec::new(),
        }
    }
}

impl BasicCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a calibration from known coefficients
    ///
    /// The result is not `complete`, since it was never fitted.
    pub fn from_coefficients(a: [f64; 6]) -> Self {
        Self {
            a,
            ..Self::default()
        }
    }

    pub fn coefficients(&self) -> &[f64; 6] {
        &self.a
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_flipped(&self) -> bool {
        self.flipped
    }

    pub fn set_flipped(&mut self, flipped: bool) {
        self.flipped = flipped;
    }

    pub fn when(&self) -> DateTime<Utc> {
        self.when
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn add(&mut self, point: CalibrationPoint) {
        self.points.push(point);
    }

    pub fn clear_points(&mut self) {
        self.points.clear();
    }

    /// Forget the fit; points are kept
    pub fn reset(&mut self) {
        self.a = [0.0; 6];
        self.complete = false;
    }

    /// Take over another calibration, keeping our id if we have one
    pub fn copy_from(&mut self, other: &BasicCalibration) {
        let id = if self.id > 0 { self.id } else { other.id };
        *self = other.clone();
        self.id = id;
    }

    fn sign(&self) -> f64 {
        if self.flipped {
            -1.0
        } else {
            1.0
        }
    }

    pub fn det(&self) -> f64 {
        self.a[0] * self.a[4] - self.a[1] * self.a[3]
    }

    /// Whether `correction` can be computed
    pub fn is_usable(&self) -> bool {
        let det = self.det();
        det.is_finite() && det != 0.0
    }

    /// Fit the coefficients to the recorded points
    pub fn calibrate(&mut self) -> GuidingResult<()> {
        let n = self.points.len();
        if n < 4 {
            return Err(GuidingError::NotEnoughPoints { needed: 4, got: n });
        }
        let s = self.sign();
        let mut a = DMatrix::<f64>::zeros(2 * n, 8);
        let mut b = DVector::<f64>::zeros(2 * n);
        for (i, p) in self.points.iter().enumerate() {
            let (rx, ry) = (2 * i, 2 * i + 1);
            a[(rx, 0)] = s * p.offset.x;
            a[(rx, 1)] = s * p.offset.y;
            a[(rx, 2)] = p.t;
            a[(rx, 6)] = 1.0;
            b[rx] = p.star.x;

            a[(ry, 3)] = s * p.offset.x;
            a[(ry, 4)] = s * p.offset.y;
            a[(ry, 5)] = p.t;
            a[(ry, 7)] = 1.0;
            b[ry] = p.star.y;
        }

        let x = least_squares(&a, &b)?;
        for (i, coefficient) in self.a.iter_mut().enumerate() {
            *coefficient = x[i];
        }
        self.complete = true;
        self.when = Utc::now();
        tracing::debug!("calibration origin: ({:.3}, {:.3})", x[6], x[7]);
        tracing::info!(
            "calibrated from {} points: {} det={:.4} quality={:.3}",
            n,
            self,
            self.det(),
            self.quality()
        );
        Ok(())
    }

    /// Star displacement caused by `point` applied for `deltat` seconds
    pub fn offset(&self, point: Point, deltat: f64) -> Point {
        let s = self.sign();
        let a = &self.a;
        Point::new(
            s * (a[0] * point.x + a[1] * point.y) + a[2] * deltat,
            s * (a[3] * point.x + a[4] * point.y) + a[5] * deltat,
        )
    }

    /// Activation that produces `offset` within `deltat` seconds
    pub fn correction(&self, offset: Point, deltat: f64) -> GuidingResult<Point> {
        if !self.is_usable() {
            return Err(GuidingError::DegenerateCalibration {
                determinant: self.det(),
            });
        }
        let s = self.sign();
        let a = &self.a;
        let det = self.det();
        let dx = offset.x - deltat * a[2];
        let dy = offset.y - deltat * a[5];
        Ok(Point::new(
            s * (dx * a[4] - dy * a[1]) / det,
            s * (a[0] * dy - a[3] * dx) / det,
        ))
    }

    /// Activation per second that cancels the drift
    pub fn defaultcorrection(&self) -> GuidingResult<Point> {
        self.correction(Point::new(0.0, 0.0), 1.0)
    }

    /// How orthogonal the two control axes are, between 0 and 1
    pub fn quality(&self) -> f64 {
        let a = &self.a;
        let l1 = a[0].hypot(a[3]);
        let l2 = a[1].hypot(a[4]);
        let cos = (a[0] * a[1] + a[3] * a[4]) / (l1 * l2);
        let quality = 1.0 - cos * cos;
        if quality.is_nan() {
            0.0
        } else {
            quality
        }
    }

    /// Scale the linear part, e.g. after a binning change
    pub fn rescale(&mut self, factor: f64) {
        for i in [0, 1, 3, 4] {
            self.a[i] *= factor;
        }
    }
}

impl fmt::Display for BasicCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.a;
        write!(
            f,
            "[{},{},{};{},{},{}]",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl FromStr for BasicCalibration {
    type Err = GuidingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_error = || GuidingError::Parse(s.to_string());
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(parse_error)?;
        let values = inner
            .split(';')
            .map(|row| {
                let row: Vec<&str> = row.split(',').collect();
                if row.len() == 3 {
                    Ok(row)
                } else {
                    Err(parse_error())
                }
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .map(|v| v.trim().parse::<f64>().map_err(|_| parse_error()))
            .collect::<Result<Vec<_>, _>>()?;
        let a: [f64; 6] = values.try_into().map_err(|_| parse_error())?;
        Ok(BasicCalibration::from_coefficients(a))
    }
}

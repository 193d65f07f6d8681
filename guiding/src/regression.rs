//! Least squares primitives
//!
//! Every fit in the guiding crate goes through [`least_squares`], an SVD
//! solve that refuses rank deficient systems instead of silently
//! returning a minimum norm solution.

use crate::error::{GuidingError, GuidingResult};
use nalgebra::{DMatrix, DVector};
use std::fmt;

/// Solve `a * x ≈ b` in the least squares sense
pub fn least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> GuidingResult<DVector<f64>> {
    let (rows, cols) = a.shape();
    if rows != b.len() {
        return Err(GuidingError::Solver(format!(
            "design matrix has {} rows but right hand side has {}",
            rows,
            b.len()
        )));
    }
    if rows < cols {
        return Err(GuidingError::Solver(format!(
            "underdetermined system: {} equations for {} unknowns",
            rows, cols
        )));
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(GuidingError::Solver("non-finite input".to_string()));
    }

    let svd = a.clone().svd(true, true);
    let largest = svd.singular_values.max();
    let tolerance = largest * rows.max(cols) as f64 * f64::EPSILON;
    let rank = svd.rank(tolerance);
    if largest == 0.0 || rank < cols {
        return Err(GuidingError::Solver(format!(
            "rank deficient system: rank {} of {}",
            rank, cols
        )));
    }
    svd.solve(b, tolerance)
        .map_err(|e| GuidingError::Solver(e.to_string()))
}

/// Straight line fit `y = a * x + b`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearRegression {
    /// Slope
    pub a: f64,
    /// Intercept
    pub b: f64,
}

impl LinearRegression {
    pub fn new(data: &[(f64, f64)]) -> GuidingResult<Self> {
        if data.len() < 2 {
            return Err(GuidingError::NotEnoughPoints {
                needed: 2,
                got: data.len(),
            });
        }
        let a = DMatrix::from_fn(data.len(), 2, |i, j| if j == 0 { data[i].0 } else { 1.0 });
        let b = DVector::from_iterator(data.len(), data.iter().map(|(_, y)| *y));
        let x = least_squares(&a, &b)?;
        let result = Self { a: x[0], b: x[1] };
        tracing::debug!("regression over {} points: {}", data.len(), result);
        Ok(result)
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.a * x + self.b
    }
}

impl fmt::Display for LinearRegression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "y = {:.6} * x + {:.6}", self.a, self.b)
    }
}

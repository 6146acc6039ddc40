//! Calibration windows: a parameter estimate over a contiguous pose range.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::optimizer::numerical_rank;

/// Mean and covariance of the calibration parameters estimated from poses
/// `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationWindow {
    pub start: usize,
    pub end: usize,
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Weighted generalized variance, `det(W Σ W)^(1/n)`.
    pub uncertainty: f64,
    /// `1 / uncertainty`; zero when that is not a positive finite number.
    pub score: f64,
}

impl CalibrationWindow {
    pub fn empty() -> Self {
        Self {
            start: 0,
            end: 0,
            mean: DVector::zeros(0),
            covariance: DMatrix::zeros(0, 0),
            uncertainty: 0.0,
            score: 0.0,
        }
    }

    pub fn new(start: usize, end: usize, mean: DVector<f64>, covariance: DMatrix<f64>, weights: &[f64]) -> Self {
        let (uncertainty, score) = window_score(&covariance, weights);
        Self {
            start,
            end,
            mean,
            covariance,
            uncertainty,
            score,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn num_poses(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn rank(&self) -> usize {
        numerical_rank(&self.covariance)
    }

    /// Only full-rank windows carry information in every parameter
    /// direction and may be written to a rig.
    pub fn is_applicable(&self) -> bool {
        let n = self.dim();
        n != 0 && self.covariance.nrows() == n && self.rank() == n
    }

    pub fn overlaps(&self, other: &CalibrationWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Leading `n` parameters of the window.
    pub fn leading(&self, n: usize) -> CalibrationWindow {
        let n = n.min(self.dim());
        CalibrationWindow {
            mean: self.mean.rows(0, n).into_owned(),
            covariance: self.covariance.view((0, 0), (n, n)).into_owned(),
            ..self.clone()
        }
    }
}

/// Returns `(uncertainty, score)` for a covariance.
///
/// `weights` rescale each parameter so parameters with very different units
/// contribute comparably. Only the leading `n` weights are used; a shorter
/// weight vector is ignored.
pub fn window_score(covariance: &DMatrix<f64>, weights: &[f64]) -> (f64, f64) {
    let n = covariance.nrows();
    if n == 0 || covariance.ncols() != n {
        return (0.0, 0.0);
    }
    let w = if weights.len() >= n {
        DVector::from_column_slice(&weights[..n])
    } else {
        DVector::from_element(n, 1.0)
    };
    let weighted = DMatrix::from_fn(n, n, |r, c| w[r] * covariance[(r, c)] * w[c]);
    let det = weighted.determinant();
    let uncertainty = if det.is_finite() && det > 0.0 {
        det.powf(1.0 / n as f64)
    } else {
        0.0
    };
    let score = 1.0 / uncertainty;
    if score.is_finite() && score > 0.0 {
        (uncertainty, score)
    } else {
        (uncertainty, 0.0)
    }
}

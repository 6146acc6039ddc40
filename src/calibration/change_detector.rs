//! Calibration change detection.
//!
//! The newest candidate window is compared with the queue's aggregate by a
//! two-sample test on their means. A small p-value means the candidate is
//! unlikely to come from the same parameters. A change is declared only
//! after a run of consecutive qualifying comparisons.

use tracing::{debug, info};

use crate::stats::yao_1965;

use super::window::CalibrationWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVerdict {
    /// The comparison did not qualify; the counter is back at zero.
    Reset,
    /// Qualifying comparisons so far.
    Accumulating(u32),
    ChangeDetected,
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    threshold: f64,
    num_change_needed: u32,
    counter: u32,
}

impl ChangeDetector {
    pub fn new(threshold: f64, num_change_needed: u32) -> Self {
        Self {
            threshold,
            num_change_needed,
            counter: 0,
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn num_change_needed(&self) -> u32 {
        self.num_change_needed
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// Divergence between the aggregate and a candidate window.
    ///
    /// When the candidate has lost exactly one direction of information both
    /// windows are compared on their leading parameters only. Any value the
    /// test cannot produce, or produces as NaN/Inf, is reported as 0.
    pub fn divergence(&self, aggregate: &CalibrationWindow, candidate: &CalibrationWindow) -> f64 {
        let n = candidate.dim();
        if n == 0 || aggregate.dim() != n {
            return 0.0;
        }
        let (a, c) = if n > 1 && candidate.rank() == n - 1 {
            (aggregate.leading(n - 1), candidate.leading(n - 1))
        } else {
            (aggregate.clone(), candidate.clone())
        };
        let p = yao_1965(
            &a.mean,
            &a.covariance,
            a.num_poses(),
            &c.mean,
            &c.covariance,
            c.num_poses(),
        )
        .unwrap_or(0.0);
        if p.is_finite() {
            p
        } else {
            0.0
        }
    }

    /// Feeds one comparison.
    ///
    /// A comparison qualifies when the divergence is non-zero and below the
    /// threshold, the queue is full and the calibration is known. A change is
    /// declared once the qualifying run exceeds `num_change_needed`.
    pub fn evaluate(&mut self, divergence: f64, queue_full: bool, known: bool) -> ChangeVerdict {
        let qualifies = divergence != 0.0 && divergence < self.threshold && queue_full && known;
        if !qualifies {
            if self.counter > 0 {
                debug!(divergence, counter = self.counter, "change detection counter reset");
            }
            self.counter = 0;
            return ChangeVerdict::Reset;
        }
        self.counter += 1;
        if self.counter > self.num_change_needed {
            info!(divergence, counter = self.counter, "calibration change detected");
            self.counter = 0;
            return ChangeVerdict::ChangeDetected;
        }
        debug!(divergence, counter = self.counter, "weak divergence");
        ChangeVerdict::Accumulating(self.counter)
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(0.2, 3)
    }
}

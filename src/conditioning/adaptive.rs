//! Adaptive sizing of the active bundle-adjustment window.
//!
//! After every conditioning solve the residuals on the boundary between the
//! fixed poses and the active window are compared with chi-squared critical
//! values. A boundary that explains its residuals poorly while the total
//! boundary error is still falling means the fixed pose is not constraining
//! the window well enough, so the window grows. Anything else resets it to
//! the baseline.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::optimizer::ConditioningStats;
use crate::stats::chi2_inv;

/// Dimension of an inertial residual.
const INERTIAL_DIM: f64 = 15.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditioningConfig {
    pub enabled: bool,
    /// Active window size the loop falls back to.
    pub baseline_poses: usize,
    /// Poses added per growth step.
    pub increment: usize,
    pub confidence: f64,
    /// Minimum relative decrease of the boundary error that still counts
    /// as progress.
    pub relative_tolerance: f64,
    /// The loop only runs once the graph holds more poses than this.
    pub min_poses: usize,
    pub idle_interval_ms: u64,
    pub iterations: usize,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baseline_poses: 20,
            increment: 30,
            confidence: 0.99,
            relative_tolerance: 1e-5,
            min_poses: 10,
            idle_interval_ms: 10,
            iterations: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    Grow,
    Reset,
    /// Nothing measurable on the boundary.
    NoChange,
}

/// Boundary residual magnitudes relative to their critical values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditioningRatios {
    pub inertial: f64,
    pub visual: f64,
}

impl ConditioningRatios {
    pub fn exceeded(&self) -> bool {
        self.inertial > 1.0 || self.visual > 1.0
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveConditioner {
    config: ConditioningConfig,
    active_poses: usize,
    previous_error: f64,
}

impl AdaptiveConditioner {
    pub fn new(config: ConditioningConfig) -> Self {
        let active_poses = config.baseline_poses;
        Self {
            config,
            active_poses,
            previous_error: f64::MAX,
        }
    }

    pub fn config(&self) -> &ConditioningConfig {
        &self.config
    }

    pub fn active_poses(&self) -> usize {
        self.active_poses
    }

    pub fn reset(&mut self) {
        self.active_poses = self.config.baseline_poses;
        self.previous_error = f64::MAX;
    }

    /// Drops the boundary error remembered from an earlier cycle while
    /// keeping the current window. Errors from different graph states are
    /// not comparable.
    pub fn forget_error(&mut self) {
        self.previous_error = f64::MAX;
    }

    pub fn ratios(&self, stats: &ConditioningStats) -> ConditioningRatios {
        let inertial = if stats.inertial_dim > 0 {
            stats.inertial_error / chi2_inv(self.config.confidence, INERTIAL_DIM)
        } else {
            0.0
        };
        let visual = if stats.projection_count > 0 {
            stats.projection_error / chi2_inv(self.config.confidence, 2.0 * stats.projection_count as f64)
        } else {
            0.0
        };
        ConditioningRatios { inertial, visual }
    }

    /// Feeds the boundary statistics of the last conditioning solve and
    /// resizes the window. The result never exceeds `pose_count`, and never
    /// drops below the baseline once the graph holds that many poses.
    pub fn update(&mut self, stats: &ConditioningStats, pose_count: usize) -> WindowDecision {
        let total = stats.total();
        if total == 0.0 || (stats.inertial_dim == 0 && stats.projection_count == 0) {
            trace!("no conditioning residuals");
            return WindowDecision::NoChange;
        }

        let ratios = self.ratios(stats);
        let decreasing = total <= self.previous_error
            && (self.previous_error - total) / self.previous_error > self.config.relative_tolerance;

        let baseline = self.config.baseline_poses;
        let upper = pose_count;
        let lower = baseline.min(pose_count);
        let decision = if ratios.exceeded() && decreasing {
            self.active_poses = (self.active_poses + self.config.increment).min(upper);
            self.previous_error = total;
            WindowDecision::Grow
        } else {
            self.active_poses = baseline;
            self.previous_error = f64::MAX;
            WindowDecision::Reset
        };
        self.active_poses = self.active_poses.clamp(lower, upper);

        debug!(
            inertial_ratio = ratios.inertial,
            visual_ratio = ratios.visual,
            total,
            ?decision,
            active_poses = self.active_poses,
            "conditioning window updated"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inertial_stats(ratio: f64, conditioner: &AdaptiveConditioner) -> ConditioningStats {
        ConditioningStats {
            inertial_error: ratio * chi2_inv(conditioner.config().confidence, 15.0),
            inertial_dim: 15,
            projection_error: 0.0,
            projection_count: 0,
        }
    }

    #[test]
    fn test_grows_while_boundary_is_poor_and_improving() {
        let mut aac = AdaptiveConditioner::new(ConditioningConfig::default());
        let stats = inertial_stats(1.5, &aac);
        assert_eq!(aac.update(&stats, 200), WindowDecision::Grow);
        assert_eq!(aac.active_poses(), 50);

        let better = inertial_stats(1.2, &aac);
        assert_eq!(aac.update(&better, 200), WindowDecision::Grow);
        assert_eq!(aac.active_poses(), 80);
    }

    #[test]
    fn test_resets_when_boundary_is_explained() {
        let mut aac = AdaptiveConditioner::new(ConditioningConfig::default());
        aac.update(&inertial_stats(1.5, &aac), 200);
        assert_eq!(aac.active_poses(), 50);
        assert_eq!(aac.update(&inertial_stats(0.8, &aac), 200), WindowDecision::Reset);
        assert_eq!(aac.active_poses(), 20);
    }

    #[test]
    fn test_resets_when_error_stops_falling() {
        let mut aac = AdaptiveConditioner::new(ConditioningConfig::default());
        let stats = inertial_stats(1.5, &aac);
        aac.update(&stats, 200);
        assert_eq!(aac.update(&stats, 200), WindowDecision::Reset);
        assert_eq!(aac.active_poses(), 20);
    }

    #[test]
    fn test_visual_ratio_alone_triggers_growth() {
        let mut aac = AdaptiveConditioner::new(ConditioningConfig::default());
        let stats = ConditioningStats {
            projection_error: 3.0 * chi2_inv(0.99, 20.0),
            projection_count: 10,
            ..Default::default()
        };
        assert!(aac.ratios(&stats).visual > 1.0);
        assert_eq!(aac.update(&stats, 200), WindowDecision::Grow);
    }

    #[test]
    fn test_window_bounded_by_pose_count_and_baseline() {
        let mut aac = AdaptiveConditioner::new(ConditioningConfig::default());
        let mut ratio = 10.0;
        for _ in 0..10 {
            aac.update(&inertial_stats(ratio, &aac), 70);
            assert!(aac.active_poses() <= 70);
            assert!(aac.active_poses() >= 20);
            ratio *= 0.9;
        }
        assert_eq!(aac.active_poses(), 70);

        // A graph shorter than the baseline caps the window at its length.
        let mut small = AdaptiveConditioner::new(ConditioningConfig::default());
        assert_eq!(small.update(&inertial_stats(2.0, &small), 5), WindowDecision::Grow);
        assert_eq!(small.active_poses(), 5);
        assert_eq!(small.update(&inertial_stats(0.5, &small), 12), WindowDecision::Reset);
        assert_eq!(small.active_poses(), 12);
    }

    #[test]
    fn test_forgotten_error_does_not_block_growth() {
        let mut aac = AdaptiveConditioner::new(ConditioningConfig::default());
        let stats = inertial_stats(1.5, &aac);
        assert_eq!(aac.update(&stats, 200), WindowDecision::Grow);

        // Same error again in a new cycle is a fresh comparison, not a stall.
        aac.forget_error();
        assert_eq!(aac.active_poses(), 50);
        assert_eq!(aac.update(&stats, 200), WindowDecision::Grow);
        assert_eq!(aac.active_poses(), 80);
    }

    #[test]
    fn test_empty_boundary_changes_nothing() {
        let mut aac = AdaptiveConditioner::new(ConditioningConfig::default());
        aac.update(&inertial_stats(1.5, &aac), 200);
        assert_eq!(aac.update(&ConditioningStats::default(), 200), WindowDecision::NoChange);
        assert_eq!(aac.active_poses(), 50);
    }
}

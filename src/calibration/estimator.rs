//! Calibration window estimation.
//!
//! A window estimate is a bounded-iteration solve over a pose range in which
//! only the calibration parameters (and, for the extrinsic, the poses and
//! structure they couple to) are free. The marginal covariance of the
//! calibration block at the solution gives the window its uncertainty.

use std::sync::Arc;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::camera::Rig;
use crate::imu::ImuNoise;
use crate::optimizer::{
    assemble, marginal_covariance, AssemblyOptions, GraphSnapshot, IntrinsicsMode, NonlinearSolver, SolveSummary,
    SolverOptions,
};

use super::window::CalibrationWindow;

/// Which calibration block a window estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationTarget {
    /// Camera intrinsics from projection residuals only.
    Intrinsics,
    /// Body-from-camera transform from projection and inertial residuals.
    Extrinsic { rotation_only: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub sigma_px: f64,
    pub use_robust_loss: bool,
    pub huber_width_px: f64,
    /// Let landmark depths move while estimating intrinsics.
    pub refine_structure: bool,
    pub solver: SolverOptions,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            sigma_px: 1.0,
            use_robust_loss: true,
            huber_width_px: 2.0,
            refine_structure: false,
            solver: SolverOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WindowEstimate {
    pub window: CalibrationWindow,
    /// Snapshot rig with the estimated parameters written in.
    pub rig: Rig,
    pub summary: SolveSummary,
}

pub struct CalibrationWindowEstimator {
    config: EstimatorConfig,
    noise: ImuNoise,
    solver: Arc<dyn NonlinearSolver>,
}

impl CalibrationWindowEstimator {
    pub fn new(config: EstimatorConfig, noise: ImuNoise, solver: Arc<dyn NonlinearSolver>) -> Self {
        Self { config, noise, solver }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimates `target` over the snapshot's poses.
    ///
    /// Returns `None` when the snapshot holds too little data or the solve
    /// diverged. A returned window may still be rank deficient; callers
    /// check `CalibrationWindow::is_applicable` before using its mean.
    pub fn estimate(
        &self,
        snapshot: &GraphSnapshot,
        target: CalibrationTarget,
        iterations: usize,
        weights: &[f64],
    ) -> Option<WindowEstimate> {
        let start = snapshot.first_index()?;
        let end = snapshot.last_index()? + 1;
        if snapshot.poses.len() < 2 || snapshot.tracks.is_empty() {
            return None;
        }

        let options = self.assembly_options(snapshot, target);
        let mut assembled = assemble(snapshot, &options);
        let summary = self
            .solver
            .solve(&mut assembled.problem, &self.config.solver.with_iterations(iterations));

        let (blocks, mean) = match target {
            CalibrationTarget::Intrinsics => {
                let block = assembled.intrinsics?;
                (vec![block], assembled.intrinsics_params()?)
            }
            CalibrationTarget::Extrinsic { rotation_only: true } => {
                let block = assembled.extrinsic_rotation;
                (vec![block], DVector::from_column_slice(assembled.problem.block(block)))
            }
            CalibrationTarget::Extrinsic { rotation_only: false } => {
                let t = assembled.problem.block(assembled.extrinsic_translation);
                let r = assembled.problem.block(assembled.extrinsic_rotation);
                let mean = DVector::from_iterator(6, t.iter().chain(r.iter()).copied());
                (vec![assembled.extrinsic_translation, assembled.extrinsic_rotation], mean)
            }
        };
        if mean.iter().any(|v| !v.is_finite()) {
            warn!(start, end, ?target, "calibration window diverged");
            return None;
        }

        let marginal = marginal_covariance(&assembled.problem, &blocks)?;
        let window = CalibrationWindow::new(start, end, mean, marginal.covariance, weights);

        let mut rig = snapshot.rig.clone();
        match target {
            CalibrationTarget::Intrinsics => {
                rig.intrinsics.params = window.mean.clone();
            }
            CalibrationTarget::Extrinsic { .. } => {
                rig.t_vs = assembled.extrinsic();
            }
        }

        debug!(
            start,
            end,
            ?target,
            rank = marginal.rank,
            score = window.score,
            initial = summary.initial_cost,
            final_cost = summary.final_cost,
            "calibration window estimated"
        );
        Some(WindowEstimate { window, rig, summary })
    }

    fn assembly_options(&self, snapshot: &GraphSnapshot, target: CalibrationTarget) -> AssemblyOptions {
        let n = snapshot.poses.len();
        let huber_px = self.config.use_robust_loss.then_some(self.config.huber_width_px);
        match target {
            CalibrationTarget::Intrinsics => AssemblyOptions {
                free_poses: vec![false; n],
                use_imu: false,
                free_structure: self.config.refine_structure,
                fixed_track: None,
                intrinsics: IntrinsicsMode::Free,
                free_extrinsic_translation: false,
                free_extrinsic_rotation: false,
                huber_px,
                sigma_px: self.config.sigma_px,
                noise: self.noise,
            },
            CalibrationTarget::Extrinsic { rotation_only } => AssemblyOptions {
                free_poses: (0..n).map(|slot| slot > 0).collect(),
                use_imu: true,
                free_structure: true,
                fixed_track: None,
                intrinsics: IntrinsicsMode::Rig,
                free_extrinsic_translation: !rotation_only,
                free_extrinsic_rotation: true,
                huber_px,
                sigma_px: self.config.sigma_px,
                noise: self.noise,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::DenseSolver;
    use crate::simulation::{Scenario, SimulationConfig};
    use approx::assert_relative_eq;

    fn estimator() -> CalibrationWindowEstimator {
        CalibrationWindowEstimator::new(EstimatorConfig::default(), ImuNoise::default(), Arc::new(DenseSolver))
    }

    #[test]
    fn test_intrinsics_recovered_from_perturbed_rig() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, _) = sim.build_graph(10);
        let truth = sim.true_rig();
        let mut rig = truth.clone();
        rig.intrinsics.params[0] *= 1.05;
        rig.intrinsics.params[1] *= 0.96;
        rig.intrinsics.params[2] += 6.0;

        let indices: Vec<usize> = (0..10).collect();
        let snapshot = GraphSnapshot::collect(&graph, None, &rig, &indices);
        let estimate = estimator()
            .estimate(&snapshot, CalibrationTarget::Intrinsics, 30, &[])
            .unwrap();
        let window = &estimate.window;
        assert_eq!((window.start, window.end), (0, 10));
        assert!(window.is_applicable());
        assert!(window.score > 0.0);
        for i in 0..truth.intrinsics.num_params() {
            assert_relative_eq!(window.mean[i], truth.intrinsics.params[i], epsilon = 2.0);
        }
        assert_relative_eq!(estimate.rig.intrinsics.params[0], window.mean[0]);
    }

    #[test]
    fn test_longer_window_is_more_certain() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, _) = sim.build_graph(16);
        let rig = sim.true_rig();
        let est = estimator();
        let short = GraphSnapshot::collect(&graph, None, &rig, &(0..4).collect::<Vec<_>>());
        let long = GraphSnapshot::collect(&graph, None, &rig, &(0..16).collect::<Vec<_>>());
        let a = est.estimate(&short, CalibrationTarget::Intrinsics, 10, &[]).unwrap();
        let b = est.estimate(&long, CalibrationTarget::Intrinsics, 10, &[]).unwrap();
        assert!(b.window.score > a.window.score);
    }

    #[test]
    fn test_extrinsic_window_has_six_parameters() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(8);
        let rig = sim.true_rig();
        let snapshot = GraphSnapshot::collect(&graph, Some(&imu), &rig, &(0..8).collect::<Vec<_>>());
        let estimate = estimator()
            .estimate(&snapshot, CalibrationTarget::Extrinsic { rotation_only: false }, 5, &[])
            .unwrap();
        assert_eq!(estimate.window.dim(), 6);
        assert_eq!(estimate.window.covariance.nrows(), 6);
        let truth = rig.t_vs.log_decoupled();
        for i in 0..6 {
            assert_relative_eq!(estimate.window.mean[i], truth[i], epsilon = 0.05);
        }
    }

    #[test]
    fn test_empty_snapshot_yields_nothing() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, _) = sim.build_graph(3);
        let snapshot = GraphSnapshot::collect(&graph, None, &sim.true_rig(), &[1]);
        assert!(estimator()
            .estimate(&snapshot, CalibrationTarget::Intrinsics, 5, &[])
            .is_none());
    }
}

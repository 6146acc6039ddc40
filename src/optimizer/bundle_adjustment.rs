//! Sliding-window bundle adjustment over the pose graph.
//!
//! Split into three phases so the solve runs without holding the graph lock:
//!
//! 1. `collect` (graph lock held): choose the pose range and copy it out
//! 2. `solve` (no lock): assemble and solve the problem on the copy
//! 3. `apply` (graph lock held): write poses, structure and outlier flags back

use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::camera::Rig;
use crate::geometry::SE3;
use crate::graph::{BaInstance, PoseGraph, TrackId};
use crate::imu::{ImuBias, ImuBuffer, ImuNoise};

use super::problem::ResidualKind;
use super::residuals::{BiasPriorCost, PosePriorCost};
use super::snapshot::{assemble, AssemblyOptions, GraphSnapshot, IntrinsicsMode};
use super::solver::{NonlinearSolver, SolveSummary, SolverOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    /// Baseline number of free poses.
    pub num_active_poses: usize,
    pub iterations: usize,
    pub use_robust_loss: bool,
    pub huber_width_px: f64,
    pub sigma_px: f64,
    /// Outliers are only flagged, and biases only left unregularized, once
    /// this many poses exist.
    pub poses_to_init: usize,
    /// A track whose share of bad observations exceeds this is an outlier.
    pub outlier_ratio: f64,
    pub outlier_threshold_px: f64,
    pub prior_sigma_translation: f64,
    pub prior_sigma_yaw: f64,
    pub bias_prior_sigma_gyro: f64,
    pub bias_prior_sigma_accel: f64,
    pub solver: SolverOptions,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            num_active_poses: 10,
            iterations: 10,
            use_robust_loss: true,
            huber_width_px: 2.0,
            sigma_px: 1.0,
            poses_to_init: 30,
            outlier_ratio: 0.3,
            outlier_threshold_px: 3.0,
            prior_sigma_translation: 1e-3,
            prior_sigma_yaw: 1e-3,
            bias_prior_sigma_gyro: 1e-2,
            bias_prior_sigma_accel: 1e-1,
            solver: SolverOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaRequest {
    pub instance: BaInstance,
    pub num_active_poses: usize,
    pub use_imu: bool,
    /// Overrides the configured iteration budget.
    pub iterations: Option<usize>,
    /// The caller's calibration allows outlier rejection.
    pub flag_outliers: bool,
    /// Rig generation the solve is computed against.
    pub epoch: u64,
}

impl BaRequest {
    pub fn new(instance: BaInstance, num_active_poses: usize, use_imu: bool) -> Self {
        Self {
            instance,
            num_active_poses,
            use_imu,
            iterations: None,
            flag_outliers: false,
            epoch: 0,
        }
    }
}

/// Everything a solve needs, extracted from the graph.
#[derive(Debug, Clone)]
pub struct BaProblemData {
    pub request: BaRequest,
    pub snapshot: GraphSnapshot,
    pub free_poses: Vec<bool>,
    pub start_active: usize,
    pub num_poses: usize,
    pub fixed_track: Option<TrackId>,
    /// Slot receiving the translation + yaw prior.
    pub prior_slot: Option<usize>,
    pub regularize_bias: bool,
}

/// Residual statistics of the boundary between the fixed poses and the
/// active window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConditioningStats {
    /// Mahalanobis distance of the inertial residual entering the window.
    pub inertial_error: f64,
    /// Dimension of that residual, 0 when there is none.
    pub inertial_dim: usize,
    pub projection_error: f64,
    pub projection_count: usize,
}

impl ConditioningStats {
    pub fn total(&self) -> f64 {
        self.inertial_error + self.projection_error
    }
}

#[derive(Debug, Clone)]
pub struct PoseUpdate {
    pub index: usize,
    pub t_wp: SE3,
    pub v_w: Option<Vector3<f64>>,
    pub bias: Option<ImuBias>,
}

#[derive(Debug, Clone)]
pub struct BaResultData {
    pub instance: BaInstance,
    pub epoch: u64,
    pub start_active: usize,
    pub poses: Vec<PoseUpdate>,
    /// `(track, inverse depth, parameter block)`.
    pub rhos: Vec<(TrackId, f64, usize)>,
    pub outliers: Vec<TrackId>,
    pub conditioning: ConditioningStats,
    /// Mean reprojection error (px) on the newest pose.
    pub last_frame_error: Option<f64>,
    pub summary: SolveSummary,
}

pub struct BundleAdjustmentInvoker {
    config: BundleAdjustmentConfig,
    noise: ImuNoise,
    solver: Arc<dyn NonlinearSolver>,
}

impl BundleAdjustmentInvoker {
    pub fn new(config: BundleAdjustmentConfig, noise: ImuNoise, solver: Arc<dyn NonlinearSolver>) -> Self {
        Self { config, noise, solver }
    }

    pub fn config(&self) -> &BundleAdjustmentConfig {
        &self.config
    }

    /// Phase 1: choose the window and copy it out of the graph.
    pub fn collect(
        &self,
        graph: &PoseGraph,
        imu: Option<&ImuBuffer>,
        rig: &Rig,
        request: &BaRequest,
    ) -> Option<BaProblemData> {
        let n = graph.num_poses();
        if n < 2 {
            return None;
        }
        let num_active = request.num_active_poses.max(1);
        let (mut start_pose, start_active) = graph.ba_pose_range(num_active);

        // Keep the inertial edge into the window even when no landmark
        // reaches back past it.
        if request.use_imu && start_pose == start_active && start_active > 0 {
            start_pose = start_active - 1;
        }

        let indices: Vec<usize> = (start_pose..n).collect();
        let snapshot = GraphSnapshot::collect(graph, if request.use_imu { imu } else { None }, rig, &indices);

        // Without IMU the gauge is fixed by pose 0 and one landmark depth;
        // with IMU pose 0 may move but is anchored by a prior.
        let free_poses: Vec<bool> = snapshot
            .poses
            .iter()
            .map(|p| p.index >= start_active && (request.use_imu || p.index > 0))
            .collect();
        let prior_slot = (request.use_imu && start_active == 0).then_some(0);
        let fixed_track = if request.use_imu {
            None
        } else {
            graph.longest_track_id()
        };

        Some(BaProblemData {
            request: request.clone(),
            snapshot,
            free_poses,
            start_active,
            num_poses: n,
            fixed_track,
            prior_slot,
            regularize_bias: request.use_imu && n < self.config.poses_to_init,
        })
    }

    /// Phase 2: solve without touching the graph.
    pub fn solve(&self, data: &BaProblemData) -> BaResultData {
        let config = &self.config;
        let options = AssemblyOptions {
            free_poses: data.free_poses.clone(),
            use_imu: data.request.use_imu,
            free_structure: true,
            fixed_track: data.fixed_track,
            intrinsics: IntrinsicsMode::PerPose,
            free_extrinsic_translation: false,
            free_extrinsic_rotation: false,
            huber_px: config.use_robust_loss.then_some(config.huber_width_px),
            sigma_px: config.sigma_px,
            noise: self.noise,
        };
        let mut assembled = assemble(&data.snapshot, &options);

        if let Some(slot) = data.prior_slot {
            let pose = data.snapshot.poses[slot].t_wp;
            let block = assembled.pose_blocks[slot];
            assembled.problem.add_residual(
                ResidualKind::Prior,
                vec![block],
                Box::new(PosePriorCost::new(&pose, config.prior_sigma_translation, config.prior_sigma_yaw)),
                None,
                false,
            );
        }
        if data.regularize_bias {
            for (slot, pose) in data.snapshot.poses.iter().enumerate() {
                if !data.free_poses[slot] {
                    continue;
                }
                assembled.problem.add_residual(
                    ResidualKind::Prior,
                    vec![assembled.bias_blocks[slot]],
                    Box::new(BiasPriorCost {
                        bias: pose.bias,
                        sigma_gyro: config.bias_prior_sigma_gyro,
                        sigma_accel: config.bias_prior_sigma_accel,
                    }),
                    None,
                    false,
                );
            }
        }

        let iterations = data.request.iterations.unwrap_or(config.iterations);
        let summary = self
            .solver
            .solve(&mut assembled.problem, &config.solver.with_iterations(iterations));
        trace!(
            instance = ?data.request.instance,
            initial = summary.initial_cost,
            final_cost = summary.final_cost,
            iterations = summary.iterations,
            "bundle adjustment solved"
        );

        let poses = data
            .snapshot
            .poses
            .iter()
            .enumerate()
            .filter(|(slot, _)| data.free_poses[*slot])
            .map(|(slot, p)| PoseUpdate {
                index: p.index,
                t_wp: assembled.pose(slot),
                v_w: assembled.velocity(slot),
                bias: assembled.bias(slot),
            })
            .collect();

        let rhos = data
            .snapshot
            .tracks
            .iter()
            .enumerate()
            .map(|(t, track)| (track.id, assembled.rho(t), assembled.rho_blocks[t]))
            .collect();

        let mut conditioning = ConditioningStats {
            projection_error: summary.projection.conditioning.error,
            projection_count: summary.projection.conditioning.count,
            ..Default::default()
        };
        if data.start_active > 0 {
            let boundary = assembled.inertial.iter().find(|r| r.to == data.start_active);
            if let Some(error) = boundary.and_then(|r| summary.residual_error(r.residual)) {
                conditioning.inertial_error = error;
                conditioning.inertial_dim = 15;
            }
        }

        let outliers = if data.request.flag_outliers && data.num_poses > config.poses_to_init {
            self.find_outliers(data, &assembled.projections, &summary)
        } else {
            Vec::new()
        };

        let last_frame_error = data
            .snapshot
            .last_index()
            .and_then(|last| assembled.mean_pixel_error(last, config.sigma_px));

        BaResultData {
            instance: data.request.instance,
            epoch: data.request.epoch,
            start_active: data.start_active,
            poses,
            rhos,
            outliers,
            conditioning,
            last_frame_error,
            summary,
        }
    }

    fn find_outliers(
        &self,
        data: &BaProblemData,
        projections: &[super::snapshot::ProjectionRef],
        summary: &SolveSummary,
    ) -> Vec<TrackId> {
        let threshold = (self.config.outlier_threshold_px / self.config.sigma_px).powi(2);
        let mut counts = vec![(0usize, 0usize); data.snapshot.tracks.len()];
        for p in projections {
            let Some(error) = summary.residual_error(p.residual) else { continue };
            counts[p.track].1 += 1;
            if error > threshold {
                counts[p.track].0 += 1;
            }
        }
        data.snapshot
            .tracks
            .iter()
            .zip(counts)
            .filter(|(track, (bad, total))| {
                !track.tracked && *total > 0 && (*bad as f64 / *total as f64) > self.config.outlier_ratio
            })
            .map(|(track, _)| track.id)
            .collect()
    }

    /// Phase 3: write the solution back. Returns the number of poses updated.
    pub fn apply(&self, graph: &mut PoseGraph, result: &BaResultData) -> usize {
        let instance = result.instance.index();
        let mut updated = 0;
        for update in &result.poses {
            let Some(pose) = graph.pose_mut(update.index) else { continue };
            pose.t_wp = update.t_wp;
            if let Some(v) = update.v_w {
                pose.v_w = v;
            }
            if let Some(b) = update.bias {
                pose.bias = b;
            }
            updated += 1;
        }
        if result.instance == BaInstance::Tracking {
            for (index, pose) in graph.poses_mut().iter_mut().enumerate() {
                pose.is_active = index >= result.start_active;
            }
        }
        for &(id, rho, block) in &result.rhos {
            if let Some(track) = graph.track_mut(id) {
                track.ref_keypoint.rho = rho;
                track.ba_handles[instance] = Some(block);
            }
        }
        for &id in &result.outliers {
            if let Some(track) = graph.track_mut(id) {
                track.is_outlier = true;
            }
        }
        if !result.outliers.is_empty() {
            debug!(count = result.outliers.len(), "tracks flagged as outliers");
        }
        updated
    }

    /// All three phases on a graph the caller already holds exclusively.
    pub fn run(
        &self,
        graph: &mut PoseGraph,
        imu: Option<&ImuBuffer>,
        rig: &Rig,
        request: &BaRequest,
    ) -> Option<BaResultData> {
        let data = self.collect(graph, imu, rig, request)?;
        let result = self.solve(&data);
        self.apply(graph, &result);
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::solver::DenseSolver;
    use crate::simulation::{Scenario, SimulationConfig};
    use nalgebra::UnitQuaternion;

    fn invoker() -> BundleAdjustmentInvoker {
        BundleAdjustmentInvoker::new(
            BundleAdjustmentConfig::default(),
            ImuNoise::default(),
            Arc::new(DenseSolver),
        )
    }

    #[test]
    fn test_visual_ba_reduces_cost_after_perturbation() {
        let sim = Scenario::new(SimulationConfig::default());
        let (mut graph, _) = sim.build_graph(8);
        let truth = graph.pose(7).unwrap().t_wp;
        let nudge = SE3::from_rt(UnitQuaternion::from_euler_angles(0.01, -0.01, 0.0), Vector3::new(0.02, 0.0, -0.02));
        graph.pose_mut(7).unwrap().t_wp = truth.compose(&nudge);

        let request = BaRequest::new(BaInstance::Tracking, 4, false);
        let result = invoker().run(&mut graph, None, &sim.true_rig(), &request).unwrap();
        assert!(result.summary.final_cost < result.summary.initial_cost);
        assert_eq!(result.start_active, 4);
        assert!(graph.pose(3).map(|p| !p.is_active).unwrap());
        assert!(graph.pose(7).map(|p| p.is_active).unwrap());
        assert!(result.last_frame_error.unwrap() < 2.0);
    }

    #[test]
    fn test_pose_zero_fixed_without_imu() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, _) = sim.build_graph(4);
        let data = invoker()
            .collect(&graph, None, &sim.true_rig(), &BaRequest::new(BaInstance::Tracking, 10, false))
            .unwrap();
        assert_eq!(data.start_active, 0);
        assert!(!data.free_poses[0]);
        assert!(data.free_poses[1..].iter().all(|&f| f));
        assert!(data.prior_slot.is_none());
        assert!(data.fixed_track.is_some());
    }

    #[test]
    fn test_inertial_window_reports_boundary_conditioning() {
        let sim = Scenario::new(SimulationConfig::default());
        let (mut graph, imu) = sim.build_graph(8);
        let inv = invoker();
        let request = BaRequest::new(BaInstance::Conditioning, 3, true);
        let data = inv.collect(&graph, Some(&imu), &sim.true_rig(), &request).unwrap();
        assert_eq!(data.start_active, 5);
        assert!(data.snapshot.poses.first().unwrap().index < 5);
        let result = inv.solve(&data);
        assert_eq!(result.conditioning.inertial_dim, 15);
        assert!(result.conditioning.inertial_error.is_finite());
        assert!(result.conditioning.projection_count > 0);
        assert_eq!(inv.apply(&mut graph, &result), 3);
    }

    #[test]
    fn test_full_inertial_window_uses_prior() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(5);
        let data = invoker()
            .collect(&graph, Some(&imu), &sim.true_rig(), &BaRequest::new(BaInstance::Tracking, 10, true))
            .unwrap();
        assert_eq!(data.prior_slot, Some(0));
        assert!(data.free_poses.iter().all(|&f| f));
        assert!(data.regularize_bias);
    }
}

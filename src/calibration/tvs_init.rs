//! Staged initialization of the body-from-camera extrinsic.
//!
//! The joint extrinsic estimator diverges from a poor starting point, so the
//! rotation is solved first from inter-keyframe rotations alone:
//!
//! ```text
//! q_b ≈ R_vs q_c R_vsᵀ
//! ```
//!
//! where `q_b` is the gyro-integrated body rotation and `q_c` the visually
//! estimated camera rotation between the same two keyframes. The translation
//! is then seeded with a scaled guess before the joint batch takes over.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Owned, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera::Rig;
use crate::graph::PoseGraph;
use crate::imu::{preintegrate, ImuBuffer};
use crate::optimizer::robust::HuberLoss;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TvsInitConfig {
    /// Rotation constraints needed before the rotation is solved.
    pub min_poses_for_rotation_init: usize,
    /// Huber width on the rotation residual (radians).
    pub huber_width: f64,
    pub max_iterations: usize,
    /// Per-axis factors applied to the translation seed.
    pub translation_factors: [f64; 3],
    /// Per-axis seed used when nothing better is known.
    pub seed_offset: f64,
    /// Rough prior on the translation, e.g. from a CAD drawing.
    pub translation_prior: Option<Vector3<f64>>,
}

impl Default for TvsInitConfig {
    fn default() -> Self {
        Self {
            min_poses_for_rotation_init: 10,
            huber_width: 1.0,
            max_iterations: 100,
            translation_factors: [1.05, 0.93, 1.06],
            seed_offset: 0.01,
            translation_prior: None,
        }
    }
}

/// Relative rotations of one keyframe pair.
#[derive(Debug, Clone, Copy)]
pub struct RotationConstraint {
    pub from: usize,
    pub to: usize,
    /// Gyro-integrated body rotation.
    pub body: UnitQuaternion<f64>,
    /// Visually estimated camera rotation.
    pub camera: UnitQuaternion<f64>,
}

impl RotationConstraint {
    fn residual(&self, r_vs: &UnitQuaternion<f64>) -> Vector3<f64> {
        let predicted = r_vs * self.camera * r_vs.inverse();
        (predicted.inverse() * self.body).scaled_axis()
    }
}

/// Least-squares wrapper over the rotation constraints, parameterized by
/// the scaled axis of `R_vs`.
struct RotationProblem<'a> {
    constraints: &'a [RotationConstraint],
    loss: HuberLoss,
    params: DVector<f64>,
}

impl RotationProblem<'_> {
    fn residuals_at(&self, x: &DVector<f64>) -> DVector<f64> {
        let r_vs = UnitQuaternion::from_scaled_axis(Vector3::new(x[0], x[1], x[2]));
        let mut out = DVector::zeros(3 * self.constraints.len());
        for (i, c) in self.constraints.iter().enumerate() {
            let r = c.residual(&r_vs);
            let s = r.norm_squared();
            // Scale so the squared norm equals the robustified cost.
            let scale = if s > 0.0 { (self.loss.rho(s) / s).sqrt() } else { 1.0 };
            out.fixed_rows_mut::<3>(3 * i).copy_from(&(r * scale));
        }
        out
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for RotationProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        const STEP: f64 = 1e-7;
        let m = 3 * self.constraints.len();
        let mut jac = DMatrix::zeros(m, 3);
        for k in 0..3 {
            let mut plus = self.params.clone();
            let mut minus = self.params.clone();
            plus[k] += STEP;
            minus[k] -= STEP;
            let column = (self.residuals_at(&plus) - self.residuals_at(&minus)) / (2.0 * STEP);
            jac.set_column(k, &column);
        }
        Some(jac)
    }
}

/// Accumulates rotation constraints while the extrinsic is unknown.
#[derive(Debug, Clone)]
pub struct TvsInitializer {
    config: TvsInitConfig,
    constraints: Vec<RotationConstraint>,
    /// Next pose expected to close a constraint.
    next_pose: usize,
}

impl TvsInitializer {
    pub fn new(config: TvsInitConfig) -> Self {
        Self {
            config,
            constraints: Vec::new(),
            next_pose: 1,
        }
    }

    pub fn config(&self) -> &TvsInitConfig {
        &self.config
    }

    pub fn constraints(&self) -> &[RotationConstraint] {
        &self.constraints
    }

    /// Forgets every constraint; the next ones start at `since`.
    pub fn reset(&mut self, since: usize) {
        self.constraints.clear();
        self.next_pose = since + 1;
    }

    pub fn is_ready(&self) -> bool {
        self.constraints.len() >= self.config.min_poses_for_rotation_init
    }

    /// Adds a constraint for every consecutive keyframe pair not seen yet.
    ///
    /// Camera rotations are read through `rig`; pairs without IMU coverage
    /// are skipped. Returns the number of constraints added.
    pub fn add_constraints(&mut self, graph: &PoseGraph, imu: &ImuBuffer, rig: &Rig) -> usize {
        let mut added = 0;
        while self.next_pose < graph.num_poses() {
            let to = self.next_pose;
            self.next_pose += 1;
            let (Some(a), Some(b)) = (graph.pose(to - 1), graph.pose(to)) else {
                continue;
            };
            let samples = imu.range(a.time, b.time);
            if samples.len() < 2 {
                continue;
            }
            let body = preintegrate(&samples, &a.bias).delta_rot;
            let camera = rig.camera_pose(&a.t_wp).inverse().compose(&rig.camera_pose(&b.t_wp)).rotation;
            self.constraints.push(RotationConstraint {
                from: to - 1,
                to,
                body,
                camera,
            });
            added += 1;
        }
        added
    }

    /// Solves for `R_vs` starting from `initial`.
    ///
    /// Returns `None` when there are too few constraints or the solver made
    /// things worse.
    pub fn solve_rotation(&self, initial: &UnitQuaternion<f64>) -> Option<UnitQuaternion<f64>> {
        if !self.is_ready() {
            return None;
        }
        let problem = RotationProblem {
            constraints: &self.constraints,
            loss: HuberLoss::new(self.config.huber_width),
            params: DVector::from_column_slice(initial.scaled_axis().as_slice()),
        };
        let initial_cost = problem.residuals_at(&problem.params).norm_squared();
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.config.max_iterations)
            .minimize(problem);
        let x = problem.params;
        let final_cost = 2.0 * report.objective_function;
        if x.iter().any(|v| !v.is_finite()) || !final_cost.is_finite() || final_cost > initial_cost {
            warn!(termination = ?report.termination, "extrinsic rotation initialization failed");
            return None;
        }
        let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(x[0], x[1], x[2]));
        info!(
            constraints = self.constraints.len(),
            initial_cost,
            final_cost,
            termination = ?report.termination,
            angle = rotation.angle(),
            "extrinsic rotation initialized"
        );
        Some(rotation)
    }

    /// Translation guess handed to the joint batch.
    pub fn seed_translation(&self, current: &Vector3<f64>) -> Vector3<f64> {
        let base = match self.config.translation_prior {
            Some(prior) => prior,
            None if current.norm() > 0.0 => *current,
            None => Vector3::repeat(self.config.seed_offset),
        };
        let f = self.config.translation_factors;
        let seeded = Vector3::new(base.x * f[0], base.y * f[1], base.z * f[2]);
        debug!(x = seeded.x, y = seeded.y, z = seeded.z, "extrinsic translation seeded");
        seeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{Scenario, SimulationConfig};
    use approx::assert_relative_eq;

    #[test]
    fn test_rotation_recovered_from_identity() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(14);
        let rig = sim.true_rig();
        let mut init = TvsInitializer::new(TvsInitConfig::default());
        assert_eq!(init.add_constraints(&graph, &imu, &rig), 13);
        assert!(init.is_ready());
        // Already consumed pairs are not added twice.
        assert_eq!(init.add_constraints(&graph, &imu, &rig), 0);

        let solved = init.solve_rotation(&UnitQuaternion::identity()).unwrap();
        assert!(solved.angle_to(&rig.t_vs.rotation) < 5e-3);
    }

    #[test]
    fn test_not_ready_below_minimum() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(5);
        let mut init = TvsInitializer::new(TvsInitConfig::default());
        init.add_constraints(&graph, &imu, &sim.true_rig());
        assert!(!init.is_ready());
        assert!(init.solve_rotation(&UnitQuaternion::identity()).is_none());
        init.reset(2);
        assert!(init.constraints().is_empty());
        assert_eq!(init.add_constraints(&graph, &imu, &sim.true_rig()), 2);
        assert_eq!(init.constraints()[0].from, 2);
    }

    #[test]
    fn test_translation_seed() {
        let init = TvsInitializer::new(TvsInitConfig::default());
        let seeded = init.seed_translation(&Vector3::zeros());
        assert_relative_eq!(seeded, Vector3::new(0.0105, 0.0093, 0.0106), epsilon = 1e-12);
        let seeded = init.seed_translation(&Vector3::new(0.1, 0.1, 0.1));
        assert_relative_eq!(seeded.y, 0.093, epsilon = 1e-12);

        let with_prior = TvsInitializer::new(TvsInitConfig {
            translation_prior: Some(Vector3::new(0.0, 0.2, 0.0)),
            ..Default::default()
        });
        assert_relative_eq!(
            with_prior.seed_translation(&Vector3::new(1.0, 1.0, 1.0)),
            Vector3::new(0.0, 0.186, 0.0),
            epsilon = 1e-12
        );
    }
}

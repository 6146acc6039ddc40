//! Residual cost functions used by the bundle adjustment and calibration
//! problems.
//!
//! Parameter block layouts:
//! - pose: `[rx, ry, rz, tx, ty, tz]` world-from-body (`SE3::to_params`)
//! - velocity: `[vx, vy, vz]` in world
//! - bias: `[bgx, bgy, bgz, bax, bay, baz]`
//! - inverse depth: `[rho]`
//! - extrinsic: translation `[tx, ty, tz]` and rotation `[rx, ry, rz]`
//!   (body-from-camera) as two separate blocks
//! - intrinsics: model parameters (`CameraIntrinsics::params`)

use nalgebra::{DVector, Vector2, Vector3};

use crate::camera::intrinsics::{project, unproject, CameraModelKind};
use crate::geometry::so3::{wrap_angle, yaw_of};
use crate::geometry::SE3;
use crate::imu::{preintegrate, ImuBias, ImuNoise, ImuSample, GRAVITY};

use super::problem::CostFunction;

/// Whitened residual assigned to points that cannot be projected.
const BEHIND_CAMERA_PX: f64 = 100.0;

fn extrinsic_from_blocks(t: &[f64], r: &[f64]) -> SE3 {
    SE3::exp_decoupled(&[t[0], t[1], t[2], r[0], r[1], r[2]])
}

/// Reprojection of an inverse-depth landmark anchored in a reference pose
/// into an observing pose.
///
/// Blocks: `[ref_pose, obs_pose, rho, ext_t, ext_r]` plus a trailing
/// intrinsics block when `intrinsics` is `None`.
pub struct ProjectionCost {
    pub model: CameraModelKind,
    /// Fixed intrinsics; `None` reads them from the last block.
    pub intrinsics: Option<Vec<f64>>,
    pub ref_px: Vector2<f64>,
    pub ray: Vector3<f64>,
    /// Re-derive the reference ray from `ref_px` with the intrinsics being
    /// evaluated instead of using `ray`.
    pub recompute_ray: bool,
    pub observed: Vector2<f64>,
    pub sigma_px: f64,
}

impl ProjectionCost {
    /// Predicted pixel, or `None` when the point is behind the camera.
    pub fn predict(&self, blocks: &[&[f64]]) -> Option<Vector2<f64>> {
        let t_w_ref = SE3::from_params(blocks[0]);
        let t_w_obs = SE3::from_params(blocks[1]);
        let rho = blocks[2][0];
        let t_vs = extrinsic_from_blocks(blocks[3], blocks[4]);
        let k: &[f64] = match &self.intrinsics {
            Some(k) => k,
            None => blocks[5],
        };

        let ray = if self.recompute_ray {
            unproject(self.model, k, &self.ref_px)
        } else {
            self.ray
        };

        // Camera(obs)-from-camera(ref), applied to the homogeneous point
        // (ray, rho) so that rho -> 0 stays well defined.
        let t_obs_ref = t_w_obs.compose(&t_vs).inverse().compose(&t_w_ref.compose(&t_vs));
        let p = t_obs_ref.transform_homogeneous(&ray, rho);
        project(self.model, k, &p)
    }
}

impl CostFunction for ProjectionCost {
    fn dim(&self) -> usize {
        2
    }

    fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64> {
        match self.predict(blocks) {
            Some(px) => {
                let r = (px - self.observed) / self.sigma_px;
                DVector::from_vec(vec![r.x, r.y])
            }
            None => DVector::from_element(2, BEHIND_CAMERA_PX / self.sigma_px),
        }
    }
}

/// Preintegrated IMU constraint between consecutive keyframes.
///
/// Blocks: `[pose_i, v_i, bias_i, pose_j, v_j, bias_j]`. The raw samples are
/// re-integrated with the bias of pose `i` on every evaluation, so bias
/// changes are handled exactly rather than through first-order correction.
///
/// ```text
/// r = [ Log(ΔRᵀ R_iᵀ R_j)                          ] / σ_R
///     [ R_iᵀ (v_j - v_i - g Δt) - Δv               ] / σ_v
///     [ R_iᵀ (p_j - p_i - v_i Δt - ½ g Δt²) - Δp   ] / σ_p
///     [ b_g,j - b_g,i                              ] / σ_bg
///     [ b_a,j - b_a,i                              ] / σ_ba
/// ```
pub struct InertialCost {
    pub samples: Vec<ImuSample>,
    pub noise: ImuNoise,
}

impl InertialCost {
    pub fn new(samples: Vec<ImuSample>, noise: ImuNoise) -> Self {
        Self { samples, noise }
    }

    /// Interval length covered by the samples.
    pub fn dt(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(a), Some(b)) => b.timestamp_s - a.timestamp_s,
            _ => 0.0,
        }
    }
}

impl CostFunction for InertialCost {
    fn dim(&self) -> usize {
        15
    }

    fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64> {
        let pose_i = SE3::from_params(blocks[0]);
        let v_i = Vector3::new(blocks[1][0], blocks[1][1], blocks[1][2]);
        let bias_i = ImuBias::from_params(blocks[2]);
        let pose_j = SE3::from_params(blocks[3]);
        let v_j = Vector3::new(blocks[4][0], blocks[4][1], blocks[4][2]);
        let bias_j = ImuBias::from_params(blocks[5]);

        let preint = preintegrate(&self.samples, &bias_i);
        let dt = preint.dt.max(1e-9);
        let r_i_inv = pose_i.rotation.inverse();

        let rotation = (preint.delta_rot.inverse() * r_i_inv * pose_j.rotation).scaled_axis();
        let velocity = r_i_inv * (v_j - v_i - GRAVITY * dt) - preint.delta_vel;
        let position = r_i_inv
            * (pose_j.translation - pose_i.translation - v_i * dt - 0.5 * GRAVITY * dt * dt)
            - preint.delta_pos;
        let gyro_walk = bias_j.gyro - bias_i.gyro;
        let accel_walk = bias_j.accel - bias_i.accel;

        let sqrt_dt = dt.sqrt();
        let sigma_rot = self.noise.sigma_gyro * sqrt_dt;
        let sigma_vel = self.noise.sigma_accel * sqrt_dt;
        let sigma_pos = self.noise.sigma_accel * dt * sqrt_dt;
        let sigma_bg = self.noise.sigma_gyro_walk * sqrt_dt;
        let sigma_ba = self.noise.sigma_accel_walk * sqrt_dt;

        let mut r = DVector::zeros(15);
        for k in 0..3 {
            r[k] = rotation[k] / sigma_rot;
            r[3 + k] = velocity[k] / sigma_vel;
            r[6 + k] = position[k] / sigma_pos;
            r[9 + k] = gyro_walk[k] / sigma_bg;
            r[12 + k] = accel_walk[k] / sigma_ba;
        }
        r
    }
}

/// Translation + yaw prior on a single pose. Fixes the four gauge degrees of
/// freedom of a visual-inertial problem when no pose is held fixed.
pub struct PosePriorCost {
    pub translation: Vector3<f64>,
    pub yaw: f64,
    pub sigma_translation: f64,
    pub sigma_yaw: f64,
}

impl PosePriorCost {
    pub fn new(pose: &SE3, sigma_translation: f64, sigma_yaw: f64) -> Self {
        Self {
            translation: pose.translation,
            yaw: yaw_of(&pose.rotation),
            sigma_translation,
            sigma_yaw,
        }
    }
}

impl CostFunction for PosePriorCost {
    fn dim(&self) -> usize {
        4
    }

    fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64> {
        let pose = SE3::from_params(blocks[0]);
        let dt = (pose.translation - self.translation) / self.sigma_translation;
        let dyaw = wrap_angle(yaw_of(&pose.rotation) - self.yaw) / self.sigma_yaw;
        DVector::from_vec(vec![dt.x, dt.y, dt.z, dyaw])
    }
}

/// Pulls a bias block towards a value. Regularizes the biases while the
/// trajectory is still too short to observe them.
pub struct BiasPriorCost {
    pub bias: ImuBias,
    pub sigma_gyro: f64,
    pub sigma_accel: f64,
}

impl CostFunction for BiasPriorCost {
    fn dim(&self) -> usize {
        6
    }

    fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64> {
        let b = ImuBias::from_params(blocks[0]);
        let dg = (b.gyro - self.bias.gyro) / self.sigma_gyro;
        let da = (b.accel - self.bias.accel) / self.sigma_accel;
        DVector::from_vec(vec![dg.x, dg.y, dg.z, da.x, da.y, da.z])
    }
}

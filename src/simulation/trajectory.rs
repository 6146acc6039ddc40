//! Smooth analytic body trajectory and its ideal IMU readings.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::geometry::so3::right_jacobian_so3;
use crate::geometry::SE3;
use crate::imu::GRAVITY;

/// Kinematic state of the body at one instant.
#[derive(Debug, Clone, Copy)]
pub struct BodyState {
    pub t_wp: SE3,
    pub v_w: Vector3<f64>,
    pub accel_w: Vector3<f64>,
    /// Angular velocity in the body frame.
    pub gyro: Vector3<f64>,
}

impl BodyState {
    /// Specific force an ideal accelerometer would read.
    pub fn specific_force(&self) -> Vector3<f64> {
        self.t_wp.rotation.inverse() * (self.accel_w - GRAVITY)
    }
}

/// Circular sweep with vertical bobbing and a rocking orientation:
///
/// ```text
/// p(t) = (r cos ωt - r, r sin ωt, h sin 2ωt)
/// R(t) = R0 Exp(φ(t))
/// ```
///
/// `R0` points the body z axis along world +x.
#[derive(Debug, Clone, Copy)]
pub struct Trajectory {
    pub radius: f64,
    pub height: f64,
    pub omega: f64,
}

impl Default for Trajectory {
    fn default() -> Self {
        Self {
            radius: 1.5,
            height: 0.3,
            omega: 0.5,
        }
    }
}

impl Trajectory {
    fn base_rotation() -> UnitQuaternion<f64> {
        let m = Matrix3::from_columns(&[
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::new(1.0, 0.0, 0.0),
        ]);
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(m))
    }

    fn phi(t: f64) -> (Vector3<f64>, Vector3<f64>) {
        let phi = Vector3::new(0.15 * (1.1 * t).sin(), 0.2 * (0.9 * t).sin(), 0.3 * (0.7 * t).sin());
        let rate = Vector3::new(
            0.15 * 1.1 * (1.1 * t).cos(),
            0.2 * 0.9 * (0.9 * t).cos(),
            0.3 * 0.7 * (0.7 * t).cos(),
        );
        (phi, rate)
    }

    pub fn state(&self, t: f64) -> BodyState {
        let (r, h, w) = (self.radius, self.height, self.omega);
        let (s, c) = (w * t).sin_cos();
        let (s2, c2) = (2.0 * w * t).sin_cos();

        let position = Vector3::new(r * c - r, r * s, h * s2);
        let v_w = Vector3::new(-r * w * s, r * w * c, 2.0 * h * w * c2);
        let accel_w = Vector3::new(-r * w * w * c, -r * w * w * s, -4.0 * h * w * w * s2);

        let (phi, rate) = Self::phi(t);
        let rotation = Self::base_rotation() * UnitQuaternion::from_scaled_axis(phi);
        let gyro = right_jacobian_so3(&phi) * rate;

        BodyState {
            t_wp: SE3::from_rt(rotation, position),
            v_w,
            accel_w,
            gyro,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{ImuBias, ImuSample, Preintegrator};
    use approx::assert_relative_eq;

    #[test]
    fn test_body_looks_along_world_x() {
        let traj = Trajectory::default();
        let state = traj.state(0.0);
        let forward = state.t_wp.rotation * Vector3::z();
        assert_relative_eq!(forward, Vector3::x(), epsilon = 1e-12);
        assert_relative_eq!(state.t_wp.translation, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_integrated_imu_matches_trajectory() {
        let traj = Trajectory::default();
        let (t0, t1) = (0.3, 0.55);
        let dt = 0.001;
        let samples: Vec<ImuSample> = (0..=250)
            .map(|i| {
                let t = t0 + i as f64 * dt;
                let s = traj.state(t);
                ImuSample::new(t, s.specific_force(), s.gyro)
            })
            .collect();
        let mut pre = Preintegrator::new(ImuBias::zero());
        pre.integrate_all(&samples);
        let start = traj.state(t0);
        let (pose, velocity) = pre.propagate(&start.t_wp, &start.v_w);
        let end = traj.state(t1);
        assert!(pose.angle_to(&end.t_wp) < 1e-4);
        assert_relative_eq!(pose.translation, end.t_wp.translation, epsilon = 1e-4);
        assert_relative_eq!(velocity, end.v_w, epsilon = 2e-3);
    }
}

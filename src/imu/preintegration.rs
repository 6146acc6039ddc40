use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::SE3;

use super::sample::{ImuBias, ImuSample, GRAVITY};

/// Preintegrated motion between two keyframes, expressed in the body frame
/// of the first one. Gravity is not included.
#[derive(Debug, Clone, Copy)]
pub struct PreintegratedState {
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,
}

impl PreintegratedState {
    pub fn identity() -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
        }
    }
}

/// IMU preintegrator: integrates high-rate IMU into a relative motion prior.
pub struct Preintegrator {
    pub bias: ImuBias,
    pub state: PreintegratedState,
}

impl Preintegrator {
    pub fn new(bias: ImuBias) -> Self {
        Self {
            bias,
            state: PreintegratedState::identity(),
        }
    }

    pub fn reset(&mut self) {
        self.state = PreintegratedState::identity();
    }

    /// Integrate a single time step using midpoint integration.
    pub fn integrate(&mut self, prev: &ImuSample, curr: &ImuSample) {
        let dt = curr.timestamp_s - prev.timestamp_s;
        if dt <= 0.0 {
            return;
        }

        let omega = 0.5 * (prev.gyro + curr.gyro) - self.bias.gyro;
        let accel = 0.5 * (prev.accel + curr.accel) - self.bias.accel;

        // Position and velocity use the rotation at the start of the step.
        let accel_rotated = self.state.delta_rot * accel;
        self.state.delta_pos += self.state.delta_vel * dt + 0.5 * accel_rotated * dt * dt;
        self.state.delta_vel += accel_rotated * dt;
        self.state.delta_rot = self.state.delta_rot * UnitQuaternion::from_scaled_axis(omega * dt);
        self.state.dt += dt;
    }

    /// Integrate a time-ordered run of samples.
    pub fn integrate_all(&mut self, samples: &[ImuSample]) -> PreintegratedState {
        for pair in samples.windows(2) {
            self.integrate(&pair[0], &pair[1]);
        }
        self.state
    }

    /// Predict pose/velocity at the end of the interval from the start state.
    pub fn propagate(&self, t_wp: &SE3, v_w: &Vector3<f64>) -> (SE3, Vector3<f64>) {
        let dt = self.state.dt;
        let rotation = t_wp.rotation * self.state.delta_rot;
        let velocity = v_w + GRAVITY * dt + t_wp.rotation * self.state.delta_vel;
        let translation = t_wp.translation
            + v_w * dt
            + 0.5 * GRAVITY * dt * dt
            + t_wp.rotation * self.state.delta_pos;
        (SE3::from_rt(rotation, translation), velocity)
    }
}

/// Convenience wrapper used by residuals that re-integrate with the current
/// bias estimate.
pub fn preintegrate(samples: &[ImuSample], bias: &ImuBias) -> PreintegratedState {
    Preintegrator::new(*bias).integrate_all(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn constant_samples(accel: Vector3<f64>, gyro: Vector3<f64>, n: usize, dt: f64) -> Vec<ImuSample> {
        (0..=n)
            .map(|i| ImuSample::new(i as f64 * dt, accel, gyro))
            .collect()
    }

    #[test]
    fn test_stationary_imu_cancels_gravity() {
        // A level, stationary IMU measures +g upward.
        let samples = constant_samples(-GRAVITY, Vector3::zeros(), 100, 0.01);
        let pre = preintegrate(&samples, &ImuBias::zero());
        let mut integ = Preintegrator::new(ImuBias::zero());
        integ.state = pre;
        let (pose, vel) = integ.propagate(&SE3::identity(), &Vector3::zeros());
        assert_relative_eq!(pose.translation, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(vel, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(pre.dt, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_acceleration_is_exact() {
        let a = Vector3::new(0.5, -0.2, 0.1);
        let samples = constant_samples(a - GRAVITY, Vector3::zeros(), 50, 0.02);
        let pre = preintegrate(&samples, &ImuBias::zero());
        let mut integ = Preintegrator::new(ImuBias::zero());
        integ.state = pre;
        let v0 = Vector3::new(1.0, 0.0, 0.0);
        let (pose, vel) = integ.propagate(&SE3::identity(), &v0);
        assert_relative_eq!(pose.translation, v0 + 0.5 * a, epsilon = 1e-9);
        assert_relative_eq!(vel, v0 + a, epsilon = 1e-9);
    }

    #[test]
    fn test_gyro_bias_removed() {
        let bias = ImuBias {
            gyro: Vector3::new(0.0, 0.0, 0.1),
            accel: Vector3::zeros(),
        };
        let samples = constant_samples(-GRAVITY, Vector3::new(0.0, 0.0, 0.1), 100, 0.01);
        let pre = preintegrate(&samples, &bias);
        assert_relative_eq!(pre.delta_rot.angle(), 0.0, epsilon = 1e-12);
    }
}

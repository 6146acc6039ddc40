use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Gravity vector in world frame (m/s^2).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// IMU noise parameters (1-sigma, continuous time).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    pub sigma_gyro: f64,
    pub sigma_accel: f64,
    pub sigma_gyro_walk: f64,
    pub sigma_accel_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            sigma_gyro: 1.7e-3,
            sigma_accel: 2.0e-2,
            sigma_gyro_walk: 1.9e-5,
            sigma_accel_walk: 3.0e-3,
        }
    }
}

/// IMU biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }

    /// `[gyro; accel]`, the layout of bias parameter blocks.
    pub fn to_params(&self) -> [f64; 6] {
        [
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
            self.accel.x,
            self.accel.y,
            self.accel.z,
        ]
    }

    pub fn from_params(p: &[f64]) -> Self {
        Self {
            gyro: Vector3::new(p[0], p[1], p[2]),
            accel: Vector3::new(p[3], p[4], p[5]),
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Single IMU measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_s: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp_s,
            accel,
            gyro,
        }
    }

    /// Linear interpolation between two samples at time `t`.
    pub fn lerp(a: &ImuSample, b: &ImuSample, t: f64) -> ImuSample {
        let span = b.timestamp_s - a.timestamp_s;
        let alpha = if span > 0.0 {
            ((t - a.timestamp_s) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        ImuSample {
            timestamp_s: t,
            accel: a.accel + (b.accel - a.accel) * alpha,
            gyro: a.gyro + (b.gyro - a.gyro) * alpha,
        }
    }
}

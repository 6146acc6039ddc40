//! Rigid-body transforms.
//!
//! `SE3` stores a unit quaternion and a translation. Poses in the graph are
//! world-from-body (`t_wp`); the rig extrinsic is body-from-camera (`t_vs`).

use nalgebra::{DVector, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_rt(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self * other`, i.e. apply `other` first.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Transform a homogeneous point `(x, w)`, returning its 3-vector part.
    ///
    /// Works for points at infinity (`w == 0`), which is how inverse-depth
    /// landmarks with vanishing `rho` are carried through the rig.
    pub fn transform_homogeneous(&self, x: &Vector3<f64>, w: f64) -> Vector3<f64> {
        self.rotation * x + self.translation * w
    }

    /// Packs as `[rx, ry, rz, tx, ty, tz]` (axis-angle then translation).
    ///
    /// This is the layout used for pose parameter blocks in the optimizer.
    pub fn to_params(&self) -> Vector6<f64> {
        let r = self.rotation.scaled_axis();
        Vector6::new(
            r.x,
            r.y,
            r.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }

    pub fn from_params(p: &[f64]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(p[0], p[1], p[2])),
            translation: Vector3::new(p[3], p[4], p[5]),
        }
    }

    /// Decoupled log: `[tx, ty, tz, rx, ry, rz]`.
    ///
    /// Translation and rotation are logged independently, which is the
    /// representation the extrinsic calibration mean and covariance live in.
    pub fn log_decoupled(&self) -> DVector<f64> {
        let r = self.rotation.scaled_axis();
        DVector::from_vec(vec![
            self.translation.x,
            self.translation.y,
            self.translation.z,
            r.x,
            r.y,
            r.z,
        ])
    }

    pub fn exp_decoupled(v: &[f64]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(v[3], v[4], v[5])),
            translation: Vector3::new(v[0], v[1], v[2]),
        }
    }

    /// Rotation angle (radians) of the relative transform `self^-1 * other`.
    pub fn angle_to(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::from_rt(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let t = sample_pose();
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_param_roundtrip() {
        let t = sample_pose();
        let back = SE3::from_params(t.to_params().as_slice());
        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-12);
        assert_relative_eq!(back.rotation.angle_to(&t.rotation), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_homogeneous_matches_euclidean() {
        let t = sample_pose();
        let p = Vector3::new(0.3, 0.2, 4.0);
        let rho = 0.25;
        let h = t.transform_homogeneous(&(p * rho), rho) / rho;
        assert_relative_eq!(h, t.transform_point(&p), epsilon = 1e-12);
    }

    #[test]
    fn test_decoupled_layout_puts_translation_first() {
        let t = sample_pose();
        let v = t.log_decoupled();
        assert_relative_eq!(v[0], 1.0);
        assert_relative_eq!(v[1], -2.0);
        let back = SE3::exp_decoupled(v.as_slice());
        assert_relative_eq!(back.rotation.angle_to(&t.rotation), 0.0, epsilon = 1e-12);
    }
}

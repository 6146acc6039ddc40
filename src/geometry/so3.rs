//! SO(3) helpers.

use nalgebra::{Matrix3, Unit, UnitQuaternion, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

const SMALL_ANGLE: f64 = 1e-8;

/// Right Jacobian of SO(3):
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// Maps rotation-vector rates to body angular velocity, `ω = Jr(φ) φ'`.
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * skew_phi;
    }
    let theta_sq = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / (theta_sq * theta)) * skew_phi * skew_phi
}

/// Minimal rotation taking direction `from` onto direction `to`.
///
/// Used to gravity-align the first pose from the first accelerometer sample.
pub fn rotation_between_vectors(from: &Vector3<f64>, to: &Vector3<f64>) -> UnitQuaternion<f64> {
    let from_normalized = from.normalize();
    let to_normalized = to.normalize();

    let cross = from_normalized.cross(&to_normalized);
    let dot = from_normalized.dot(&to_normalized);

    if cross.norm() < 1e-10 {
        if dot > 0.0 {
            return UnitQuaternion::identity();
        }
        // Anti-parallel: half turn about any perpendicular axis.
        let perp = if from_normalized.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let axis = Unit::new_normalize(from_normalized.cross(&perp));
        return UnitQuaternion::from_axis_angle(&axis, std::f64::consts::PI);
    }

    let angle = cross.norm().atan2(dot);
    UnitQuaternion::from_axis_angle(&Unit::new_normalize(cross), angle)
}

/// Rotation about the world z axis (yaw) of a rotation vector, used by the
/// yaw prior that fixes the inertial gauge.
pub fn yaw_of(rotation: &UnitQuaternion<f64>) -> f64 {
    let (_, _, yaw) = rotation.euler_angles();
    yaw
}

/// Wraps an angle difference into (-pi, pi].
pub fn wrap_angle(a: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut a = a % two_pi;
    if a > std::f64::consts::PI {
        a -= two_pi;
    } else if a <= -std::f64::consts::PI {
        a += two_pi;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);
        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_between_vectors_aligns() {
        let from = Vector3::new(0.3, -0.2, 9.7);
        let to = Vector3::new(0.0, 0.0, 1.0);
        let q = rotation_between_vectors(&from, &to);
        assert_relative_eq!(q * from.normalize(), to, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_between_antiparallel() {
        let from = Vector3::new(0.0, 0.0, -1.0);
        let to = Vector3::new(0.0, 0.0, 1.0);
        let q = rotation_between_vectors(&from, &to);
        assert_relative_eq!(q * from, to, epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_matches_finite_difference() {
        // R(φ + δ) ≈ R(φ) Exp(Jr(φ) δ)
        let phi = Vector3::new(0.3, -0.5, 0.2);
        let delta = Vector3::new(1e-6, 2e-6, -1e-6);
        let lhs = UnitQuaternion::from_scaled_axis(phi + delta);
        let rhs = UnitQuaternion::from_scaled_axis(phi)
            * UnitQuaternion::from_scaled_axis(right_jacobian_so3(&phi) * delta);
        assert_relative_eq!(lhs.angle_to(&rhs), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(3.0 * std::f64::consts::PI), std::f64::consts::PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-0.5), -0.5);
    }
}

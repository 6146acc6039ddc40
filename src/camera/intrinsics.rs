//! Camera intrinsic models.
//!
//! Two models are supported:
//! - `Pinhole`: `[fx, fy, cx, cy]`
//! - `Fov`: `[fx, fy, cx, cy, w]`, the Devernay-Faugeras field-of-view
//!   distortion model. `w == 0` degenerates to the pinhole model.
//!
//! The free functions operate on raw parameter slices so the optimizer can
//! evaluate projections directly against its parameter blocks.

use nalgebra::{DVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Points closer than this (camera z) are treated as not projectable.
pub const MIN_DEPTH: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraModelKind {
    Pinhole,
    Fov,
}

impl CameraModelKind {
    pub fn num_params(self) -> usize {
        match self {
            CameraModelKind::Pinhole => 4,
            CameraModelKind::Fov => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub model: CameraModelKind,
    pub width: u32,
    pub height: u32,
    pub params: DVector<f64>,
}

impl CameraIntrinsics {
    pub fn pinhole(width: u32, height: u32, fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            model: CameraModelKind::Pinhole,
            width,
            height,
            params: DVector::from_vec(vec![fx, fy, cx, cy]),
        }
    }

    pub fn fov(width: u32, height: u32, fx: f64, fy: f64, cx: f64, cy: f64, w: f64) -> Self {
        Self {
            model: CameraModelKind::Fov,
            width,
            height,
            params: DVector::from_vec(vec![fx, fy, cx, cy, w]),
        }
    }

    /// Deliberately poor but unbiased starting point for batch estimation:
    /// a wide field of view centred on the image, no distortion.
    pub fn wide_fov_seed(model: CameraModelKind, width: u32, height: u32, fov_deg: f64) -> Self {
        let half_fov = 0.5 * fov_deg.to_radians();
        let f = 0.5 * height as f64 / half_fov.tan();
        let mut params = DVector::zeros(model.num_params());
        params[0] = f;
        params[1] = f;
        params[2] = 0.5 * width as f64;
        params[3] = 0.5 * height as f64;
        Self {
            model,
            width,
            height,
            params,
        }
    }

    pub fn num_params(&self) -> usize {
        self.model.num_params()
    }

    pub fn with_params(&self, params: &DVector<f64>) -> Self {
        Self {
            params: params.clone(),
            ..self.clone()
        }
    }

    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        project(self.model, self.params.as_slice(), p_cam)
    }

    pub fn unproject(&self, px: &Vector2<f64>) -> Vector3<f64> {
        unproject(self.model, self.params.as_slice(), px)
    }

    pub fn in_image(&self, px: &Vector2<f64>) -> bool {
        px.x >= 0.0 && px.y >= 0.0 && px.x < self.width as f64 && px.y < self.height as f64
    }
}

/// Radial factor `r_d / r_u` of the FOV model.
fn fov_distort_factor(w: f64, r_u: f64) -> f64 {
    if w.abs() < 1e-9 {
        return 1.0;
    }
    let mul2_tanw_by2 = 2.0 * (0.5 * w).tan();
    if r_u < 1e-9 {
        return mul2_tanw_by2 / w;
    }
    (r_u * mul2_tanw_by2).atan() / (w * r_u)
}

/// Radial factor `r_u / r_d` of the FOV model.
fn fov_undistort_factor(w: f64, r_d: f64) -> f64 {
    if w.abs() < 1e-9 {
        return 1.0;
    }
    let mul2_tanw_by2 = 2.0 * (0.5 * w).tan();
    if r_d < 1e-9 {
        return w / mul2_tanw_by2;
    }
    (r_d * w).tan() / (r_d * mul2_tanw_by2)
}

/// Projects a camera-frame point to pixels. `None` behind the camera.
pub fn project(model: CameraModelKind, params: &[f64], p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
    if p_cam.z <= MIN_DEPTH {
        return None;
    }
    let x = p_cam.x / p_cam.z;
    let y = p_cam.y / p_cam.z;
    let factor = match model {
        CameraModelKind::Pinhole => 1.0,
        CameraModelKind::Fov => fov_distort_factor(params[4], (x * x + y * y).sqrt()),
    };
    Some(Vector2::new(
        params[0] * factor * x + params[2],
        params[1] * factor * y + params[3],
    ))
}

/// Back-projects a pixel to a unit bearing ray in the camera frame.
pub fn unproject(model: CameraModelKind, params: &[f64], px: &Vector2<f64>) -> Vector3<f64> {
    let xd = (px.x - params[2]) / params[0];
    let yd = (px.y - params[3]) / params[1];
    let factor = match model {
        CameraModelKind::Pinhole => 1.0,
        CameraModelKind::Fov => fov_undistort_factor(params[4], (xd * xd + yd * yd).sqrt()),
    };
    Vector3::new(xd * factor, yd * factor, 1.0).normalize()
}

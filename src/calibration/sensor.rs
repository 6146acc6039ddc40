//! Sensor-specific calibration behaviour.
//!
//! The scheduler drives every sensor through the same lifecycle; what
//! differs per sensor (which block is estimated, how it is seeded and how an
//! estimate is written into a rig) lives behind `SensorCalibration`.

use nalgebra::{DVector, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::{CameraIntrinsics, Rig};
use crate::geometry::SE3;
use crate::graph::PoseGraph;
use crate::optimizer::GraphSnapshot;

use super::estimator::{CalibrationTarget, CalibrationWindowEstimator, WindowEstimate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Camera,
    Imu,
}

impl SensorKind {
    /// Processing order; the IMU is gated on the camera.
    pub const ALL: [SensorKind; 2] = [SensorKind::Camera, SensorKind::Imu];
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorKind::Camera => write!(f, "camera"),
            SensorKind::Imu => write!(f, "imu"),
        }
    }
}

pub trait SensorCalibration: Send + Sync {
    fn kind(&self) -> SensorKind;

    fn target(&self) -> CalibrationTarget;

    /// Per-parameter weights used when scoring windows.
    fn weights(&self) -> &[f64];

    /// Whether window estimation needs inertial residuals.
    fn uses_imu(&self) -> bool;

    /// Number of poses a detected change is assumed to predate the
    /// detection by; the rollback pose is `pose_count - rollback_threshold`.
    fn rollback_threshold(&self) -> usize;

    /// Current value of the calibrated block, in window-mean layout.
    fn parameters(&self, rig: &Rig) -> DVector<f64>;

    /// Overwrites the calibrated block with a poor but unbiased seed.
    fn seed(&self, rig: &mut Rig);

    /// Writes a window mean into `rig`. Returns false if the mean does not
    /// match this sensor's parameter layout.
    fn apply(&self, rig: &mut Rig, mean: &DVector<f64>) -> bool;

    /// Propagates a rig change applied since pose `since` into the graph.
    /// `previous` is the live rig before the change.
    fn on_applied(&self, _graph: &mut PoseGraph, _previous: &Rig, _rig: &Rig, _since: usize) {}

    fn estimate_window(
        &self,
        estimator: &CalibrationWindowEstimator,
        snapshot: &GraphSnapshot,
        iterations: usize,
    ) -> Option<WindowEstimate> {
        estimator.estimate(snapshot, self.target(), iterations, self.weights())
    }
}

/// Camera intrinsics.
#[derive(Debug, Clone)]
pub struct CameraSelfCal {
    pub weights: Vec<f64>,
    pub seed_fov_deg: f64,
    pub num_change_needed: usize,
}

impl SensorCalibration for CameraSelfCal {
    fn kind(&self) -> SensorKind {
        SensorKind::Camera
    }

    fn target(&self) -> CalibrationTarget {
        CalibrationTarget::Intrinsics
    }

    fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn uses_imu(&self) -> bool {
        false
    }

    fn rollback_threshold(&self) -> usize {
        self.num_change_needed
    }

    fn parameters(&self, rig: &Rig) -> DVector<f64> {
        rig.intrinsics.params.clone()
    }

    fn seed(&self, rig: &mut Rig) {
        let cam = &rig.intrinsics;
        rig.intrinsics = CameraIntrinsics::wide_fov_seed(cam.model, cam.width, cam.height, self.seed_fov_deg);
    }

    fn apply(&self, rig: &mut Rig, mean: &DVector<f64>) -> bool {
        if mean.len() != rig.intrinsics.num_params() {
            return false;
        }
        rig.intrinsics.params = mean.clone();
        true
    }

    fn on_applied(&self, graph: &mut PoseGraph, _previous: &Rig, rig: &Rig, since: usize) {
        graph.set_cam_params_since(since, &rig.intrinsics.params);
        graph.backproject_tracks_since(since, &rig.intrinsics);
    }
}

/// Body-from-camera extrinsic.
#[derive(Debug, Clone)]
pub struct ImuSelfCal {
    /// Weights for `[t, r]`.
    pub weights: Vec<f64>,
    /// Estimate the rotation only, keeping the translation fixed.
    pub rotation_only: bool,
    pub num_change_needed: usize,
}

impl ImuSelfCal {
    fn dim(&self) -> usize {
        if self.rotation_only {
            3
        } else {
            6
        }
    }
}

impl SensorCalibration for ImuSelfCal {
    fn kind(&self) -> SensorKind {
        SensorKind::Imu
    }

    fn target(&self) -> CalibrationTarget {
        CalibrationTarget::Extrinsic {
            rotation_only: self.rotation_only,
        }
    }

    fn weights(&self) -> &[f64] {
        if self.rotation_only && self.weights.len() >= 6 {
            &self.weights[3..6]
        } else {
            &self.weights
        }
    }

    fn uses_imu(&self) -> bool {
        true
    }

    fn rollback_threshold(&self) -> usize {
        self.num_change_needed
    }

    fn parameters(&self, rig: &Rig) -> DVector<f64> {
        let full = rig.t_vs.log_decoupled();
        if self.rotation_only {
            full.rows(3, 3).into_owned()
        } else {
            full
        }
    }

    fn seed(&self, rig: &mut Rig) {
        rig.t_vs = SE3::identity();
    }

    fn apply(&self, rig: &mut Rig, mean: &DVector<f64>) -> bool {
        if mean.len() != self.dim() {
            return false;
        }
        if self.rotation_only {
            rig.t_vs.rotation = UnitQuaternion::from_scaled_axis(Vector3::new(mean[0], mean[1], mean[2]));
        } else {
            rig.t_vs = SE3::exp_decoupled(mean.as_slice());
        }
        true
    }

    /// Body poses were tracked through the old extrinsic, so they move with it.
    fn on_applied(&self, graph: &mut PoseGraph, previous: &Rig, rig: &Rig, since: usize) {
        graph.reexpress_poses_since(since, &previous.t_vs, &rig.t_vs);
    }
}

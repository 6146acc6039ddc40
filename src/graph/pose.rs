use nalgebra::{DVector, Vector3};

use crate::geometry::SE3;
use crate::imu::ImuBias;

use super::types::{BaHandles, BaInstance, TrackId};

/// A keyframe pose.
#[derive(Debug, Clone)]
pub struct Pose {
    /// World-from-body transform.
    pub t_wp: SE3,
    /// Linear velocity in world frame.
    pub v_w: Vector3<f64>,
    pub bias: ImuBias,
    /// Camera parameters in effect when this keyframe was observed.
    pub cam_params: DVector<f64>,
    pub time: f64,
    /// Tracks whose reference keypoint lives in this pose.
    pub tracks: Vec<TrackId>,
    /// Length of the longest track seen when this pose was created.
    pub longest_track: usize,
    /// Whether the pose was free in the last tracking BA.
    pub is_active: bool,
    pub ba_handles: BaHandles,
}

impl Pose {
    pub fn new(t_wp: SE3, v_w: Vector3<f64>, bias: ImuBias, cam_params: DVector<f64>, time: f64) -> Self {
        Self {
            t_wp,
            v_w,
            bias,
            cam_params,
            time,
            tracks: Vec::new(),
            longest_track: 0,
            is_active: false,
            ba_handles: [None; BaInstance::COUNT],
        }
    }
}

use nalgebra::{Vector2, Vector3};

use crate::camera::CameraIntrinsics;

use super::types::{BaHandles, BaInstance, TrackId};

/// Reference keypoint of a landmark: where it was first seen and how far.
#[derive(Debug, Clone, Copy)]
pub struct RefKeypoint {
    pub center_px: Vector2<f64>,
    /// Unit bearing in the reference camera frame.
    pub ray: Vector3<f64>,
    /// Inverse depth along `ray`.
    pub rho: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub px: Vector2<f64>,
    /// False when the tracker lost the patch in this frame.
    pub tracked: bool,
}

/// A landmark observed over a contiguous run of keyframes.
///
/// `observations[k]` belongs to pose `ref_pose + k`; `observations[0]` is the
/// reference keyframe itself.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub ref_pose: usize,
    pub ref_keypoint: RefKeypoint,
    pub observations: Vec<Observation>,
    pub is_outlier: bool,
    /// Still followed by the tracker in the newest frame.
    pub tracked: bool,
    pub num_good_tracked_frames: u32,
    /// Set when the reference ray was recomputed for new intrinsics and the
    /// tracker should refresh its patch geometry.
    pub needs_backprojection: bool,
    pub ba_handles: BaHandles,
}

impl Track {
    pub fn new(id: TrackId, ref_pose: usize, ref_keypoint: RefKeypoint) -> Self {
        Self {
            id,
            ref_pose,
            ref_keypoint,
            observations: vec![Observation {
                px: ref_keypoint.center_px,
                tracked: true,
            }],
            is_outlier: false,
            tracked: true,
            num_good_tracked_frames: 1,
            needs_backprojection: false,
            ba_handles: [None; BaInstance::COUNT],
        }
    }

    /// Index of the last pose this track was observed in.
    pub fn last_pose(&self) -> usize {
        self.ref_pose + self.observations.len() - 1
    }

    pub fn observation_at(&self, pose: usize) -> Option<&Observation> {
        pose.checked_sub(self.ref_pose)
            .and_then(|k| self.observations.get(k))
    }

    /// Usable as BA structure: at least two good frames and not rejected.
    pub fn is_usable(&self) -> bool {
        !self.is_outlier && self.num_good_tracked_frames > 1
    }

    /// Recompute the reference ray for new intrinsics, keeping inverse depth.
    pub fn backproject(&mut self, intrinsics: &CameraIntrinsics) {
        self.ref_keypoint.ray = intrinsics.unproject(&self.ref_keypoint.center_px);
        self.needs_backprojection = true;
    }
}

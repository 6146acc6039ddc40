//! Append-only pose/track arena shared by the tracker and the calibrator.

use anyhow::{bail, Result};
use nalgebra::{DVector, Vector2};

use crate::camera::CameraIntrinsics;
use crate::geometry::SE3;

use super::pose::Pose;
use super::track::{Observation, RefKeypoint, Track};
use super::types::TrackId;

/// Ordered keyframe poses and the landmark tracks anchored in them.
///
/// Poses are never removed and are addressed by position. Tracks live in a
/// separate arena and are only ever flagged (outlier / not tracked).
#[derive(Debug, Default, Clone)]
pub struct PoseGraph {
    poses: Vec<Pose>,
    tracks: Vec<Track>,
}

impl PoseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_poses(&self) -> usize {
        self.poses.len()
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn poses_mut(&mut self) -> &mut [Pose] {
        &mut self.poses
    }

    pub fn pose(&self, index: usize) -> Option<&Pose> {
        self.poses.get(index)
    }

    pub fn pose_mut(&mut self, index: usize) -> Option<&mut Pose> {
        self.poses.get_mut(index)
    }

    pub fn last_pose(&self) -> Option<&Pose> {
        self.poses.last()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(id.0)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(id.0)
    }

    /// Appends a keyframe pose and returns its index.
    ///
    /// Timestamps must be finite and strictly increasing. A violation means the upstream
    /// source is inconsistent and is reported as an error the caller is
    /// expected to treat as fatal.
    pub fn push_pose(&mut self, mut pose: Pose) -> Result<usize> {
        if !pose.time.is_finite() {
            bail!("keyframe timestamp {} is not finite", pose.time);
        }
        if let Some(last) = self.poses.last() {
            if pose.time <= last.time {
                bail!(
                    "keyframe timestamp {:.9} does not advance past {:.9} (pose {})",
                    pose.time,
                    last.time,
                    self.poses.len() - 1
                );
            }
        }
        pose.longest_track = self
            .longest_track_id()
            .and_then(|id| self.track(id))
            .map(|t| t.observations.len())
            .unwrap_or(0);
        self.poses.push(pose);
        Ok(self.poses.len() - 1)
    }

    /// Starts a new track whose reference keypoint lives in `ref_pose`.
    pub fn add_track(&mut self, ref_pose: usize, ref_keypoint: RefKeypoint) -> Result<TrackId> {
        if ref_pose >= self.poses.len() {
            bail!("track reference pose {} does not exist", ref_pose);
        }
        let id = TrackId(self.tracks.len());
        self.tracks.push(Track::new(id, ref_pose, ref_keypoint));
        self.poses[ref_pose].tracks.push(id);
        Ok(id)
    }

    /// Appends the observation of `id` in `pose`, which must directly follow
    /// the track's last observed pose.
    pub fn add_observation(&mut self, id: TrackId, pose: usize, px: Vector2<f64>, tracked: bool) -> Result<()> {
        if pose >= self.poses.len() {
            bail!("observation pose {} does not exist", pose);
        }
        let Some(track) = self.tracks.get_mut(id.0) else {
            bail!("unknown track {}", id);
        };
        if pose != track.last_pose() + 1 {
            bail!(
                "track {} observation at pose {} is not contiguous (last {})",
                id,
                pose,
                track.last_pose()
            );
        }
        track.observations.push(Observation { px, tracked });
        track.tracked = tracked;
        if tracked {
            track.num_good_tracked_frames += 1;
        }
        Ok(())
    }

    /// Marks tracks the tracker stopped following.
    pub fn mark_lost(&mut self, id: TrackId) {
        if let Some(track) = self.tracks.get_mut(id.0) {
            track.tracked = false;
        }
    }

    /// Tracks still followed by the tracker.
    pub fn current_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.tracked && !t.is_outlier)
    }

    /// The usable track with the most observations (lowest id on ties).
    pub fn longest_track_id(&self) -> Option<TrackId> {
        self.tracks
            .iter()
            .filter(|t| t.is_usable())
            .fold(None::<&Track>, |best, t| match best {
                Some(b) if b.observations.len() >= t.observations.len() => Some(b),
                _ => Some(t),
            })
            .map(|t| t.id)
    }

    /// Pose range for a BA with `num_active` free poses.
    ///
    /// Returns `(start_pose, start_active)`: poses in `[start_active, N)` are
    /// free; poses in `[start_pose, start_active)` are fixed but carry
    /// observations of landmarks that are also seen inside the window.
    pub fn ba_pose_range(&self, num_active: usize) -> (usize, usize) {
        let n = self.poses.len();
        let start_active = n.saturating_sub(num_active);
        let start_pose = self
            .tracks
            .iter()
            .filter(|t| t.is_usable() && t.last_pose() >= start_active)
            .map(|t| t.ref_pose)
            .min()
            .map_or(start_active, |p| p.min(start_active));
        (start_pose, start_active)
    }

    /// Overwrites the per-pose camera snapshot for every pose since `start`.
    pub fn set_cam_params_since(&mut self, start: usize, params: &DVector<f64>) {
        for pose in self.poses.iter_mut().skip(start) {
            pose.cam_params = params.clone();
        }
    }

    /// Re-expresses body poses since `start` for a new camera-to-body
    /// transform so that the camera poses they imply stay where they are.
    pub fn reexpress_poses_since(&mut self, start: usize, old_t_vs: &SE3, new_t_vs: &SE3) {
        let correction = old_t_vs.compose(&new_t_vs.inverse());
        for pose in self.poses.iter_mut().skip(start) {
            pose.t_wp = pose.t_wp.compose(&correction);
        }
    }

    /// Re-derives reference rays of tracks anchored at or after `start`.
    pub fn backproject_tracks_since(&mut self, start: usize, intrinsics: &CameraIntrinsics) -> usize {
        let mut count = 0;
        for track in self.tracks.iter_mut().filter(|t| t.ref_pose >= start) {
            track.backproject(intrinsics);
            count += 1;
        }
        count
    }

    /// Clears every outlier flag.
    pub fn reset_outliers(&mut self) {
        for track in &mut self.tracks {
            track.is_outlier = false;
        }
    }
}

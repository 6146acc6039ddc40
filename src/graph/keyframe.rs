//! What the tracker hands over for every new keyframe.

use anyhow::Result;
use nalgebra::{Vector2, Vector3};

use crate::camera::CameraIntrinsics;
use crate::geometry::SE3;
use crate::imu::{ImuBias, ImuSample};

use super::pose::Pose;
use super::store::PoseGraph;
use super::track::RefKeypoint;
use super::types::TrackId;

#[derive(Debug, Clone, Copy)]
pub struct TrackObservation {
    pub id: TrackId,
    pub px: Vector2<f64>,
    pub tracked: bool,
}

/// A landmark first seen in this keyframe.
#[derive(Debug, Clone, Copy)]
pub struct NewTrack {
    pub center_px: Vector2<f64>,
    /// Initial inverse depth.
    pub rho: f64,
}

#[derive(Debug, Clone)]
pub struct KeyframeInput {
    pub time: f64,
    /// Tracker estimate of world-from-body.
    pub t_wp: SE3,
    pub v_w: Vector3<f64>,
    pub bias: ImuBias,
    /// Observations of existing tracks in this keyframe.
    pub observations: Vec<TrackObservation>,
    /// Tracks the tracker stopped following.
    pub lost: Vec<TrackId>,
    pub new_tracks: Vec<NewTrack>,
    /// IMU samples received since the previous keyframe.
    pub imu: Vec<ImuSample>,
    pub num_successful_tracks: usize,
}

impl PoseGraph {
    /// Appends a keyframe with its observations and new tracks.
    ///
    /// New reference rays are unprojected with `intrinsics`, which also
    /// becomes the pose's camera-parameter snapshot. Returns the pose index
    /// and the ids of the new tracks, in input order.
    pub fn insert_keyframe(
        &mut self,
        frame: &KeyframeInput,
        intrinsics: &CameraIntrinsics,
    ) -> Result<(usize, Vec<TrackId>)> {
        let index = self.push_pose(Pose::new(
            frame.t_wp,
            frame.v_w,
            frame.bias,
            intrinsics.params.clone(),
            frame.time,
        ))?;
        for obs in &frame.observations {
            self.add_observation(obs.id, index, obs.px, obs.tracked)?;
        }
        for &id in &frame.lost {
            self.mark_lost(id);
        }
        let mut ids = Vec::with_capacity(frame.new_tracks.len());
        for new in &frame.new_tracks {
            let ray = intrinsics.unproject(&new.center_px);
            ids.push(self.add_track(
                index,
                RefKeypoint {
                    center_px: new.center_px,
                    ray,
                    rho: new.rho,
                },
            )?);
        }
        Ok((index, ids))
    }
}

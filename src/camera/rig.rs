//! Camera rig: intrinsics plus the body-from-camera extrinsic.

use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

use super::intrinsics::CameraIntrinsics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rig {
    pub intrinsics: CameraIntrinsics,
    /// Body(IMU)-from-camera transform.
    pub t_vs: SE3,
}

impl Rig {
    pub fn new(intrinsics: CameraIntrinsics, t_vs: SE3) -> Self {
        Self { intrinsics, t_vs }
    }

    /// World-from-camera for a world-from-body pose.
    pub fn camera_pose(&self, t_wp: &SE3) -> SE3 {
        t_wp.compose(&self.t_vs)
    }
}

/// The three logical rig copies.
///
/// `live` is what the tracker and the tracking BA consume. `selfcal` is the
/// scratch copy the calibration estimator writes into, and `aac` is the copy
/// the conditioning thread refreshes from `live` before every solve. Only
/// whole-rig assignments touch `live`, always under the graph lock.
#[derive(Debug, Clone)]
pub struct RigSet {
    pub live: Rig,
    pub selfcal: Rig,
    pub aac: Rig,
}

impl RigSet {
    pub fn new(rig: Rig) -> Self {
        Self {
            live: rig.clone(),
            selfcal: rig.clone(),
            aac: rig,
        }
    }

    /// Publish the scratch rig as the live rig.
    pub fn commit_selfcal(&mut self) {
        self.live = self.selfcal.clone();
    }

    pub fn refresh_aac(&mut self) -> &Rig {
        self.aac = self.live.clone();
        &self.aac
    }
}

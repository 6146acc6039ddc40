//! Constant-velocity motion guess with an insufficient-data fallback.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geometry::SE3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionModelConfig {
    /// Below this share of successfully tracked landmarks the guess falls
    /// back to no motion.
    pub min_success_ratio: f64,
    /// Below this many successful tracks the tracker pose is replaced by
    /// the guess.
    pub min_successful_tracks: usize,
}

impl Default for MotionModelConfig {
    fn default() -> Self {
        Self {
            min_success_ratio: 0.3,
            min_successful_tracks: 10,
        }
    }
}

/// Stands in for an exactly zero guess translation.
const MIN_GUESS_TRANSLATION: Vector3<f64> = Vector3::new(0.0, 0.0, 0.001);

#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    config: MotionModelConfig,
    prev_pose: Option<SE3>,
    /// Body motion between the last two keyframes, `T_prev^-1 T_curr`.
    delta: SE3,
}

impl MotionModel {
    pub fn new(config: MotionModelConfig) -> Self {
        Self {
            config,
            prev_pose: None,
            delta: SE3::identity(),
        }
    }

    /// Records the pose the last keyframe settled on.
    pub fn update(&mut self, pose: &SE3) {
        if let Some(prev) = &self.prev_pose {
            self.delta = prev.inverse().compose(pose);
        }
        self.prev_pose = Some(*pose);
    }

    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.delta = SE3::identity();
    }

    /// Relative motion expected for the next keyframe.
    pub fn relative_guess(&self, num_successful: usize, num_tracks: usize) -> SE3 {
        let ratio = if num_tracks == 0 {
            0.0
        } else {
            num_successful as f64 / num_tracks as f64
        };
        let mut guess = if ratio > self.config.min_success_ratio {
            self.delta
        } else {
            SE3::identity()
        };
        if guess.translation == Vector3::zeros() {
            guess.translation = MIN_GUESS_TRANSLATION;
        }
        guess
    }

    pub fn predict(&self, num_successful: usize, num_tracks: usize) -> Option<SE3> {
        self.prev_pose
            .map(|prev| prev.compose(&self.relative_guess(num_successful, num_tracks)))
    }

    /// The pose to insert for a keyframe: the tracker's estimate, or the
    /// motion guess when too few landmarks were tracked. The flag reports
    /// the fallback.
    pub fn resolve(&self, tracker_pose: SE3, num_successful: usize, num_tracks: usize) -> (SE3, bool) {
        if num_successful >= self.config.min_successful_tracks {
            return (tracker_pose, false);
        }
        match self.predict(num_successful, num_tracks) {
            Some(guess) => {
                warn!(num_successful, num_tracks, "too few tracks, using motion guess");
                (guess, true)
            }
            None => (tracker_pose, false),
        }
    }
}

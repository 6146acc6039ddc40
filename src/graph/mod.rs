//! Pose graph store: keyframe poses and landmark tracks in arena storage.

pub mod keyframe;
pub mod pose;
pub mod state;
pub mod store;
pub mod track;
pub mod types;

pub use keyframe::{KeyframeInput, NewTrack, TrackObservation};
pub use pose::Pose;
pub use state::{GraphState, IMU_BUFFER_CAPACITY};
pub use store::PoseGraph;
pub use track::{Observation, RefKeypoint, Track};
pub use types::{BaHandles, BaInstance, TrackId};

//! Keyframe pose prediction for the incoming tracker poses.

pub mod motion_model;

pub use motion_model::{MotionModel, MotionModelConfig};

//! Camera models and the calibrated rig.

pub mod intrinsics;
pub mod rig;

pub use intrinsics::{CameraIntrinsics, CameraModelKind};
pub use rig::{Rig, RigSet};

//! IMU measurements, buffering and preintegration.

pub mod buffer;
pub mod preintegration;
pub mod sample;

pub use buffer::ImuBuffer;
pub use preintegration::{preintegrate, PreintegratedState, Preintegrator};
pub use sample::{ImuBias, ImuNoise, ImuSample, GRAVITY};

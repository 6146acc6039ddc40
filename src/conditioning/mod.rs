//! Adaptive conditioning of the tracking bundle adjustment.

pub mod adaptive;

pub use adaptive::{AdaptiveConditioner, ConditioningConfig, ConditioningRatios, WindowDecision};

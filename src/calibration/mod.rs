//! Online calibration of the camera intrinsics and the camera-to-IMU
//! extrinsic.
//!
//! - `window` / `estimator`: calibration estimates over pose ranges
//! - `priority_queue`: the best windows seen so far and their aggregate
//! - `change_detector`: drift detection between aggregate and candidate
//! - `state` / `sensor`: per-sensor lifecycle and sensor-specific behaviour
//! - `tvs_init`: staged extrinsic initialization
//! - `scheduler`: what runs after every keyframe

pub mod change_detector;
pub mod estimator;
pub mod priority_queue;
pub mod scheduler;
pub mod sensor;
pub mod state;
pub mod tvs_init;
pub mod window;

pub use change_detector::{ChangeDetector, ChangeVerdict};
pub use estimator::{CalibrationTarget, CalibrationWindowEstimator, EstimatorConfig, WindowEstimate};
pub use priority_queue::{AggregationMode, Offer, WindowPriorityQueue};
pub use scheduler::{CalibrationBook, CalibrationScheduler, QueueInput, QueueWork, ScheduleOutcome};
pub use sensor::{CameraSelfCal, ImuSelfCal, SensorCalibration, SensorKind};
pub use state::{Calibration, CalibrationState, ExtrinsicInitStage};
pub use tvs_init::{RotationConstraint, TvsInitConfig, TvsInitializer};
pub use window::{window_score, CalibrationWindow};

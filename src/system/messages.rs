//! Messages sent from the keyframe thread to the background workers.

use crate::calibration::SensorKind;

/// Request to recompute a sensor's queue aggregate.
///
/// The worker re-reads the queue under lock, so the message carries no
/// windows; a job whose queue no longer needs aggregation is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueJob {
    pub sensor: SensorKind,
    /// Pose count when the job was requested.
    pub pose_count: usize,
}

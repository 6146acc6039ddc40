//! Everything guarded by the graph lock.

use crate::camera::{Rig, RigSet};
use crate::imu::ImuBuffer;

use super::store::PoseGraph;

/// Capacity of the raw IMU buffer, a few minutes at typical rates.
pub const IMU_BUFFER_CAPACITY: usize = 200_000;

pub struct GraphState {
    pub graph: PoseGraph,
    pub imu: ImuBuffer,
    pub rigs: RigSet,
    /// Clear every outlier flag before the next tracking BA.
    pub reset_outliers: bool,
}

impl GraphState {
    pub fn new(rig: Rig) -> Self {
        Self {
            graph: PoseGraph::new(),
            imu: ImuBuffer::new(IMU_BUFFER_CAPACITY),
            rigs: RigSet::new(rig),
            reset_outliers: false,
        }
    }
}

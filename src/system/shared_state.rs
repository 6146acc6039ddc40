//! State shared between the keyframe thread and the background workers.
//!
//! Lock order is fixed: `graph` first, then `calibration`. Every
//! extract-solve-readback sequence that needs both takes them in that order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::calibration::{CalibrationBook, CalibrationScheduler, SensorKind};
use crate::graph::GraphState;

pub struct SharedState {
    /// Pose graph, IMU buffer and rigs.
    pub graph: Mutex<GraphState>,
    /// Calibration states, queues and windows.
    pub calibration: Mutex<CalibrationBook>,
    /// Immutable after construction, usable from any thread.
    pub scheduler: CalibrationScheduler,

    shutdown_requested: AtomicBool,

    /// Per-sensor "queue aggregation in flight" flags.
    queue_running: [AtomicBool; 2],
}

impl SharedState {
    pub fn new(graph: GraphState, calibration: CalibrationBook, scheduler: CalibrationScheduler) -> Arc<Self> {
        Arc::new(Self {
            graph: Mutex::new(graph),
            calibration: Mutex::new(calibration),
            scheduler,
            shutdown_requested: AtomicBool::new(false),
            queue_running: [AtomicBool::new(false), AtomicBool::new(false)],
        })
    }

    /// Both locks, in order.
    pub fn lock_all(&self) -> (MutexGuard<'_, GraphState>, MutexGuard<'_, CalibrationBook>) {
        let graph = self.graph.lock();
        let calibration = self.calibration.lock();
        (graph, calibration)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    fn queue_flag(&self, kind: SensorKind) -> &AtomicBool {
        match kind {
            SensorKind::Camera => &self.queue_running[0],
            SensorKind::Imu => &self.queue_running[1],
        }
    }

    /// Claims the sensor's queue worker. False if a job is already in
    /// flight.
    pub fn try_start_queue_job(&self, kind: SensorKind) -> bool {
        self.queue_flag(kind)
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish_queue_job(&self, kind: SensorKind) {
        self.queue_flag(kind).store(false, Ordering::SeqCst);
    }

    pub fn is_queue_job_running(&self, kind: SensorKind) -> bool {
        self.queue_flag(kind).load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, Rig};
    use crate::config::SelfCalConfig;
    use crate::geometry::SE3;
    use crate::metrics::Metrics;
    use crate::optimizer::DenseSolver;

    fn shared() -> Arc<SharedState> {
        let config = SelfCalConfig::default();
        let rig = Rig::new(
            CameraIntrinsics::pinhole(640, 480, 400.0, 400.0, 320.0, 240.0),
            SE3::identity(),
        );
        let book = CalibrationBook::new(&config);
        let scheduler = CalibrationScheduler::new(config, Arc::new(DenseSolver), Arc::new(Metrics::new()));
        SharedState::new(GraphState::new(rig), book, scheduler)
    }

    #[test]
    fn test_queue_job_claimed_once() {
        let shared = shared();
        assert!(shared.try_start_queue_job(SensorKind::Camera));
        assert!(!shared.try_start_queue_job(SensorKind::Camera));
        assert!(shared.try_start_queue_job(SensorKind::Imu));
        shared.finish_queue_job(SensorKind::Camera);
        assert!(!shared.is_queue_job_running(SensorKind::Camera));
        assert!(shared.is_queue_job_running(SensorKind::Imu));
        assert!(shared.try_start_queue_job(SensorKind::Camera));
    }

    #[test]
    fn test_shutdown_flag() {
        let shared = shared();
        assert!(!shared.is_shutdown_requested());
        shared.request_shutdown();
        assert!(shared.is_shutdown_requested());
    }
}

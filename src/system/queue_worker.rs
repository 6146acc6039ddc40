//! Asynchronous priority-queue aggregation, one worker per sensor.
//!
//! Each job runs in three phases so the solve does not block the keyframe
//! thread:
//!
//! 1. collect (both locks): copy the queue, or the poses a joint solve needs
//! 2. solve (no lock)
//! 3. apply (both locks): install the aggregate unless the queue changed or
//!    the sensor left `OnlineActive` in the meantime

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

use crate::calibration::SensorKind;
use crate::metrics::{timed, Phase};

use super::messages::QueueJob;
use super::shared_state::SharedState;

/// Lets the worker notice shutdown while idle.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

pub struct QueueWorker {
    sensor: SensorKind,
}

impl QueueWorker {
    pub fn new(sensor: SensorKind) -> Self {
        Self { sensor }
    }

    /// Runs until shutdown is requested or the channel is closed.
    pub fn run(&self, jobs: Receiver<QueueJob>, shared: Arc<SharedState>) {
        loop {
            if shared.is_shutdown_requested() {
                break;
            }
            match jobs.recv_timeout(RECV_TIMEOUT) {
                Ok(job) => {
                    self.process(job, &shared);
                    shared.finish_queue_job(self.sensor);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(sensor = %self.sensor, "queue worker stopped");
    }

    /// Returns true when the live rig changed.
    fn process(&self, job: QueueJob, shared: &SharedState) -> bool {
        let scheduler = &shared.scheduler;

        let work = {
            let (gs, book) = shared.lock_all();
            if !scheduler.needs_aggregation(&book, self.sensor) {
                trace!(sensor = %self.sensor, "queue already aggregated");
                return false;
            }
            scheduler.collect_queue_work(&gs, &book, self.sensor)
        };
        let Some(work) = work else {
            return false;
        };

        let result = timed(scheduler.metrics(), Phase::Queue, || scheduler.solve_queue_work(&work));

        let (mut gs, mut book) = shared.lock_all();
        let applied = scheduler.apply_queue_result(&mut gs, &mut book, self.sensor, work.generation, result);
        debug!(
            sensor = %self.sensor,
            requested_at = job.pose_count,
            pose_count = gs.graph.num_poses(),
            applied,
            "asynchronous queue aggregation finished"
        );
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationBook, CalibrationScheduler, CalibrationWindow};
    use crate::camera::{CameraIntrinsics, Rig};
    use crate::config::SelfCalConfig;
    use crate::geometry::SE3;
    use crate::graph::GraphState;
    use crate::metrics::Metrics;
    use crate::optimizer::DenseSolver;
    use approx::assert_relative_eq;
    use crossbeam_channel::bounded;
    use nalgebra::{DMatrix, DVector};

    fn shared() -> Arc<SharedState> {
        let config = SelfCalConfig::default();
        let rig = Rig::new(
            CameraIntrinsics::pinhole(640, 480, 400.0, 400.0, 320.0, 240.0),
            SE3::identity(),
        );
        let mut book = CalibrationBook::new(&config);
        for start in [0, 10] {
            let window = CalibrationWindow::new(
                start,
                start + 10,
                DVector::from_vec(vec![402.0, 398.0, 321.0, 241.0]),
                DMatrix::identity(4, 4),
                &[],
            );
            book.sensor_mut(SensorKind::Camera).queue.offer(&window);
        }
        let scheduler = CalibrationScheduler::new(config, Arc::new(DenseSolver), Arc::new(Metrics::new()));
        SharedState::new(GraphState::new(rig), book, scheduler)
    }

    #[test]
    fn test_job_installs_aggregate() {
        let shared = shared();
        let worker = QueueWorker::new(SensorKind::Camera);
        let job = QueueJob {
            sensor: SensorKind::Camera,
            pose_count: 20,
        };
        assert!(worker.process(job, &shared));
        assert_relative_eq!(shared.graph.lock().rigs.live.intrinsics.params[0], 402.0, epsilon = 1e-9);
        let book = shared.calibration.lock();
        assert!(!book.sensor(SensorKind::Camera).queue.needs_update());
        assert!(!book.sensor(SensorKind::Camera).pq_window.is_empty());
        drop(book);
        // Nothing left to do.
        assert!(!worker.process(job, &shared));
    }

    #[test]
    fn test_worker_clears_running_flag_and_stops() {
        let shared = shared();
        let (tx, rx) = bounded(1);
        assert!(shared.try_start_queue_job(SensorKind::Camera));
        tx.send(QueueJob {
            sensor: SensorKind::Camera,
            pose_count: 20,
        })
        .unwrap();
        drop(tx);
        QueueWorker::new(SensorKind::Camera).run(rx, shared.clone());
        assert!(!shared.is_queue_job_running(SensorKind::Camera));
        assert_relative_eq!(shared.graph.lock().rigs.live.intrinsics.params[1], 398.0, epsilon = 1e-9);
    }
}

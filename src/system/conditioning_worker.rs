//! Background adaptive-conditioning loop.
//!
//! Each outer cycle solves the active window with the conditioning BA and
//! keeps growing it while the boundary residuals say the fixed pose before
//! the window is not constraining it enough. Between cycles the thread
//! sleeps.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::conditioning::{AdaptiveConditioner, ConditioningConfig, WindowDecision};
use crate::graph::BaInstance;
use crate::metrics::{timed, Phase};
use crate::optimizer::BaRequest;

use super::shared_state::SharedState;

pub struct ConditioningWorker {
    conditioner: AdaptiveConditioner,
}

impl ConditioningWorker {
    pub fn new(config: ConditioningConfig) -> Self {
        Self {
            conditioner: AdaptiveConditioner::new(config),
        }
    }

    pub fn active_poses(&self) -> usize {
        self.conditioner.active_poses()
    }

    pub fn run(&mut self, shared: Arc<SharedState>) {
        let idle = Duration::from_millis(self.conditioner.config().idle_interval_ms);
        while !shared.is_shutdown_requested() {
            self.cycle(&shared);
            thread::sleep(idle);
        }
        debug!("conditioning worker stopped");
    }

    /// One outer cycle. Returns the number of conditioning solves run.
    pub fn cycle(&mut self, shared: &SharedState) -> usize {
        let scheduler = &shared.scheduler;
        let config = self.conditioner.config().clone();
        // The graph has moved on since the last cycle.
        self.conditioner.forget_error();
        let mut solves = 0;
        loop {
            if shared.is_shutdown_requested() {
                break;
            }
            // The graph lock is held for the whole extract-solve-readback.
            let mut guard = shared.graph.lock();
            let gs = &mut *guard;
            let pose_count = gs.graph.num_poses();
            let imu_ready = {
                let book = shared.calibration.lock();
                scheduler.imu_usable(&book, pose_count, config.min_poses)
            };
            if !imu_ready {
                trace!(pose_count, "conditioning idle until the IMU is usable");
                break;
            }

            gs.rigs.refresh_aac();
            let mut request = BaRequest::new(BaInstance::Conditioning, self.conditioner.active_poses(), true);
            request.iterations = Some(config.iterations);
            let result = timed(scheduler.metrics(), Phase::Conditioning, || {
                scheduler
                    .invoker()
                    .run(&mut gs.graph, Some(&gs.imu), &gs.rigs.aac, &request)
            });
            drop(guard);
            let Some(result) = result else {
                break;
            };
            solves += 1;

            let decision = self.conditioner.update(&result.conditioning, pose_count);
            if decision != WindowDecision::Grow || self.conditioner.active_poses() >= pose_count {
                break;
            }
        }
        solves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationBook, CalibrationScheduler};
    use crate::config::SelfCalConfig;
    use crate::graph::GraphState;
    use crate::metrics::Metrics;
    use crate::optimizer::DenseSolver;
    use crate::simulation::{Scenario, SimulationConfig};

    fn shared(poses: usize) -> (Arc<SharedState>, Arc<Metrics>) {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(poses);
        let mut gs = GraphState::new(sim.true_rig());
        gs.graph = graph;
        gs.imu = imu;
        let config = SelfCalConfig::default();
        let book = CalibrationBook::new(&config);
        let metrics = Arc::new(Metrics::new());
        let scheduler = CalibrationScheduler::new(config, Arc::new(DenseSolver), metrics.clone());
        (SharedState::new(gs, book, scheduler), metrics)
    }

    #[test]
    fn test_idle_with_too_few_poses() {
        let (shared, metrics) = shared(6);
        let mut worker = ConditioningWorker::new(ConditioningConfig::default());
        assert_eq!(worker.cycle(&shared), 0);
        assert_eq!(metrics.snapshot().conditioning.calls, 0);
    }

    #[test]
    fn test_cycle_keeps_window_within_bounds() {
        let (shared, metrics) = shared(14);
        let mut worker = ConditioningWorker::new(ConditioningConfig {
            baseline_poses: 4,
            increment: 3,
            ..ConditioningConfig::default()
        });
        let solves = worker.cycle(&shared);
        assert!(solves >= 1);
        assert_eq!(metrics.snapshot().conditioning.calls as usize, solves);
        assert!(worker.active_poses() >= 4);
        assert!(worker.active_poses() <= 14);
    }

    #[test]
    fn test_consecutive_cycles_start_fresh() {
        let (shared, metrics) = shared(14);
        let mut worker = ConditioningWorker::new(ConditioningConfig {
            baseline_poses: 4,
            increment: 3,
            ..ConditioningConfig::default()
        });
        let first = worker.cycle(&shared);
        let second = worker.cycle(&shared);
        assert!(first >= 1);
        assert!(second >= 1);
        assert_eq!(metrics.snapshot().conditioning.calls as usize, first + second);
        assert!(worker.active_poses() <= 14);
    }
}

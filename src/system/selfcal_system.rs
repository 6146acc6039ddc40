//! Self-calibrating estimator - main entry point and thread orchestration.
//!
//! `SelfCalSystem` owns the shared state, runs the per-keyframe pass on the
//! caller's thread and spawns the background workers: the conditioning loop
//! and, for sensors configured for it, an asynchronous queue worker.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::{debug, info, trace};

use crate::calibration::{CalibrationBook, CalibrationScheduler, CalibrationState, SensorKind};
use crate::camera::Rig;
use crate::config::SelfCalConfig;
use crate::graph::{GraphState, KeyframeInput, TrackId};
use crate::metrics::{CalibrationEvent, Metrics, MetricsSnapshot};
use crate::optimizer::{DenseSolver, NonlinearSolver};
use crate::tracking::{MotionModel, MotionModelConfig};

use super::conditioning_worker::ConditioningWorker;
use super::messages::QueueJob;
use super::queue_worker::QueueWorker;
use super::shared_state::SharedState;

/// One pending job per sensor is enough; the running flag drops the rest.
const QUEUE_CHANNEL_CAPACITY: usize = 1;

/// What processing one keyframe produced.
#[derive(Debug, Clone)]
pub struct KeyframeOutcome {
    pub pose_index: usize,
    /// Ids of the keyframe's new tracks, in input order.
    pub new_tracks: Vec<TrackId>,
    /// The tracker pose was replaced by the motion guess.
    pub used_motion_guess: bool,
    pub camera: CalibrationState,
    pub imu: CalibrationState,
    pub converged: Vec<SensorKind>,
    pub changes: Vec<SensorKind>,
    /// Mean reprojection error on the new pose after the tracking BA.
    pub last_frame_error: Option<f64>,
}

pub struct SelfCalSystem {
    shared: Arc<SharedState>,
    metrics: Arc<Metrics>,
    motion: MotionModel,
    queue_senders: Vec<(SensorKind, Sender<QueueJob>)>,
    handles: Vec<JoinHandle<()>>,
}

impl SelfCalSystem {
    pub fn new(config: SelfCalConfig, rig: Rig) -> Result<Self> {
        Self::with_solver(config, rig, Arc::new(DenseSolver))
    }

    pub fn with_solver(config: SelfCalConfig, rig: Rig, solver: Arc<dyn NonlinearSolver>) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new());
        let scheduler = CalibrationScheduler::new(config.clone(), solver, metrics.clone());
        let mut graph = GraphState::new(rig);
        let mut book = CalibrationBook::new(&config);
        scheduler.start(&mut graph, &mut book)?;
        let shared = SharedState::new(graph, book, scheduler);

        let mut system = Self {
            shared,
            metrics,
            motion: MotionModel::new(MotionModelConfig::default()),
            queue_senders: Vec::new(),
            handles: Vec::new(),
        };

        for kind in SensorKind::ALL {
            let async_queue = match kind {
                SensorKind::Camera => config.camera.async_queue,
                SensorKind::Imu => config.imu.async_queue,
            };
            if async_queue {
                system.spawn_queue_worker(kind)?;
            }
        }
        if config.conditioning.enabled && config.has_imu && config.use_imu {
            system.spawn_conditioning_worker(&config)?;
        }
        info!(
            workers = system.handles.len(),
            camera = ?system.calibration_state(SensorKind::Camera),
            imu = ?system.calibration_state(SensorKind::Imu),
            "self-calibration started"
        );
        Ok(system)
    }

    fn spawn_queue_worker(&mut self, kind: SensorKind) -> Result<()> {
        let (sender, receiver) = bounded::<QueueJob>(QUEUE_CHANNEL_CAPACITY);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("queue-{}", kind))
            .spawn(move || QueueWorker::new(kind).run(receiver, shared))
            .with_context(|| format!("Failed to spawn {} queue worker", kind))?;
        self.queue_senders.push((kind, sender));
        self.handles.push(handle);
        Ok(())
    }

    fn spawn_conditioning_worker(&mut self, config: &SelfCalConfig) -> Result<()> {
        let shared = self.shared.clone();
        let mut worker = ConditioningWorker::new(config.conditioning.clone());
        let handle = thread::Builder::new()
            .name("conditioning".to_string())
            .spawn(move || worker.run(shared))
            .context("Failed to spawn conditioning worker")?;
        self.handles.push(handle);
        Ok(())
    }

    /// Inserts a keyframe and runs the calibration pass for it.
    ///
    /// Fails when the keyframe does not advance time; the graph is left
    /// unchanged in that case.
    pub fn process_keyframe(&mut self, frame: KeyframeInput) -> Result<KeyframeOutcome> {
        let (outcome, requests) = {
            let (mut guard, mut book) = self.shared.lock_all();
            let gs = &mut *guard;

            let num_tracks = gs.graph.current_tracks().count();
            let (t_wp, used_motion_guess) = self.motion.resolve(frame.t_wp, frame.num_successful_tracks, num_tracks);
            let frame = KeyframeInput { t_wp, ..frame };

            let (pose_index, new_tracks) = gs
                .graph
                .insert_keyframe(&frame, &gs.rigs.live.intrinsics)
                .with_context(|| format!("Failed to insert keyframe at t={:.6}", frame.time))?;
            for sample in &frame.imu {
                gs.imu.add(*sample);
            }

            let schedule = self.shared.scheduler.after_keyframe(gs, &mut book)?;
            if let Some(pose) = gs.graph.pose(pose_index) {
                self.motion.update(&pose.t_wp);
            }

            let outcome = KeyframeOutcome {
                pose_index,
                new_tracks,
                used_motion_guess,
                camera: book.sensor(SensorKind::Camera).state(),
                imu: book.sensor(SensorKind::Imu).state(),
                converged: schedule.converged,
                changes: schedule.changes,
                last_frame_error: schedule.bundle_adjustment.and_then(|ba| ba.last_frame_error),
            };
            (outcome, schedule.queue_requests)
        };

        for kind in requests {
            self.request_queue_job(kind, outcome.pose_index + 1);
        }
        Ok(outcome)
    }

    fn request_queue_job(&self, kind: SensorKind, pose_count: usize) {
        let Some((_, sender)) = self.queue_senders.iter().find(|(k, _)| *k == kind) else {
            return;
        };
        if !self.shared.try_start_queue_job(kind) {
            trace!(sensor = %kind, "queue aggregation already running");
            return;
        }
        match sender.try_send(QueueJob { sensor: kind, pose_count }) {
            Ok(()) => debug!(sensor = %kind, pose_count, "queue aggregation requested"),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.finish_queue_job(kind);
            }
        }
    }

    /// Copy of the rig the tracker should use.
    pub fn live_rig(&self) -> Rig {
        self.shared.graph.lock().rigs.live.clone()
    }

    pub fn calibration_state(&self, kind: SensorKind) -> CalibrationState {
        self.shared.calibration.lock().sensor(kind).state()
    }

    pub fn num_poses(&self) -> usize {
        self.shared.graph.lock().graph.num_poses()
    }

    /// Clears every outlier flag before the next tracking BA.
    pub fn request_reset_outliers(&self) {
        self.shared.graph.lock().reset_outliers = true;
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn recent_events(&self) -> Vec<CalibrationEvent> {
        self.metrics.recent_events()
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Stops the workers and waits for them.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        self.queue_senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SelfCalSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

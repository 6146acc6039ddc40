//! Per-keyframe calibration scheduling.
//!
//! Runs after every keyframe insertion with the graph and calibration locks
//! held, in this order:
//!
//! 1. batch estimation for sensors converging after a change
//! 2. tracking bundle adjustment
//! 3. online candidate analysis and change detection
//! 4. priority-queue aggregation, inline or handed to a worker
//!
//! Queue aggregation is split into collect / solve / apply so a worker can
//! run the solve without holding either lock.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use crate::config::{SelfCalConfig, SensorConfig};
use crate::graph::{BaInstance, GraphState};
use crate::metrics::{timed, CalibrationEvent, MetricsSink, Phase};
use crate::optimizer::{BaRequest, BaResultData, BundleAdjustmentInvoker, GraphSnapshot, NonlinearSolver};

use super::change_detector::{ChangeDetector, ChangeVerdict};
use super::estimator::CalibrationWindowEstimator;
use super::priority_queue::{AggregationMode, WindowPriorityQueue};
use super::sensor::{CameraSelfCal, ImuSelfCal, SensorCalibration, SensorKind};
use super::state::{Calibration, CalibrationState, ExtrinsicInitStage};
use super::tvs_init::TvsInitializer;
use super::window::CalibrationWindow;

/// Calibration bookkeeping guarded by the calibration lock.
#[derive(Debug, Clone)]
pub struct CalibrationBook {
    camera: Calibration,
    imu: Calibration,
    pub tvs_init: TvsInitializer,
}

impl CalibrationBook {
    pub fn new(config: &SelfCalConfig) -> Self {
        let make = |kind: SensorKind, sensor: &SensorConfig| {
            Calibration::new(
                kind,
                sensor.enabled,
                sensor.segment_length,
                ChangeDetector::new(sensor.divergence_threshold, sensor.num_change_needed),
                WindowPriorityQueue::new(sensor.queue_capacity, sensor.acceptance_margin),
            )
        };
        Self {
            camera: make(SensorKind::Camera, &config.camera),
            imu: make(SensorKind::Imu, &config.imu),
            tvs_init: TvsInitializer::new(config.tvs_init.clone()),
        }
    }

    pub fn sensor(&self, kind: SensorKind) -> &Calibration {
        match kind {
            SensorKind::Camera => &self.camera,
            SensorKind::Imu => &self.imu,
        }
    }

    pub fn sensor_mut(&mut self, kind: SensorKind) -> &mut Calibration {
        match kind {
            SensorKind::Camera => &mut self.camera,
            SensorKind::Imu => &mut self.imu,
        }
    }
}

/// What one keyframe's scheduling pass did.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    pub bundle_adjustment: Option<BaResultData>,
    pub converged: Vec<SensorKind>,
    pub changes: Vec<SensorKind>,
    /// Sensors whose queue aggregation is left to the asynchronous worker.
    pub queue_requests: Vec<SensorKind>,
}

/// Queue aggregation input copied out under lock.
#[derive(Debug, Clone)]
pub enum QueueInput {
    Fuse(WindowPriorityQueue),
    Joint(GraphSnapshot),
}

#[derive(Debug, Clone)]
pub struct QueueWork {
    pub sensor: SensorKind,
    /// Queue generation the input was taken at.
    pub generation: u64,
    pub input: QueueInput,
}

pub struct CalibrationScheduler {
    config: SelfCalConfig,
    camera: CameraSelfCal,
    imu: ImuSelfCal,
    estimator: CalibrationWindowEstimator,
    invoker: BundleAdjustmentInvoker,
    metrics: Arc<dyn MetricsSink>,
}

impl CalibrationScheduler {
    pub fn new(config: SelfCalConfig, solver: Arc<dyn NonlinearSolver>, metrics: Arc<dyn MetricsSink>) -> Self {
        let camera = CameraSelfCal {
            weights: config.camera.weights.clone(),
            seed_fov_deg: config.seed_fov_deg,
            num_change_needed: config.camera.num_change_needed as usize,
        };
        let imu = ImuSelfCal {
            weights: config.imu.weights.clone(),
            rotation_only: config.imu_rotation_only,
            num_change_needed: config.imu.num_change_needed as usize,
        };
        let estimator = CalibrationWindowEstimator::new(config.estimator.clone(), config.imu_noise, solver.clone());
        let invoker = BundleAdjustmentInvoker::new(config.bundle_adjustment.clone(), config.imu_noise, solver);
        Self {
            config,
            camera,
            imu,
            estimator,
            invoker,
            metrics,
        }
    }

    pub fn config(&self) -> &SelfCalConfig {
        &self.config
    }

    pub fn invoker(&self) -> &BundleAdjustmentInvoker {
        &self.invoker
    }

    pub fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    pub fn behaviour(&self, kind: SensorKind) -> &dyn SensorCalibration {
        match kind {
            SensorKind::Camera => &self.camera,
            SensorKind::Imu => &self.imu,
        }
    }

    fn sensor_config(&self, kind: SensorKind) -> &SensorConfig {
        match kind {
            SensorKind::Camera => &self.config.camera,
            SensorKind::Imu => &self.config.imu,
        }
    }

    /// Whether self-calibration currently runs for `kind`. The extrinsic is
    /// only estimated once the intrinsics are trusted.
    pub fn is_active(&self, book: &CalibrationBook, kind: SensorKind) -> bool {
        match kind {
            SensorKind::Camera => book.camera.enabled,
            SensorKind::Imu => {
                self.config.has_imu
                    && self.config.use_imu
                    && book.imu.enabled
                    && book.camera.state() == CalibrationState::OnlineActive
            }
        }
    }

    /// Inertial residuals may join the tracking BA.
    pub fn imu_usable(&self, book: &CalibrationBook, pose_count: usize, min_poses: usize) -> bool {
        self.config.has_imu && self.config.use_imu && pose_count > min_poses && !book.imu.is_unknown()
    }

    /// Puts every sensor configured as unknown at start into batch mode.
    pub fn start(&self, gs: &mut GraphState, book: &mut CalibrationBook) -> Result<()> {
        for kind in SensorKind::ALL {
            if self.sensor_config(kind).unknown_at_start && book.sensor(kind).enabled {
                book.sensor_mut(kind).start_unknown();
                self.enter_batch(gs, book, kind, 0)?;
            }
        }
        Ok(())
    }

    /// Seeds the sensor's block and starts its batch phase.
    fn enter_batch(
        &self,
        gs: &mut GraphState,
        book: &mut CalibrationBook,
        kind: SensorKind,
        rollback: usize,
    ) -> Result<()> {
        let behaviour = self.behaviour(kind);
        behaviour.seed(&mut gs.rigs.selfcal);
        if self.config.apply_results {
            let previous = gs.rigs.live.clone();
            gs.rigs.commit_selfcal();
            behaviour.on_applied(&mut gs.graph, &previous, &gs.rigs.live, rollback);
        }
        book.sensor_mut(kind).begin_batch()?;
        if kind == SensorKind::Imu {
            book.tvs_init.reset(rollback);
        }
        info!(sensor = %kind, rollback, "calibration seeded, batch estimation started");
        Ok(())
    }

    /// The scheduling pass for the keyframe just inserted.
    pub fn after_keyframe(&self, gs: &mut GraphState, book: &mut CalibrationBook) -> Result<ScheduleOutcome> {
        let mut outcome = ScheduleOutcome::default();
        let sink = self.metrics.as_ref();

        for kind in SensorKind::ALL {
            if self.is_active(book, kind) && book.sensor(kind).state() == CalibrationState::BatchConverging {
                if timed(sink, Phase::Batch, || self.batch_step(gs, book, kind))? {
                    outcome.converged.push(kind);
                }
            }
        }

        outcome.bundle_adjustment = timed(sink, Phase::BundleAdjustment, || self.tracking_ba(gs, book));

        for kind in SensorKind::ALL {
            if !self.is_active(book, kind) || book.sensor(kind).state() != CalibrationState::OnlineActive {
                continue;
            }
            if timed(sink, Phase::Analyze, || self.analyse(gs, book, kind))? {
                outcome.changes.push(kind);
                continue;
            }
            if !self.needs_aggregation(book, kind) {
                continue;
            }
            if self.sensor_config(kind).async_queue {
                outcome.queue_requests.push(kind);
            } else {
                timed(sink, Phase::Queue, || self.aggregate_now(gs, book, kind));
            }
        }
        Ok(outcome)
    }

    /// One batch estimate over everything since the rollback pose. Returns
    /// true when the sensor went online.
    fn batch_step(&self, gs: &mut GraphState, book: &mut CalibrationBook, kind: SensorKind) -> Result<bool> {
        let pose_count = gs.graph.num_poses();
        let cal = book.sensor(kind);
        let (rollback, segment_length) = (cal.rollback_pose, cal.segment_length);
        let segment = cal.segment_since_rollback(pose_count);
        if segment <= segment_length {
            return Ok(false);
        }
        if kind == SensorKind::Imu && !self.initialize_extrinsic(gs, book) {
            return Ok(false);
        }

        let behaviour = self.behaviour(kind);
        let indices: Vec<usize> = (rollback..pose_count).collect();
        let imu = behaviour.uses_imu().then_some(&gs.imu);
        let snapshot = GraphSnapshot::collect(&gs.graph, imu, &gs.rigs.selfcal, &indices);
        let window = match behaviour.estimate_window(&self.estimator, &snapshot, self.config.batch_iterations) {
            Some(estimate) => estimate.window,
            None => {
                debug!(sensor = %kind, rollback, pose_count, "no batch estimate");
                CalibrationWindow::empty()
            }
        };
        if !window.is_empty() {
            self.apply_window(gs, kind, rollback, &window);
        }

        let u = window.uncertainty;
        let converged =
            window.is_applicable() && u != 0.0 && u.is_finite() && u < self.config.batch_convergence_uncertainty;
        let timed_out = segment > 2 * segment_length;
        if !converged && !timed_out {
            debug!(sensor = %kind, segment, uncertainty = u, "batch still converging");
            return Ok(false);
        }
        if !converged {
            warn!(sensor = %kind, segment, uncertainty = u, "batch did not converge, going online anyway");
        }
        let cal = book.sensor_mut(kind);
        cal.finish_batch()?;
        cal.current_window = window;
        self.metrics.record_event(CalibrationEvent::BatchConverged {
            sensor: kind,
            pose_count,
            uncertainty: u,
        });
        Ok(true)
    }

    /// Advances the staged extrinsic initialization. Returns true once the
    /// joint batch may run.
    fn initialize_extrinsic(&self, gs: &mut GraphState, book: &mut CalibrationBook) -> bool {
        let since = book.imu.rollback_pose;
        match book.imu.init_stage {
            Some(ExtrinsicInitStage::Rotation) => {
                book.tvs_init.add_constraints(&gs.graph, &gs.imu, &gs.rigs.selfcal);
                if !book.tvs_init.is_ready() {
                    trace!(constraints = book.tvs_init.constraints().len(), "collecting rotation constraints");
                    return false;
                }
                let Some(rotation) = book.tvs_init.solve_rotation(&gs.rigs.selfcal.t_vs.rotation) else {
                    return false;
                };
                gs.rigs.selfcal.t_vs.rotation = rotation;
                self.publish_extrinsic(gs, since);
                book.imu.init_stage = Some(ExtrinsicInitStage::Translation);
                false
            }
            Some(ExtrinsicInitStage::Translation) => {
                if !self.imu.rotation_only {
                    let current = gs.rigs.selfcal.t_vs.translation;
                    gs.rigs.selfcal.t_vs.translation = book.tvs_init.seed_translation(&current);
                }
                self.publish_extrinsic(gs, since);
                book.imu.init_stage = Some(ExtrinsicInitStage::Refinement);
                true
            }
            Some(ExtrinsicInitStage::Refinement) | None => true,
        }
    }

    /// Makes the scratch extrinsic live and moves the body poses since
    /// `since` with it.
    fn publish_extrinsic(&self, gs: &mut GraphState, since: usize) {
        if !self.config.apply_results {
            return;
        }
        let previous = gs.rigs.live.clone();
        gs.rigs.live.t_vs = gs.rigs.selfcal.t_vs;
        self.imu.on_applied(&mut gs.graph, &previous, &gs.rigs.live, since);
    }

    /// Writes a window mean into the rigs and propagates it into the graph
    /// from pose `since` on. Returns true when the live rig changed.
    ///
    /// Rank-deficient windows are never applied, whatever their score.
    pub fn apply_window(&self, gs: &mut GraphState, kind: SensorKind, since: usize, window: &CalibrationWindow) -> bool {
        if !window.is_applicable() {
            warn!(
                sensor = %kind,
                dim = window.dim(),
                rank = window.rank(),
                "rank-deficient calibration window not applied"
            );
            return false;
        }
        let behaviour = self.behaviour(kind);
        let mut staged = gs.rigs.selfcal.clone();
        if !behaviour.apply(&mut staged, &window.mean) {
            warn!(sensor = %kind, dim = window.dim(), "calibration window does not fit the rig");
            return false;
        }
        gs.rigs.selfcal = staged;
        if !self.config.apply_results {
            return false;
        }
        let previous = gs.rigs.live.clone();
        gs.rigs.commit_selfcal();
        behaviour.on_applied(&mut gs.graph, &previous, &gs.rigs.live, since);
        info!(sensor = %kind, start = window.start, end = window.end, score = window.score, "rig updated");
        self.metrics.record_event(CalibrationEvent::RigUpdated {
            sensor: kind,
            start: window.start,
            end: window.end,
        });
        true
    }

    /// Skipped while the intrinsics are converging: the seeded intrinsics
    /// would pull the tracked poses away from the geometry the batch needs.
    fn tracking_ba(&self, gs: &mut GraphState, book: &CalibrationBook) -> Option<BaResultData> {
        if book.camera.enabled && book.camera.state() == CalibrationState::BatchConverging {
            debug!("tracking bundle adjustment held until the intrinsics converge");
            return None;
        }
        let pose_count = gs.graph.num_poses();
        let baseline = self.config.bundle_adjustment.num_active_poses;
        // Sensors still converging need their whole unknown segment free.
        let num_active = SensorKind::ALL
            .iter()
            .filter(|&&kind| self.is_active(book, kind) && book.sensor(kind).is_unknown())
            .map(|&kind| book.sensor(kind).segment_since_rollback(pose_count))
            .fold(baseline, usize::max);

        let use_imu = self.imu_usable(book, pose_count, self.config.min_poses_for_imu);
        let mut request = BaRequest::new(BaInstance::Tracking, num_active, use_imu);
        request.flag_outliers = !book.camera.is_unknown();
        if std::mem::take(&mut gs.reset_outliers) {
            gs.graph.reset_outliers();
            debug!("outlier flags cleared");
        }
        let result = self.invoker.run(&mut gs.graph, Some(&gs.imu), &gs.rigs.live, &request)?;
        trace!(
            num_active,
            use_imu,
            cost = result.summary.final_cost,
            last_frame_error = ?result.last_frame_error,
            "tracking bundle adjustment"
        );
        Some(result)
    }

    /// Estimates a candidate over the newest segment. Returns true when a
    /// calibration change was detected.
    fn analyse(&self, gs: &mut GraphState, book: &mut CalibrationBook, kind: SensorKind) -> Result<bool> {
        let pose_count = gs.graph.num_poses();
        let cal = book.sensor(kind);
        let segment_length = cal.segment_length;
        if cal.segment_since_rollback(pose_count) <= segment_length {
            return Ok(false);
        }
        let behaviour = self.behaviour(kind);
        let indices: Vec<usize> = (pose_count - segment_length..pose_count).collect();
        let imu = behaviour.uses_imu().then_some(&gs.imu);
        let snapshot = GraphSnapshot::collect(&gs.graph, imu, &gs.rigs.selfcal, &indices);
        let Some(estimate) = behaviour.estimate_window(&self.estimator, &snapshot, self.config.selfcal_iterations)
        else {
            debug!(sensor = %kind, pose_count, "no candidate window");
            return Ok(false);
        };
        self.consider_candidate(gs, book, kind, estimate.window)
    }

    /// Offers a candidate to the queue and feeds the change detector.
    /// Returns true when a calibration change was detected.
    pub fn consider_candidate(
        &self,
        gs: &mut GraphState,
        book: &mut CalibrationBook,
        kind: SensorKind,
        candidate: CalibrationWindow,
    ) -> Result<bool> {
        let pose_count = gs.graph.num_poses();
        let detect = self.sensor_config(kind).detect_changes;
        let cal = book.sensor_mut(kind);

        let offer = cal.queue.offer(&candidate);
        let divergence = if cal.pq_window.is_empty() {
            0.0
        } else {
            cal.detector.divergence(&cal.pq_window, &candidate)
        };
        cal.last_divergence = divergence;
        debug!(
            sensor = %kind,
            start = candidate.start,
            end = candidate.end,
            score = candidate.score,
            ?offer,
            divergence,
            "candidate window analysed"
        );
        self.metrics.record_event(CalibrationEvent::WindowAnalysed {
            sensor: kind,
            pose_count,
            window: candidate.clone(),
            divergence,
        });
        if !candidate.is_empty() {
            cal.current_window = candidate.clone();
        }
        cal.candidate_window = candidate;

        if !detect {
            return Ok(false);
        }
        let known = !cal.is_unknown();
        let full = cal.queue.is_full();
        if cal.detector.evaluate(divergence, full, known) != ChangeVerdict::ChangeDetected {
            return Ok(false);
        }
        self.handle_change(gs, book, kind)?;
        Ok(true)
    }

    fn handle_change(&self, gs: &mut GraphState, book: &mut CalibrationBook, kind: SensorKind) -> Result<()> {
        let pose_count = gs.graph.num_poses();
        let rollback = pose_count.saturating_sub(self.behaviour(kind).rollback_threshold());
        book.sensor_mut(kind).invalidate(rollback)?;
        warn!(sensor = %kind, pose_count, rollback, "calibration change detected, rolling back");
        self.metrics.record_event(CalibrationEvent::ChangeDetected {
            sensor: kind,
            rollback_pose: rollback,
        });
        self.enter_batch(gs, book, kind, rollback)
    }

    /// The queue changed and its aggregate is due.
    pub fn needs_aggregation(&self, book: &CalibrationBook, kind: SensorKind) -> bool {
        let cal = book.sensor(kind);
        self.is_active(book, kind) && !cal.is_unknown() && cal.queue.needs_update() && cal.queue.len() > 1
    }

    /// Copies what queue aggregation needs. Call under lock.
    pub fn collect_queue_work(&self, gs: &GraphState, book: &CalibrationBook, kind: SensorKind) -> Option<QueueWork> {
        let cal = book.sensor(kind);
        if cal.queue.is_empty() {
            return None;
        }
        let input = match self.sensor_config(kind).aggregation {
            AggregationMode::InformationFusion => QueueInput::Fuse(cal.queue.clone()),
            AggregationMode::JointSolve => {
                let poses = cal.queue.union_poses();
                let imu = self.behaviour(kind).uses_imu().then_some(&gs.imu);
                QueueInput::Joint(GraphSnapshot::collect(&gs.graph, imu, &gs.rigs.selfcal, &poses))
            }
        };
        Some(QueueWork {
            sensor: kind,
            generation: cal.queue.generation(),
            input,
        })
    }

    /// Computes the queue aggregate. Needs no lock.
    pub fn solve_queue_work(&self, work: &QueueWork) -> Option<CalibrationWindow> {
        let behaviour = self.behaviour(work.sensor);
        match &work.input {
            QueueInput::Fuse(queue) => queue.fuse(behaviour.weights()),
            QueueInput::Joint(snapshot) => behaviour
                .estimate_window(&self.estimator, snapshot, self.config.selfcal_iterations)
                .map(|estimate| estimate.window),
        }
    }

    /// Installs a queue aggregate. Call under lock.
    ///
    /// Results computed against a queue that has since changed, or for a
    /// sensor no longer online, are discarded. Returns true when the live
    /// rig changed.
    pub fn apply_queue_result(
        &self,
        gs: &mut GraphState,
        book: &mut CalibrationBook,
        kind: SensorKind,
        generation: u64,
        result: Option<CalibrationWindow>,
    ) -> bool {
        let cal = book.sensor_mut(kind);
        if cal.state() != CalibrationState::OnlineActive || cal.queue.generation() != generation {
            debug!(
                sensor = %kind,
                generation,
                current = cal.queue.generation(),
                state = ?cal.state(),
                "stale queue aggregate discarded"
            );
            return false;
        }
        cal.queue.mark_updated();
        let Some(window) = result else {
            debug!(sensor = %kind, "queue aggregation produced no estimate");
            return false;
        };
        cal.queue.set_distribution(window.clone());
        cal.pq_window = window.clone();
        let since = cal.rollback_pose;
        self.apply_window(gs, kind, since, &window)
    }

    fn aggregate_now(&self, gs: &mut GraphState, book: &mut CalibrationBook, kind: SensorKind) -> bool {
        let Some(work) = self.collect_queue_work(gs, book, kind) else {
            return false;
        };
        let result = self.solve_queue_work(&work);
        self.apply_queue_result(gs, book, kind, work.generation, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, Rig};
    use crate::geometry::SE3;
    use crate::graph::Pose;
    use crate::imu::ImuBias;
    use crate::metrics::Metrics;
    use crate::optimizer::DenseSolver;
    use crate::simulation::{Scenario, SimulationConfig};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector, Vector3};

    fn rig() -> Rig {
        Rig::new(
            CameraIntrinsics::pinhole(640, 480, 400.0, 400.0, 320.0, 240.0),
            SE3::identity(),
        )
    }

    fn scheduler(config: SelfCalConfig) -> (CalibrationScheduler, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let scheduler = CalibrationScheduler::new(config, Arc::new(DenseSolver), metrics.clone());
        (scheduler, metrics)
    }

    fn graph_state(poses: usize) -> GraphState {
        let mut gs = GraphState::new(rig());
        for i in 0..poses {
            gs.graph
                .push_pose(Pose::new(
                    SE3::identity(),
                    Vector3::zeros(),
                    ImuBias::zero(),
                    gs.rigs.live.intrinsics.params.clone(),
                    i as f64,
                ))
                .unwrap();
        }
        gs
    }

    fn window(start: usize, end: usize, mean: &[f64]) -> CalibrationWindow {
        let n = mean.len();
        CalibrationWindow::new(start, end, DVector::from_column_slice(mean), DMatrix::identity(n, n), &[])
    }

    #[test]
    fn test_consecutive_weak_divergence_triggers_rollback() {
        let (scheduler, metrics) = scheduler(SelfCalConfig::default());
        let mut gs = graph_state(40);
        let mut book = CalibrationBook::new(scheduler.config());
        {
            let cam = book.sensor_mut(SensorKind::Camera);
            for k in 0..5 {
                assert!(cam.queue.offer(&window(5 * k, 5 * k + 5, &[0.0, 0.0])).accepted());
            }
            assert!(cam.queue.is_full());
            cam.pq_window = window(0, 10, &[0.0, 0.0]);
        }

        let candidate = window(30, 40, &[3.34, 0.0]);
        let divergence = book
            .sensor(SensorKind::Camera)
            .detector
            .divergence(&book.sensor(SensorKind::Camera).pq_window, &candidate);
        assert!(divergence > 0.0 && divergence < 0.2, "divergence {divergence}");

        for expected in 1..=3 {
            assert!(!scheduler
                .consider_candidate(&mut gs, &mut book, SensorKind::Camera, candidate.clone())
                .unwrap());
            assert_eq!(book.sensor(SensorKind::Camera).detector.counter(), expected);
        }
        assert!(scheduler
            .consider_candidate(&mut gs, &mut book, SensorKind::Camera, candidate)
            .unwrap());

        let cam = book.sensor(SensorKind::Camera);
        assert!(cam.is_unknown());
        assert_eq!(cam.state(), CalibrationState::BatchConverging);
        assert!(cam.queue.is_empty());
        assert_eq!(cam.rollback_pose, 37);
        // Seeded with the wide field-of-view guess.
        assert_relative_eq!(gs.rigs.live.intrinsics.params[0], 240.0, epsilon = 1e-9);
        assert_relative_eq!(gs.graph.pose(36).unwrap().cam_params[0], 400.0);
        assert_relative_eq!(gs.graph.pose(37).unwrap().cam_params[0], 240.0, epsilon = 1e-9);
        assert_eq!(metrics.snapshot().changes_detected, 1);
        assert_eq!(metrics.snapshot().windows_analysed, 4);
    }

    #[test]
    fn test_detection_disabled_for_imu_by_default() {
        let (scheduler, _) = scheduler(SelfCalConfig::default());
        let mut gs = graph_state(40);
        let mut book = CalibrationBook::new(scheduler.config());
        book.sensor_mut(SensorKind::Imu).pq_window = window(0, 10, &[0.0; 6]);
        let candidate = window(30, 40, &[3.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        for _ in 0..6 {
            assert!(!scheduler
                .consider_candidate(&mut gs, &mut book, SensorKind::Imu, candidate.clone())
                .unwrap());
        }
        assert_eq!(book.sensor(SensorKind::Imu).state(), CalibrationState::OnlineActive);
        assert_eq!(book.sensor(SensorKind::Imu).current_window, candidate);
    }

    #[test]
    fn test_rank_deficient_window_never_reaches_live_rig() {
        let (scheduler, _) = scheduler(SelfCalConfig::default());
        let mut gs = graph_state(20);
        let mut book = CalibrationBook::new(scheduler.config());
        let before = gs.rigs.live.clone();

        let covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![1e-6, 1e-6, 1e-6, 0.0]));
        let deficient = CalibrationWindow::new(
            0,
            20,
            DVector::from_vec(vec![500.0, 500.0, 300.0, 200.0]),
            covariance,
            &[],
        );
        assert_eq!(deficient.rank(), 3);
        assert!(!scheduler.apply_window(&mut gs, SensorKind::Camera, 0, &deficient));

        let generation = book.sensor(SensorKind::Camera).queue.generation();
        assert!(!scheduler.apply_queue_result(&mut gs, &mut book, SensorKind::Camera, generation, Some(deficient)));
        assert_eq!(gs.rigs.live, before);
        assert_eq!(gs.rigs.selfcal, before);
    }

    #[test]
    fn test_stale_queue_result_discarded() {
        let (scheduler, _) = scheduler(SelfCalConfig::default());
        let mut gs = graph_state(20);
        let mut book = CalibrationBook::new(scheduler.config());
        let cam = book.sensor_mut(SensorKind::Camera);
        cam.queue.offer(&window(0, 10, &[410.0, 405.0, 321.0, 239.0]));
        cam.queue.offer(&window(10, 20, &[410.0, 405.0, 321.0, 239.0]));
        let work = scheduler.collect_queue_work(&gs, &book, SensorKind::Camera).unwrap();
        let fused = scheduler.solve_queue_work(&work).unwrap();
        assert_relative_eq!(fused.mean[0], 410.0, epsilon = 1e-9);

        // Membership changes while the aggregate is being computed.
        let moved = CalibrationWindow {
            score: 100.0,
            ..window(20, 30, &[410.0, 405.0, 321.0, 239.0])
        };
        book.sensor_mut(SensorKind::Camera).queue.offer(&moved);
        assert_ne!(book.sensor(SensorKind::Camera).queue.generation(), work.generation);
        assert!(!scheduler.apply_queue_result(&mut gs, &mut book, SensorKind::Camera, work.generation, Some(fused.clone())));
        assert_relative_eq!(gs.rigs.live.intrinsics.params[0], 400.0);

        let work = scheduler.collect_queue_work(&gs, &book, SensorKind::Camera).unwrap();
        assert!(scheduler.apply_queue_result(&mut gs, &mut book, SensorKind::Camera, work.generation, Some(fused)));
        assert_relative_eq!(gs.rigs.live.intrinsics.params[0], 410.0, epsilon = 1e-9);
        assert_relative_eq!(gs.graph.pose(5).unwrap().cam_params[0], 410.0, epsilon = 1e-9);
        assert!(!book.sensor(SensorKind::Camera).queue.needs_update());
        assert!(book.sensor(SensorKind::Camera).queue.distribution().is_some());
    }

    #[test]
    fn test_extrinsic_waits_for_known_intrinsics() {
        let (scheduler, _) = scheduler(SelfCalConfig::default());
        let mut gs = graph_state(0);
        let mut book = CalibrationBook::new(scheduler.config());
        scheduler.start(&mut gs, &mut book).unwrap();
        assert_eq!(book.sensor(SensorKind::Camera).state(), CalibrationState::BatchConverging);
        assert!(scheduler.is_active(&book, SensorKind::Camera));
        assert!(!scheduler.is_active(&book, SensorKind::Imu));

        book.sensor_mut(SensorKind::Camera).finish_batch().unwrap();
        assert!(scheduler.is_active(&book, SensorKind::Imu));
        assert!(scheduler.imu_usable(&book, 100, 15));
        assert!(!scheduler.imu_usable(&book, 15, 15));
    }

    #[test]
    fn test_tracking_ba_held_while_intrinsics_converge() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(6);
        let mut config = SelfCalConfig::default();
        config.has_imu = false;
        let (scheduler, metrics) = scheduler(config);
        let mut gs = GraphState::new(sim.true_rig());
        let mut book = CalibrationBook::new(scheduler.config());
        scheduler.start(&mut gs, &mut book).unwrap();
        gs.graph = graph;
        gs.imu = imu;
        let before: Vec<SE3> = gs.graph.poses().iter().map(|p| p.t_wp).collect();

        let outcome = scheduler.after_keyframe(&mut gs, &mut book).unwrap();
        assert!(outcome.bundle_adjustment.is_none());
        assert_eq!(metrics.snapshot().bundle_adjustment.calls, 1);
        for (pose, t_wp) in gs.graph.poses().iter().zip(&before) {
            assert_eq!(&pose.t_wp, t_wp);
        }

        book.sensor_mut(SensorKind::Camera).finish_batch().unwrap();
        let outcome = scheduler.after_keyframe(&mut gs, &mut book).unwrap();
        assert!(outcome.bundle_adjustment.is_some());
    }

    #[test]
    fn test_applied_window_is_reproduced() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(12);
        let (scheduler, _) = scheduler(SelfCalConfig::default());
        let mut gs = GraphState::new(sim.true_rig());
        gs.graph = graph;
        gs.imu = imu;

        let indices: Vec<usize> = (0..12).collect();
        let camera = scheduler.behaviour(SensorKind::Camera);
        let first = camera
            .estimate_window(
                &scheduler.estimator,
                &GraphSnapshot::collect(&gs.graph, None, &gs.rigs.selfcal, &indices),
                30,
            )
            .unwrap()
            .window;
        assert!(scheduler.apply_window(&mut gs, SensorKind::Camera, 0, &first));
        assert_eq!(gs.rigs.live.intrinsics.params, first.mean);

        let second = camera
            .estimate_window(
                &scheduler.estimator,
                &GraphSnapshot::collect(&gs.graph, None, &gs.rigs.selfcal, &indices),
                30,
            )
            .unwrap()
            .window;
        for i in 0..first.dim() {
            assert_relative_eq!(second.mean[i], first.mean[i], epsilon = 0.05);
        }
    }
}

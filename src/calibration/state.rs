//! Per-sensor calibration lifecycle.
//!
//! ```text
//!  Unknown ──seed──▶ BatchConverging ──converged──▶ OnlineActive
//!     ▲                                                  │
//!     └──────────────────── change detected ─────────────┘
//! ```

use anyhow::{bail, Result};
use tracing::info;

use super::change_detector::ChangeDetector;
use super::priority_queue::WindowPriorityQueue;
use super::sensor::SensorKind;
use super::window::CalibrationWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationState {
    Unknown,
    BatchConverging,
    OnlineActive,
}

impl CalibrationState {
    fn can_transition_to(self, next: CalibrationState) -> bool {
        matches!(
            (self, next),
            (CalibrationState::Unknown, CalibrationState::BatchConverging)
                | (CalibrationState::BatchConverging, CalibrationState::OnlineActive)
                | (CalibrationState::OnlineActive, CalibrationState::Unknown)
        )
    }
}

/// Camera-to-IMU initialization stages run inside `BatchConverging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtrinsicInitStage {
    /// Accumulating IMU vs. vision rotation constraints.
    Rotation,
    /// Rotation solved; translation still to be seeded.
    Translation,
    /// Initial guess in place, joint batch refinement enabled.
    Refinement,
}

/// Everything the scheduler tracks for one sensor.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub kind: SensorKind,
    state: CalibrationState,
    pub enabled: bool,
    /// First pose whose calibration is unknown.
    pub rollback_pose: usize,
    pub segment_length: usize,
    pub detector: ChangeDetector,
    pub queue: WindowPriorityQueue,
    /// Aggregate of the queue.
    pub pq_window: CalibrationWindow,
    pub candidate_window: CalibrationWindow,
    pub current_window: CalibrationWindow,
    pub last_divergence: f64,
    pub init_stage: Option<ExtrinsicInitStage>,
}

impl Calibration {
    pub fn new(
        kind: SensorKind,
        enabled: bool,
        segment_length: usize,
        detector: ChangeDetector,
        queue: WindowPriorityQueue,
    ) -> Self {
        Self {
            kind,
            state: CalibrationState::OnlineActive,
            enabled,
            rollback_pose: 0,
            segment_length,
            detector,
            queue,
            pq_window: CalibrationWindow::empty(),
            candidate_window: CalibrationWindow::empty(),
            current_window: CalibrationWindow::empty(),
            last_divergence: 0.0,
            init_stage: None,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// The calibration cannot be trusted yet (`Unknown` or still converging).
    pub fn is_unknown(&self) -> bool {
        self.state != CalibrationState::OnlineActive
    }

    pub fn transition(&mut self, next: CalibrationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            bail!(
                "illegal {:?} calibration transition {:?} -> {:?}",
                self.kind,
                self.state,
                next
            );
        }
        info!(sensor = ?self.kind, from = ?self.state, to = ?next, "calibration state changed");
        self.state = next;
        Ok(())
    }

    /// Enters `Unknown` from `OnlineActive`, forgetting everything learned
    /// since `rollback_pose`.
    pub fn invalidate(&mut self, rollback_pose: usize) -> Result<()> {
        self.transition(CalibrationState::Unknown)?;
        self.rollback_pose = rollback_pose;
        self.queue.clear();
        self.detector.reset();
        self.pq_window = CalibrationWindow::empty();
        self.candidate_window = CalibrationWindow::empty();
        self.last_divergence = 0.0;
        Ok(())
    }

    /// Starts the batch phase from `Unknown`. For the extrinsic this also
    /// restarts the staged initialization.
    pub fn begin_batch(&mut self) -> Result<()> {
        self.transition(CalibrationState::BatchConverging)?;
        if self.kind == SensorKind::Imu {
            self.init_stage = Some(ExtrinsicInitStage::Rotation);
        }
        Ok(())
    }

    pub fn finish_batch(&mut self) -> Result<()> {
        self.transition(CalibrationState::OnlineActive)?;
        self.init_stage = None;
        Ok(())
    }

    /// Forces `Unknown` at construction, when the calibration is known to be
    /// unreliable from the first pose.
    pub fn start_unknown(&mut self) {
        self.state = CalibrationState::Unknown;
        self.rollback_pose = 0;
    }

    /// Poses accumulated since the rollback pose.
    pub fn segment_since_rollback(&self, pose_count: usize) -> usize {
        pose_count.saturating_sub(self.rollback_pose)
    }
}

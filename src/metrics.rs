//! Timing and calibration event counters.
//!
//! Components report through the `MetricsSink` they are handed; nothing
//! here is global. `Metrics` keeps lock-free counters plus a short history
//! of calibration events for diagnostics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::calibration::{CalibrationWindow, SensorKind};

const EVENT_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Batch,
    BundleAdjustment,
    Analyze,
    Queue,
    Conditioning,
}

impl Phase {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    /// Diagnostic record of one analysed window.
    WindowAnalysed {
        sensor: SensorKind,
        pose_count: usize,
        window: CalibrationWindow,
        divergence: f64,
    },
    BatchConverged {
        sensor: SensorKind,
        pose_count: usize,
        uncertainty: f64,
    },
    ChangeDetected {
        sensor: SensorKind,
        rollback_pose: usize,
    },
    RigUpdated {
        sensor: SensorKind,
        start: usize,
        end: usize,
    },
}

pub trait MetricsSink: Send + Sync {
    fn record_timing(&self, phase: Phase, elapsed: Duration);
    fn record_event(&self, event: CalibrationEvent);
}

/// Times a closure against `phase`.
pub fn timed<T>(sink: &dyn MetricsSink, phase: Phase, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let out = f();
    sink.record_timing(phase, start.elapsed());
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseStats {
    pub calls: u64,
    pub total: Duration,
}

impl PhaseStats {
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls as u32
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub batch: PhaseStats,
    pub bundle_adjustment: PhaseStats,
    pub analyze: PhaseStats,
    pub queue: PhaseStats,
    pub conditioning: PhaseStats,
    pub windows_analysed: u64,
    pub changes_detected: u64,
    pub batches_converged: u64,
    pub rig_updates: u64,
}

impl MetricsSnapshot {
    pub fn phase(&self, phase: Phase) -> &PhaseStats {
        match phase {
            Phase::Batch => &self.batch,
            Phase::BundleAdjustment => &self.bundle_adjustment,
            Phase::Analyze => &self.analyze,
            Phase::Queue => &self.queue,
            Phase::Conditioning => &self.conditioning,
        }
    }
}

#[derive(Debug, Default)]
struct PhaseCounter {
    calls: AtomicU64,
    nanos: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    phases: [PhaseCounter; 5],
    windows_analysed: AtomicU64,
    changes_detected: AtomicU64,
    batches_converged: AtomicU64,
    rig_updates: AtomicU64,
    events: Mutex<VecDeque<CalibrationEvent>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let phase = |p: Phase| {
            let c = &self.phases[p.index()];
            PhaseStats {
                calls: c.calls.load(Ordering::Relaxed),
                total: Duration::from_nanos(c.nanos.load(Ordering::Relaxed)),
            }
        };
        MetricsSnapshot {
            batch: phase(Phase::Batch),
            bundle_adjustment: phase(Phase::BundleAdjustment),
            analyze: phase(Phase::Analyze),
            queue: phase(Phase::Queue),
            conditioning: phase(Phase::Conditioning),
            windows_analysed: self.windows_analysed.load(Ordering::Relaxed),
            changes_detected: self.changes_detected.load(Ordering::Relaxed),
            batches_converged: self.batches_converged.load(Ordering::Relaxed),
            rig_updates: self.rig_updates.load(Ordering::Relaxed),
        }
    }

    /// Most recent events, oldest first.
    pub fn recent_events(&self) -> Vec<CalibrationEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

impl MetricsSink for Metrics {
    fn record_timing(&self, phase: Phase, elapsed: Duration) {
        let c = &self.phases[phase.index()];
        c.calls.fetch_add(1, Ordering::Relaxed);
        c.nanos
            .fetch_add(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn record_event(&self, event: CalibrationEvent) {
        let counter = match &event {
            CalibrationEvent::WindowAnalysed { .. } => &self.windows_analysed,
            CalibrationEvent::BatchConverged { .. } => &self.batches_converged,
            CalibrationEvent::ChangeDetected { .. } => &self.changes_detected,
            CalibrationEvent::RigUpdated { .. } => &self.rig_updates,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let mut events = self.events.lock();
        if events.len() == EVENT_HISTORY {
            events.pop_front();
        }
        events.push_back(event);
    }
}

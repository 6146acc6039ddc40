//! Core ID types for the pose graph.

/// Stable handle of a track (landmark) in the graph's track arena.
///
/// Poses are addressed by their position in the append-only pose sequence
/// (`usize`); tracks get their own newtype because they are referenced from
/// poses, from optimizer snapshots and from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub usize);

impl TrackId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// The optimizer instances that keep per-entity handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaInstance {
    /// Main-thread tracking BA.
    Tracking = 0,
    /// Adaptive conditioning BA.
    Conditioning = 1,
    /// Calibration window estimation.
    SelfCal = 2,
}

impl BaInstance {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Per-instance optimizer handles (parameter block ids from the last
/// problem built by that instance).
pub type BaHandles = [Option<usize>; BaInstance::COUNT];

//! Engine statistics snapshot, refreshed on demand.

use serde::{Deserialize, Serialize};

/// Point-in-time view of a session's engine and disk state.
///
/// `loaded_state` is present iff an engine handle is live; `compute` is
/// present iff a run is in flight. `bytes_on_disk` is always present and is
/// the number the session layer compares against the quota.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsRecord {
    pub bytes_on_disk: u64,
    pub loaded_state: Option<LoadedStateStats>,
    pub compute: Option<ComputeStats>,
}

/// State the engine currently holds in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedStateStats {
    pub frames: usize,
    pub elements: usize,
}

/// Timing of the run in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeStats {
    /// Rough remaining wall time, extrapolated from the last frame.
    pub remaining_time_sec: f64,
    pub last_frame_time_sec: f64,
    pub last_frame_substeps: u32,
}

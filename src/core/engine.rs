//! The compute-engine boundary.
//!
//! The engine is opaque: an in-process library, a subprocess or a remote
//! service all satisfy this contract equally. The session layer only ever
//! talks through this capability set and observes progress by polling;
//! nothing here blocks.

use std::path::Path;

use uuid::Uuid;

use crate::entities::{AttributeDescriptor, ProgressTree, SetupDescriptor, StatsRecord};
use crate::error::Result;

/// Parameters of one compute run.
///
/// Frames `[next_frame, frame_count)` are computed, resuming from the cached
/// state at `next_frame - 1` (or from the initial state when
/// `next_frame == 0`). `quota_bytes` is passed on every start because the
/// session's quota can be edited between runs; the value captured here is
/// the one this run honors.
#[derive(Debug, Clone)]
pub struct ComputeRequest {
    /// Frame duration in seconds of simulated time.
    pub time_step: f64,
    /// Force single-substep explicit integration.
    pub explicit_mode: bool,
    /// Per-frame diagnostic logging.
    pub debug_mode: bool,
    /// Let the engine subdivide frames into adaptive substeps.
    pub adaptive_time_steps: bool,
    /// First frame to compute; must be `<= available_frames()`. Anything
    /// cached at or after it is discarded first (branch/rebake).
    pub next_frame: usize,
    /// Exclusive end of the run: total frame count to reach.
    pub frame_count: usize,
    /// Disk quota for this run, bytes.
    pub quota_bytes: u64,
}

impl ComputeRequest {
    /// A forward bake of `frame_count` frames at 24 fps.
    pub fn forward(frame_count: usize) -> Self {
        Self {
            time_step: 1.0 / 24.0,
            explicit_mode: false,
            debug_mode: false,
            adaptive_time_steps: false,
            next_frame: 0,
            frame_count,
            quota_bytes: u64::MAX,
        }
    }
}

/// Capability set of a live engine handle.
///
/// One handle per session, created through an [`EngineFactory`]. All calls
/// are non-blocking; async outcomes (new frames, run completion, failures)
/// become visible only through `poll`.
pub trait ComputeEngine: Send {
    /// One advancement tick: drain whatever the engine produced since the
    /// last call. No-op while nothing is running. A returned error is the
    /// engine reporting an asynchronous failure of the current run.
    fn poll(&mut self) -> Result<()>;

    /// True while a compute run is in flight (as of the last `poll`).
    fn computing(&self) -> bool;

    /// Begin computing frames. Fails fast with `AlreadyComputing` while a
    /// run is in flight, or `QuotaExceeded` if the projected disk usage of
    /// the first frame already exceeds `quota_bytes`.
    fn start_compute(&mut self, request: &ComputeRequest) -> Result<()>;

    /// Cooperative cancellation: no new frame starts once the engine
    /// observes the request, but the in-flight frame may still complete.
    fn pause_compute(&mut self);

    /// Contiguous cached frame count.
    fn available_frames(&self) -> usize;

    /// Schema of every attribute cached for `frame`.
    fn available_attributes(&self, frame: usize) -> Result<Vec<AttributeDescriptor>>;

    /// Flat buffer for one attribute of one cached frame.
    fn fetch_flat_attribute(&self, frame: usize, attr: &AttributeDescriptor) -> Result<Vec<f32>>;

    /// Disk and timing statistics snapshot.
    fn stats(&self) -> StatsRecord;

    /// Latest progress tree, if a run has produced one.
    fn progress(&self) -> Option<ProgressTree>;

    /// Release the handle: stop accepting work, let the current frame
    /// settle, drop the cache lock. Must be idempotent and must not fail;
    /// problems are logged by the implementation.
    fn dispose(&mut self);
}

/// Constructor seam for engine handles, so the registry can be built over
/// any conforming engine (including test doubles).
pub trait EngineFactory: Send + Sync {
    /// Initialize a fresh cache generation at `cache_dir` and return a live
    /// handle holding its lock.
    fn create(
        &self,
        id: Uuid,
        cache_dir: &Path,
        setup: &SetupDescriptor,
        quota_bytes: u64,
    ) -> Result<Box<dyn ComputeEngine>>;

    /// Attach to an existing cache generation at `cache_dir`.
    fn load(&self, id: Uuid, cache_dir: &Path, quota_bytes: u64) -> Result<Box<dyn ComputeEngine>>;
}

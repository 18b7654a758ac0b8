//! One simulation session: a cache directory coupled to a live engine
//! handle, with the bookkeeping the rest of the system relies on.
//!
//! The session is the only place a live engine handle may live, and the
//! boundary where recoverable engine errors are latched into `last_error`
//! for the UI (stored, surfaced once, cleared when the user acknowledges).
//! Lifecycle misuse (driving compute on a disposed session) is a
//! programmer error and panics; "the engine said no" never does.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::engine::{ComputeEngine, ComputeRequest, EngineFactory};
use crate::core::frame_cache::FrameCache;
use crate::entities::{AttributeDescriptor, ProgressTree, SetupDescriptor, StatsRecord};
use crate::error::{EngineError, Result};

/// One registry entry: session identity, cache coordinates, engine handle.
///
/// The handle is present iff the session is loaded; after `dispose` the
/// read-only queries keep working off the cache directory, so observable
/// disk state never changes just because the handle went away.
pub struct SimulationSession {
    id: Uuid,
    cache_dir: PathBuf,
    quota_bytes: u64,
    engine: Option<Box<dyn ComputeEngine>>,
    disposed: bool,
    /// Host timeline position at which this session's frame 0 is displayed.
    pub display_start: i64,
    /// Frame count the current/last bake aims for; drives the sync clamp.
    target_frame_count: usize,
    /// Whether the poller drives this session every tick.
    continuous_sync: bool,
    last_error: Option<String>,
    last_progress: Option<ProgressTree>,
}

impl SimulationSession {
    /// Initialize a fresh cache generation for `id` and hold its handle.
    pub fn create(
        factory: &dyn EngineFactory,
        id: Uuid,
        cache_dir: impl Into<PathBuf>,
        setup: &SetupDescriptor,
        quota_bytes: u64,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let engine = factory.create(id, &cache_dir, setup, quota_bytes)?;
        info!("Session {id}: created at {}", cache_dir.display());
        Ok(Self::assemble(id, cache_dir, quota_bytes, engine))
    }

    /// Attach to an existing cache generation for `id`.
    pub fn load(
        factory: &dyn EngineFactory,
        id: Uuid,
        cache_dir: impl Into<PathBuf>,
        quota_bytes: u64,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let engine = factory.load(id, &cache_dir, quota_bytes)?;
        info!("Session {id}: loaded from {}", cache_dir.display());
        Ok(Self::assemble(id, cache_dir, quota_bytes, engine))
    }

    fn assemble(
        id: Uuid,
        cache_dir: PathBuf,
        quota_bytes: u64,
        engine: Box<dyn ComputeEngine>,
    ) -> Self {
        let target_frame_count = engine.available_frames();
        Self {
            id,
            cache_dir,
            quota_bytes,
            engine: Some(engine),
            disposed: false,
            display_start: 0,
            target_frame_count,
            continuous_sync: true,
            last_error: None,
            last_progress: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// Edit the quota. Takes effect on the next `start_compute`; a run
    /// already in flight keeps the quota it was started with.
    pub fn set_quota_bytes(&mut self, quota_bytes: u64) {
        self.quota_bytes = quota_bytes;
    }

    pub fn target_frame_count(&self) -> usize {
        self.target_frame_count
    }

    pub fn continuous_sync(&self) -> bool {
        self.continuous_sync
    }

    pub fn set_continuous_sync(&mut self, enabled: bool) {
        self.continuous_sync = enabled;
    }

    /// Release the engine handle and its cache lock. Idempotent; underlying
    /// release problems are logged by the engine, never propagated, because
    /// dispose runs during teardown and must not fail.
    pub fn dispose(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.dispose();
            debug!("Session {}: disposed", self.id);
        }
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// One non-blocking advancement tick. Callable at any time; a no-op
    /// while nothing is running. Engine-side failures are absorbed into
    /// `last_error`, they never propagate out of the tick path.
    pub fn poll(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.poll() {
                warn!("Session {}: engine reported: {e}", self.id);
                self.last_error = Some(e.to_string());
            }
            self.last_progress = self.engine.as_ref().and_then(|e| e.progress());
        }
    }

    /// Request a compute run. The session's configured quota is stamped
    /// onto the request; whatever the caller put there is ignored.
    ///
    /// Branch/rebake: when `next_frame` is below `available_frames()`, all
    /// cached frames at or after it are discarded before computing.
    /// Fails fast with `AlreadyComputing` while a run is in flight.
    ///
    /// # Panics
    /// Panics if the session has been disposed.
    pub fn start_compute(&mut self, request: &ComputeRequest) -> Result<()> {
        let quota = self.quota_bytes;
        let mut request = request.clone();
        request.quota_bytes = quota;
        let result = self.engine_mut("start_compute").start_compute(&request);
        match &result {
            Ok(()) => {
                self.target_frame_count = request.frame_count.max(request.next_frame);
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
            }
        }
        result
    }

    /// Cooperative cancellation of the in-flight run; the current frame may
    /// still complete. No forced termination exists.
    ///
    /// # Panics
    /// Panics if the session has been disposed.
    pub fn pause_compute(&mut self) {
        self.engine_mut("pause_compute").pause_compute();
    }

    pub fn computing(&self) -> bool {
        self.engine.as_ref().is_some_and(|e| e.computing())
    }

    /// Contiguous cached frame count. Falls back to scanning the cache
    /// directory when no handle is live, so dispose leaves this unchanged.
    pub fn available_frames(&self) -> usize {
        match &self.engine {
            Some(engine) => engine.available_frames(),
            None => self.disk_cache().available_frames(),
        }
    }

    pub fn stats(&self) -> StatsRecord {
        match &self.engine {
            Some(engine) => engine.stats(),
            None => StatsRecord {
                bytes_on_disk: self.disk_cache().bytes_on_disk(),
                loaded_state: None,
                compute: None,
            },
        }
    }

    /// Schema of the attributes cached for `frame`.
    pub fn available_attributes(&mut self, frame: usize) -> Result<Vec<AttributeDescriptor>> {
        let result = match &self.engine {
            Some(engine) => engine.available_attributes(frame),
            None => self.disk_cache().read_frame(frame).map(|r| r.schema()),
        };
        self.record(result)
    }

    /// Flat buffer for one attribute of one cached frame. No state is
    /// mutated on failure; a query beyond the cached range just reports
    /// `NoFrameAvailable`.
    pub fn fetch_flat_attribute(
        &mut self,
        frame: usize,
        attr: &AttributeDescriptor,
    ) -> Result<Vec<f32>> {
        let result = match &self.engine {
            Some(engine) => engine.fetch_flat_attribute(frame, attr),
            None => self.disk_cache().read_frame(frame).and_then(|record| {
                record
                    .flat_attribute(attr)
                    .map(<[f32]>::to_vec)
                    .ok_or_else(|| {
                        EngineError::Corrupt(format!(
                            "attribute '{attr}' not present in frame {frame}"
                        ))
                    })
            }),
        };
        self.record(result)
    }

    /// Last engine-side error, if the user has not acknowledged it yet.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The user acknowledged the message; stop showing it.
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Record an error message without losing the result. Used by the sync
    /// layer as well, which detects desyncs outside this module.
    pub(crate) fn note_error(&mut self, message: String) {
        self.last_error = Some(message);
    }

    pub fn last_progress(&self) -> Option<&ProgressTree> {
        self.last_progress.as_ref()
    }

    /// Opt-in scripting helper: poll until the run finishes or `timeout`
    /// passes. Returns `true` when idle. Not part of normal operation;
    /// interactive hosts observe state via the poller instead.
    pub fn wait_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if !self.computing() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn engine_mut(&mut self, op: &str) -> &mut Box<dyn ComputeEngine> {
        match self.engine.as_mut() {
            Some(engine) => engine,
            // Contract violation by the caller, not an engine condition.
            None => panic!("{op} called on disposed session {}", self.id),
        }
    }

    fn disk_cache(&self) -> FrameCache {
        FrameCache::new(&self.cache_dir, self.quota_bytes)
    }
}

impl Drop for SimulationSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

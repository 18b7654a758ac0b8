//! In-process reference engine.
//!
//! Conforms to the [`ComputeEngine`](crate::core::engine::ComputeEngine)
//! contract with one worker thread per compute run: the worker advances the
//! simulated state, writes each finished frame through [`FrameCache`] and
//! streams results over a channel that `poll()` drains without blocking.
//! Cancellation is a cooperative flag checked between frames, so pausing
//! never discards the frame in flight.
//!
//! The integrator itself is a deterministic toy (damped drift per substep).
//! It exists so the crate is runnable and testable end-to-end; the numerics
//! are explicitly not part of the engine contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::engine::{ComputeEngine, ComputeRequest, EngineFactory};
use crate::core::frame_cache::FrameCache;
use crate::entities::{
    AttributeBuffer, AttributeDescriptor, AttributeDomain, ComputeStats, FrameRecord,
    LoadedStateStats, ProgressTree, SetupDescriptor, StatsRecord,
};
use crate::error::{EngineError, Result};

/// Substeps for plain implicit stepping (explicit mode forces 1).
const DEFAULT_SUBSTEPS: u32 = 4;
/// Adaptive stepping target: one substep per this many seconds of sim time.
const ADAPTIVE_SUBSTEP_DT: f64 = 0.004;
const MAX_SUBSTEPS: u32 = 8;

/// Messages streamed from the worker thread to `poll()`.
enum WorkerMsg {
    Frame {
        index: usize,
        elapsed_sec: f64,
        substeps: u32,
    },
    Finished,
    Failed(EngineError),
}

struct ActiveRun {
    rx: Receiver<WorkerMsg>,
    pause: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
    target: usize,
}

/// Engine handle backed by a worker thread in this process.
///
/// Holds the cache lock from construction until `dispose`.
pub struct LocalEngine {
    id: Uuid,
    cache: FrameCache,
    setup: SetupDescriptor,
    available: usize,
    run: Option<ActiveRun>,
    progress: Arc<Mutex<Option<ProgressTree>>>,
    last_frame_time_sec: f64,
    last_frame_substeps: u32,
    lock_held: bool,
}

impl LocalEngine {
    /// Initialize a fresh cache generation and claim its lock.
    pub fn create(
        id: Uuid,
        cache: FrameCache,
        setup: &SetupDescriptor,
    ) -> Result<Self> {
        cache.acquire_lock()?;
        if let Err(e) = cache.init_fresh(setup) {
            cache.release_lock();
            return Err(e);
        }
        info!("Engine {id}: created fresh cache at {}", cache.dir().display());
        Ok(Self {
            id,
            cache,
            setup: setup.clone(),
            available: 0,
            run: None,
            progress: Arc::new(Mutex::new(None)),
            last_frame_time_sec: 0.0,
            last_frame_substeps: 0,
            lock_held: true,
        })
    }

    /// Attach to an existing cache generation and claim its lock.
    pub fn load(id: Uuid, cache: FrameCache) -> Result<Self> {
        if !FrameCache::exists(cache.dir()) {
            return Err(EngineError::Load(format!(
                "no setup descriptor at {}",
                cache.dir().display()
            )));
        }
        cache.acquire_lock()?;
        let setup = match cache.read_setup() {
            Ok(s) => s,
            Err(e) => {
                cache.release_lock();
                return Err(e);
            }
        };
        let available = cache.available_frames();
        info!(
            "Engine {id}: attached to cache at {} ({available} frame(s))",
            cache.dir().display()
        );
        Ok(Self {
            id,
            cache,
            setup,
            available,
            run: None,
            progress: Arc::new(Mutex::new(None)),
            last_frame_time_sec: 0.0,
            last_frame_substeps: 0,
            lock_held: true,
        })
    }

    /// Projected size of the next frame record, from the last one written
    /// or a schema-derived estimate for the very first frame.
    fn estimate_frame_bytes(&self) -> u64 {
        frame_bytes_estimate(&self.cache, &self.setup)
    }
}

fn frame_bytes_estimate(cache: &FrameCache, setup: &SetupDescriptor) -> u64 {
    cache.last_frame_bytes().unwrap_or_else(|| {
        let floats: usize = setup
            .attributes
            .iter()
            .map(|a| domain_elements(a.domain, setup.elements) * a.components as usize)
            .sum();
        // ~16 bytes per serialized float plus record framing
        (floats * 16 + 256) as u64
    })
}

fn domain_elements(domain: AttributeDomain, elements: usize) -> usize {
    match domain {
        AttributeDomain::Point | AttributeDomain::Voxel => elements,
        AttributeDomain::Global => 1,
    }
}

/// Join a finished worker thread; a panic in the worker must not look like
/// a clean shutdown.
fn join_worker(id: Uuid, handle: thread::JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("Engine {id}: compute worker panicked");
    }
}

fn substeps_for(request: &ComputeRequest) -> u32 {
    if request.explicit_mode {
        1
    } else if request.adaptive_time_steps {
        ((request.time_step / ADAPTIVE_SUBSTEP_DT).ceil() as u32).clamp(1, MAX_SUBSTEPS)
    } else {
        DEFAULT_SUBSTEPS
    }
}

impl ComputeEngine for LocalEngine {
    fn poll(&mut self) -> Result<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };

        let mut outcome = Ok(());
        let mut ended = false;
        loop {
            match run.rx.try_recv() {
                Ok(WorkerMsg::Frame {
                    index,
                    elapsed_sec,
                    substeps,
                }) => {
                    self.available = index + 1;
                    self.last_frame_time_sec = elapsed_sec;
                    self.last_frame_substeps = substeps;
                }
                Ok(WorkerMsg::Finished) => {
                    ended = true;
                }
                Ok(WorkerMsg::Failed(e)) => {
                    ended = true;
                    outcome = Err(e);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    ended = true;
                    break;
                }
            }
        }

        if ended {
            if let Some(run) = self.run.take() {
                join_worker(self.id, run.handle);
            }
            debug!(
                "Engine {}: run ended with {} frame(s) cached",
                self.id, self.available
            );
        }
        outcome
    }

    fn computing(&self) -> bool {
        self.run.is_some()
    }

    fn start_compute(&mut self, request: &ComputeRequest) -> Result<()> {
        if self.run.is_some() {
            return Err(EngineError::AlreadyComputing);
        }
        // Precondition, not an engine error: resuming past the cached range
        // is caller misuse.
        assert!(
            request.next_frame <= self.available,
            "start_compute: next_frame {} beyond {} cached frame(s)",
            request.next_frame,
            self.available
        );

        // Branch/rebake: everything at or after the branch point goes away
        // before any new frame is written.
        if request.next_frame < self.available {
            self.cache.truncate_from(request.next_frame)?;
            self.available = request.next_frame;
        }

        if request.frame_count <= request.next_frame {
            debug!("Engine {}: empty compute range, nothing to do", self.id);
            return Ok(());
        }

        // Refuse to start rather than start and overshoot.
        let projected = self.cache.bytes_on_disk() + self.estimate_frame_bytes();
        if projected > request.quota_bytes {
            return Err(EngineError::QuotaExceeded {
                projected,
                quota: request.quota_bytes,
            });
        }

        let state = if request.next_frame == 0 {
            SimState::initial(&self.setup)
        } else {
            SimState::from_record(&self.setup, &self.cache.read_frame(request.next_frame - 1)?)?
        };

        let total = (request.frame_count - request.next_frame) as u64;
        let mut root = ProgressTree::new(format!("bake '{}'", self.setup.name), total);
        root.set_current_child(ProgressTree::new(
            format!("frame_{:05}", request.next_frame),
            substeps_for(request) as u64,
        ));
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(root);

        let pause = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded();

        let cache = self.cache.clone();
        let setup = self.setup.clone();
        let req = request.clone();
        let progress = Arc::clone(&self.progress);
        let worker_pause = Arc::clone(&pause);
        let short_id = self.id.to_string()[..8].to_string();

        let handle = thread::Builder::new()
            .name(format!("simbake-{short_id}"))
            .spawn(move || {
                compute_run(cache, setup, req, state, worker_pause, progress, tx);
            })?;

        info!(
            "Engine {}: computing frames {}..{}",
            self.id, request.next_frame, request.frame_count
        );
        self.run = Some(ActiveRun {
            rx,
            pause,
            handle,
            target: request.frame_count,
        });
        Ok(())
    }

    fn pause_compute(&mut self) {
        if let Some(run) = &self.run {
            run.pause.store(true, Ordering::Relaxed);
            debug!("Engine {}: pause requested", self.id);
        }
    }

    fn available_frames(&self) -> usize {
        self.available
    }

    fn available_attributes(&self, frame: usize) -> Result<Vec<AttributeDescriptor>> {
        Ok(self.cache.read_frame(frame)?.schema())
    }

    fn fetch_flat_attribute(&self, frame: usize, attr: &AttributeDescriptor) -> Result<Vec<f32>> {
        let record = self.cache.read_frame(frame)?;
        record
            .flat_attribute(attr)
            .map(<[f32]>::to_vec)
            .ok_or_else(|| {
                EngineError::Corrupt(format!(
                    "attribute '{attr}' not present in frame {frame}"
                ))
            })
    }

    fn stats(&self) -> StatsRecord {
        StatsRecord {
            bytes_on_disk: self.cache.bytes_on_disk(),
            loaded_state: Some(LoadedStateStats {
                frames: self.available,
                elements: self.setup.elements,
            }),
            compute: self.run.as_ref().map(|run| ComputeStats {
                remaining_time_sec: self.last_frame_time_sec
                    * run.target.saturating_sub(self.available) as f64,
                last_frame_time_sec: self.last_frame_time_sec,
                last_frame_substeps: self.last_frame_substeps,
            }),
        }
    }

    fn progress(&self) -> Option<ProgressTree> {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn dispose(&mut self) {
        if let Some(run) = self.run.take() {
            run.pause.store(true, Ordering::Relaxed);
            // Let the frame in flight settle; the worker checks the pause
            // flag before each frame, so this terminates.
            for msg in run.rx.iter() {
                match msg {
                    WorkerMsg::Frame { index, .. } => self.available = index + 1,
                    WorkerMsg::Finished => break,
                    WorkerMsg::Failed(e) => {
                        warn!("Engine {}: run failed during dispose: {e}", self.id);
                        break;
                    }
                }
            }
            join_worker(self.id, run.handle);
        }
        if self.lock_held {
            self.cache.release_lock();
            self.lock_held = false;
            info!("Engine {}: disposed", self.id);
        }
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Body of one compute run, executed on the worker thread.
fn compute_run(
    cache: FrameCache,
    setup: SetupDescriptor,
    request: ComputeRequest,
    mut state: SimState,
    pause: Arc<AtomicBool>,
    progress: Arc<Mutex<Option<ProgressTree>>>,
    tx: Sender<WorkerMsg>,
) {
    let substeps = substeps_for(&request);
    let mut estimate = frame_bytes_estimate(&cache, &setup);

    for index in request.next_frame..request.frame_count {
        // Cooperative cancellation point: never start a new frame after the
        // request is observed.
        if pause.load(Ordering::Relaxed) {
            debug!("Compute run paused before frame {index}");
            break;
        }

        let projected = cache.bytes_on_disk() + estimate;
        if projected > request.quota_bytes {
            let _ = tx.send(WorkerMsg::Failed(EngineError::QuotaExceeded {
                projected,
                quota: request.quota_bytes,
            }));
            return;
        }

        update_progress(&progress, &request, index, 0, substeps);

        let t0 = Instant::now();
        state.step(request.time_step, substeps);
        let record = state.to_record(index, substeps);

        match cache.write_frame(&record) {
            Ok(bytes) => {
                estimate = bytes;
                let elapsed_sec = t0.elapsed().as_secs_f64();
                if request.debug_mode {
                    debug!(
                        "Frame {index}: {substeps} substep(s), {bytes} bytes, {:.3}s",
                        elapsed_sec
                    );
                }
                update_progress(&progress, &request, index, substeps, substeps);
                if tx
                    .send(WorkerMsg::Frame {
                        index,
                        elapsed_sec,
                        substeps,
                    })
                    .is_err()
                {
                    return; // receiver gone, engine was dropped
                }
            }
            Err(e) => {
                let _ = tx.send(WorkerMsg::Failed(e));
                return;
            }
        }
    }
    let _ = tx.send(WorkerMsg::Finished);
}

fn update_progress(
    progress: &Arc<Mutex<Option<ProgressTree>>>,
    request: &ComputeRequest,
    index: usize,
    done_substeps: u32,
    substeps: u32,
) {
    let mut guard = progress.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(root) = guard.as_mut() {
        let frames_done = (index - request.next_frame) as u64
            + if done_substeps == substeps { 1 } else { 0 };
        root.set_completed(frames_done);
        let mut child = ProgressTree::new(format!("frame_{index:05}"), substeps as u64);
        child.set_completed(done_substeps as u64);
        root.set_current_child(child);
    }
}

/// Full simulated state: one flat buffer per declared attribute. A frame
/// record carries the whole state, so any cached frame is a resume point.
struct SimState {
    time: f64,
    buffers: Vec<(AttributeDescriptor, Vec<f32>)>,
}

impl SimState {
    fn initial(setup: &SetupDescriptor) -> Self {
        let buffers = setup
            .attributes
            .iter()
            .map(|attr| {
                let len = domain_elements(attr.domain, setup.elements) * attr.components as usize;
                let data = (0..len)
                    .map(|i| ((setup.seed as f64 + i as f64) * 0.618).sin() as f32)
                    .collect();
                (attr.clone(), data)
            })
            .collect();
        Self { time: 0.0, buffers }
    }

    fn from_record(setup: &SetupDescriptor, record: &FrameRecord) -> Result<Self> {
        let mut buffers = Vec::with_capacity(setup.attributes.len());
        for attr in &setup.attributes {
            let data = record.flat_attribute(attr).ok_or_else(|| {
                EngineError::Corrupt(format!(
                    "resume frame {} is missing attribute '{attr}'",
                    record.index
                ))
            })?;
            buffers.push((attr.clone(), data.to_vec()));
        }
        Ok(Self {
            time: record.time,
            buffers,
        })
    }

    /// Damped drift integrator. Deterministic: the same state and step
    /// parameters always produce the same next state.
    fn step(&mut self, time_step: f64, substeps: u32) {
        let h = time_step / substeps as f64;
        for _ in 0..substeps {
            self.time += h;
            let damp = 1.0 - (0.02 * h) as f32;
            for (_, data) in &mut self.buffers {
                for (i, v) in data.iter_mut().enumerate() {
                    let force = (self.time * 1.7 + i as f64 * 0.13).sin() as f32;
                    *v = *v * damp + force * h as f32;
                }
            }
        }
    }

    fn to_record(&self, index: usize, substeps: u32) -> FrameRecord {
        let attributes = self
            .buffers
            .iter()
            .map(|(attr, data)| {
                (
                    attr.name.clone(),
                    AttributeBuffer {
                        domain: attr.domain,
                        components: attr.components,
                        data: data.clone(),
                    },
                )
            })
            .collect();
        FrameRecord {
            index,
            time: self.time,
            substeps,
            attributes,
        }
    }
}

/// Factory for [`LocalEngine`] handles; the default engine of the crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEngineFactory;

impl EngineFactory for LocalEngineFactory {
    fn create(
        &self,
        id: Uuid,
        cache_dir: &std::path::Path,
        setup: &SetupDescriptor,
        quota_bytes: u64,
    ) -> Result<Box<dyn ComputeEngine>> {
        let cache = FrameCache::new(cache_dir, quota_bytes);
        Ok(Box::new(LocalEngine::create(id, cache, setup)?))
    }

    fn load(
        &self,
        id: Uuid,
        cache_dir: &std::path::Path,
        quota_bytes: u64,
    ) -> Result<Box<dyn ComputeEngine>> {
        let cache = FrameCache::new(cache_dir, quota_bytes);
        Ok(Box::new(LocalEngine::load(id, cache)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> SetupDescriptor {
        SetupDescriptor::new(
            "toy",
            16,
            vec![
                AttributeDescriptor::new("density", AttributeDomain::Point, 1),
                AttributeDescriptor::new("velocity", AttributeDomain::Point, 3),
            ],
        )
    }

    fn wait_idle(engine: &mut LocalEngine) {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            engine.poll().unwrap();
            if !engine.computing() {
                return;
            }
            assert!(Instant::now() < deadline, "compute run did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_bake_produces_contiguous_frames() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let mut engine =
            LocalEngine::create(id, FrameCache::new(dir.path(), 1 << 30), &setup()).unwrap();

        engine.start_compute(&ComputeRequest::forward(5)).unwrap();
        assert!(engine.computing());
        wait_idle(&mut engine);

        assert_eq!(engine.available_frames(), 5);
        let schema = engine.available_attributes(4).unwrap();
        assert_eq!(schema.len(), 2);
        let density = engine.fetch_flat_attribute(0, &schema[0]).unwrap();
        assert_eq!(density.len(), 16);

        let stats = engine.stats();
        assert!(stats.bytes_on_disk > 0);
        assert_eq!(stats.loaded_state.unwrap().frames, 5);
        assert!(stats.compute.is_none());
    }

    #[test]
    fn test_quota_refuses_start() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let mut engine =
            LocalEngine::create(id, FrameCache::new(dir.path(), 16), &setup()).unwrap();

        let mut req = ComputeRequest::forward(5);
        req.quota_bytes = 16;
        let err = engine.start_compute(&req).unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded { .. }));
        assert!(!engine.computing());
        assert_eq!(engine.available_frames(), 0);
    }

    #[test]
    fn test_start_while_computing_fails_fast() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let mut engine =
            LocalEngine::create(id, FrameCache::new(dir.path(), 1 << 30), &setup()).unwrap();

        engine.start_compute(&ComputeRequest::forward(50)).unwrap();
        let err = engine.start_compute(&ComputeRequest::forward(5)).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyComputing));
        wait_idle(&mut engine);
        assert_eq!(engine.available_frames(), 50);
    }

    /// Resuming from a cached frame reproduces the straight-through bake.
    #[test]
    fn test_resume_is_deterministic() {
        let straight = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let mut engine =
            LocalEngine::create(id, FrameCache::new(straight.path(), 1 << 30), &setup()).unwrap();
        engine.start_compute(&ComputeRequest::forward(4)).unwrap();
        wait_idle(&mut engine);
        let reference = FrameCache::new(straight.path(), 1 << 30).read_frame(3).unwrap();
        engine.dispose();

        let resumed = TempDir::new().unwrap();
        let cache = FrameCache::new(resumed.path(), 1 << 30);
        let mut engine = LocalEngine::create(Uuid::new_v4(), cache.clone(), &setup()).unwrap();
        engine.start_compute(&ComputeRequest::forward(2)).unwrap();
        wait_idle(&mut engine);
        engine.dispose();

        let mut engine = LocalEngine::load(Uuid::new_v4(), cache.clone()).unwrap();
        let mut req = ComputeRequest::forward(4);
        req.next_frame = 2;
        engine.start_compute(&req).unwrap();
        wait_idle(&mut engine);

        let rebaked = cache.read_frame(3).unwrap();
        assert_eq!(rebaked.time, reference.time);
        assert_eq!(rebaked.attributes, reference.attributes);
    }

    /// A panicking worker is contained and reported, never propagated.
    #[test]
    fn test_worker_panic_is_contained() {
        let handle = thread::Builder::new()
            .spawn(|| panic!("simulated worker crash"))
            .unwrap();
        join_worker(Uuid::new_v4(), handle);
    }

    #[test]
    fn test_progress_tree_reported() {
        let dir = TempDir::new().unwrap();
        let mut engine = LocalEngine::create(
            Uuid::new_v4(),
            FrameCache::new(dir.path(), 1 << 30),
            &setup(),
        )
        .unwrap();

        assert!(engine.progress().is_none());
        engine.start_compute(&ComputeRequest::forward(3)).unwrap();
        wait_idle(&mut engine);

        let tree = engine.progress().unwrap();
        assert_eq!(tree.total(), 3);
        assert!(tree.is_done());
        assert!(tree.total() > 0);
    }
}

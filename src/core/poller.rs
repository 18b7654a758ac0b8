//! The recurring, host-driven progress tick.
//!
//! The poller is the single scheduling primitive of the subsystem. It never
//! spawns a thread: the host calls [`ProgressPoller::tick`] from its own
//! main loop (reference cadence 0.25 s, see [`POLL_INTERVAL`]), and each
//! tick cooperatively advances every continuously-synced session, coalesces
//! redraws by comparing progress trees structurally, and surfaces each
//! engine error once instead of every tick.
//!
//! Frame-availability markers are derived from current state on every tick
//! rather than stored, so they self-heal after any external cache mutation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::warn;
use uuid::Uuid;

use crate::core::registry::SessionRegistry;
use crate::core::session::SimulationSession;
use crate::entities::ProgressTree;

/// Reference tick interval for interactive hosts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Derived frame-availability markers for one session, recomputed each
/// tick. Nothing here is authoritative state; it is a view for timeline
/// widgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMarkers {
    /// Contiguous cached frame count right now.
    pub available_frames: usize,
    /// Latest computed frame, if any.
    pub latest_frame: Option<usize>,
    /// Frames the current bake aims to fill: `0..target_frame_count`.
    pub bake_window: std::ops::Range<usize>,
    /// Inclusive range of frames that can be displayed right now.
    pub capture_window: Option<(usize, usize)>,
}

impl FrameMarkers {
    fn derive(session: &SimulationSession) -> Self {
        let available = session.available_frames();
        Self {
            available_frames: available,
            latest_frame: available.checked_sub(1),
            bake_window: 0..session.target_frame_count(),
            capture_window: available.checked_sub(1).map(|last| (0, last)),
        }
    }
}

/// What one tick observed: which sessions need a redraw, and the fresh
/// markers for every polled session.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub redraw: Vec<Uuid>,
    pub markers: IndexMap<Uuid, FrameMarkers>,
}

impl TickOutcome {
    pub fn needs_redraw(&self, id: Uuid) -> bool {
        self.redraw.contains(&id)
    }
}

/// Per-session memory of what was last shown, used for coalescing.
#[derive(Default)]
struct SessionView {
    progress: Option<ProgressTree>,
    surfaced_error: Option<String>,
}

/// Cooperative poller over a registry. Owns no thread and no session; the
/// host decides when ticks happen.
pub struct ProgressPoller {
    interval: Duration,
    last_tick: Option<Instant>,
    views: HashMap<Uuid, SessionView>,
}

impl Default for ProgressPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressPoller {
    pub fn new() -> Self {
        Self::with_interval(POLL_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: None,
            views: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True once `interval` has passed since the previous tick.
    pub fn due(&self, now: Instant) -> bool {
        match self.last_tick {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        }
    }

    /// Convenience for host loops running faster than the poll cadence.
    pub fn tick_if_due(&mut self, registry: &mut SessionRegistry) -> Option<TickOutcome> {
        let now = Instant::now();
        if !self.due(now) {
            return None;
        }
        self.last_tick = Some(now);
        Some(self.tick(registry))
    }

    /// One tick over every continuously-synced session.
    ///
    /// No session can starve the others: polling happens per session, and a
    /// failure is absorbed into that session's `last_error` by the session
    /// itself. An error is surfaced (logged + redraw) only when its message
    /// differs from the one already shown.
    pub fn tick(&mut self, registry: &mut SessionRegistry) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        for (&id, session) in registry.iter_mut() {
            if !session.continuous_sync() {
                continue;
            }
            session.poll();

            let view = self.views.entry(id).or_default();
            let mut redraw = false;

            // Coalesce: redraw only when the tree structurally changed
            let progress = session.last_progress().cloned();
            if progress != view.progress {
                view.progress = progress;
                redraw = true;
            }

            // Surface each distinct error once, not every tick
            let error = session.last_error().map(str::to_owned);
            if error != view.surfaced_error {
                if let Some(msg) = &error {
                    warn!("Session {id}: {msg}");
                    redraw = true;
                }
                view.surfaced_error = error;
            }

            if redraw {
                outcome.redraw.push(id);
            }
            outcome.markers.insert(id, FrameMarkers::derive(session));
        }

        // Forget sessions that left the registry
        self.views.retain(|id, _| registry.exists(*id));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{ComputeEngine, ComputeRequest, EngineFactory};
    use crate::core::local_engine::LocalEngineFactory;
    use crate::entities::{
        AttributeDescriptor, AttributeDomain, SetupDescriptor, StatsRecord,
    };
    use crate::error::EngineError;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> SetupDescriptor {
        SetupDescriptor::new(
            "toy",
            8,
            vec![AttributeDescriptor::new("density", AttributeDomain::Point, 1)],
        )
    }

    fn local_registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(LocalEngineFactory))
    }

    #[test]
    fn test_redraw_coalescing() {
        let dir = TempDir::new().unwrap();
        let mut registry = local_registry();
        let id = Uuid::new_v4();
        registry.create(id, dir.path(), &setup(), 1 << 30).unwrap();

        let mut poller = ProgressPoller::new();

        // Nothing running, no progress yet: first tick settles the view
        poller.tick(&mut registry);
        // Steady state with no change: no redraw
        let outcome = poller.tick(&mut registry);
        assert!(!outcome.needs_redraw(id));

        registry
            .get_mut(id)
            .unwrap()
            .start_compute(&ComputeRequest::forward(3))
            .unwrap();
        assert!(registry.get_mut(id).unwrap().wait_until_idle(POLL_INTERVAL * 40));

        // Progress tree appeared: redraw
        let outcome = poller.tick(&mut registry);
        assert!(outcome.needs_redraw(id));

        // And coalesced again afterwards
        let outcome = poller.tick(&mut registry);
        assert!(!outcome.needs_redraw(id));
    }

    #[test]
    fn test_markers_derived_each_tick() {
        let dir = TempDir::new().unwrap();
        let mut registry = local_registry();
        let id = Uuid::new_v4();
        registry.create(id, dir.path(), &setup(), 1 << 30).unwrap();

        let mut poller = ProgressPoller::new();
        let outcome = poller.tick(&mut registry);
        let markers = &outcome.markers[&id];
        assert_eq!(markers.available_frames, 0);
        assert_eq!(markers.latest_frame, None);
        assert_eq!(markers.capture_window, None);

        registry
            .get_mut(id)
            .unwrap()
            .start_compute(&ComputeRequest::forward(4))
            .unwrap();
        assert!(registry.get_mut(id).unwrap().wait_until_idle(POLL_INTERVAL * 40));

        let outcome = poller.tick(&mut registry);
        let markers = &outcome.markers[&id];
        assert_eq!(markers.available_frames, 4);
        assert_eq!(markers.latest_frame, Some(3));
        assert_eq!(markers.bake_window, 0..4);
        assert_eq!(markers.capture_window, Some((0, 3)));
    }

    #[test]
    fn test_sessions_opting_out_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut registry = local_registry();
        let id = Uuid::new_v4();
        registry.create(id, dir.path(), &setup(), 1 << 30).unwrap();
        registry.get_mut(id).unwrap().set_continuous_sync(false);

        let mut poller = ProgressPoller::new();
        let outcome = poller.tick(&mut registry);
        assert!(outcome.markers.is_empty());
        assert!(outcome.redraw.is_empty());
    }

    /// Engine double whose poll always fails, to exercise error surfacing.
    struct FailingEngine;

    impl ComputeEngine for FailingEngine {
        fn poll(&mut self) -> crate::error::Result<()> {
            Err(EngineError::Corrupt("simulated poll failure".to_string()))
        }
        fn computing(&self) -> bool {
            false
        }
        fn start_compute(&mut self, _request: &ComputeRequest) -> crate::error::Result<()> {
            Ok(())
        }
        fn pause_compute(&mut self) {}
        fn available_frames(&self) -> usize {
            0
        }
        fn available_attributes(
            &self,
            frame: usize,
        ) -> crate::error::Result<Vec<AttributeDescriptor>> {
            Err(EngineError::NoFrameAvailable { frame, available: 0 })
        }
        fn fetch_flat_attribute(
            &self,
            frame: usize,
            _attr: &AttributeDescriptor,
        ) -> crate::error::Result<Vec<f32>> {
            Err(EngineError::NoFrameAvailable { frame, available: 0 })
        }
        fn stats(&self) -> StatsRecord {
            StatsRecord::default()
        }
        fn progress(&self) -> Option<crate::entities::ProgressTree> {
            None
        }
        fn dispose(&mut self) {}
    }

    /// Fails for one designated id, delegates to the local engine otherwise.
    struct MixedFactory {
        fail_for: Uuid,
    }

    impl EngineFactory for MixedFactory {
        fn create(
            &self,
            id: Uuid,
            cache_dir: &Path,
            setup: &SetupDescriptor,
            quota_bytes: u64,
        ) -> crate::error::Result<Box<dyn ComputeEngine>> {
            if id == self.fail_for {
                Ok(Box::new(FailingEngine))
            } else {
                LocalEngineFactory.create(id, cache_dir, setup, quota_bytes)
            }
        }
        fn load(
            &self,
            id: Uuid,
            cache_dir: &Path,
            quota_bytes: u64,
        ) -> crate::error::Result<Box<dyn ComputeEngine>> {
            if id == self.fail_for {
                Ok(Box::new(FailingEngine))
            } else {
                LocalEngineFactory.load(id, cache_dir, quota_bytes)
            }
        }
    }

    /// A failing session is surfaced once and never starves the others.
    #[test]
    fn test_error_surfaced_once_and_no_starvation() {
        let bad = Uuid::new_v4();
        let good = Uuid::new_v4();
        let mut registry = SessionRegistry::new(Arc::new(MixedFactory { fail_for: bad }));

        let bad_dir = TempDir::new().unwrap();
        let good_dir = TempDir::new().unwrap();
        registry.create(bad, bad_dir.path(), &setup(), 1 << 20).unwrap();
        registry.create(good, good_dir.path(), &setup(), 1 << 30).unwrap();

        registry
            .get_mut(good)
            .unwrap()
            .start_compute(&ComputeRequest::forward(2))
            .unwrap();
        assert!(registry.get_mut(good).unwrap().wait_until_idle(POLL_INTERVAL * 40));

        let mut poller = ProgressPoller::new();
        let first = poller.tick(&mut registry);
        assert!(first.needs_redraw(bad));
        assert!(registry.get(bad).unwrap().last_error().is_some());
        // The healthy session was still polled and reported
        assert!(first.markers.contains_key(&good));
        assert_eq!(first.markers[&good].available_frames, 2);

        // Same message again: surfaced once, no new redraw
        let second = poller.tick(&mut registry);
        assert!(!second.needs_redraw(bad));
        assert!(second.markers.contains_key(&bad));
    }
}

//! Table of live sessions, keyed by session identifier.
//!
//! The registry owns the creation/teardown ordering that keeps the core
//! invariant of the whole subsystem: at most one live engine handle per
//! identifier, ever. Re-creating an identifier disposes the old handle
//! *before* the new one is constructed, so two engines can never hold the
//! same cache lock at the same time.
//!
//! Constructed as an explicit value rather than ambient global state: the
//! host makes one at session start and calls `remove_all` (or just drops
//! it) at session end; tests build as many independent registries as they
//! like.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info};
use uuid::Uuid;

use crate::core::engine::EngineFactory;
use crate::core::session::SimulationSession;
use crate::entities::SetupDescriptor;
use crate::error::Result;

pub struct SessionRegistry {
    sessions: IndexMap<Uuid, SimulationSession>,
    factory: Arc<dyn EngineFactory>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            sessions: IndexMap::new(),
            factory,
        }
    }

    /// Create a session with a fresh cache generation. Any existing session
    /// under `id` is disposed first; on failure the old session stays gone
    /// (its handle was already released) and the error propagates.
    pub fn create(
        &mut self,
        id: Uuid,
        cache_dir: &Path,
        setup: &SetupDescriptor,
        quota_bytes: u64,
    ) -> Result<&mut SimulationSession> {
        self.dispose_existing(id);
        let session =
            SimulationSession::create(self.factory.as_ref(), id, cache_dir, setup, quota_bytes)?;
        Ok(self.insert(session))
    }

    /// Load a session from an existing cache. Same replacement rule as
    /// [`create`](Self::create).
    pub fn load(
        &mut self,
        id: Uuid,
        cache_dir: &Path,
        quota_bytes: u64,
    ) -> Result<&mut SimulationSession> {
        self.dispose_existing(id);
        let session = SimulationSession::load(self.factory.as_ref(), id, cache_dir, quota_bytes)?;
        Ok(self.insert(session))
    }

    fn dispose_existing(&mut self, id: Uuid) {
        if let Some(mut old) = self.sessions.shift_remove(&id) {
            debug!("Registry: replacing session {id}, disposing old handle first");
            old.dispose();
        }
    }

    fn insert(&mut self, session: SimulationSession) -> &mut SimulationSession {
        let id = session.id();
        self.sessions.insert(id, session);
        self.sessions
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("session {id} just inserted"))
    }

    pub fn get(&self, id: Uuid) -> Option<&SimulationSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut SimulationSession> {
        self.sessions.get_mut(&id)
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Uuid, &mut SimulationSession)> {
        self.sessions.iter_mut()
    }

    /// Remove one session, disposing its handle. Returns false if absent.
    pub fn remove(&mut self, id: Uuid) -> bool {
        match self.sessions.shift_remove(&id) {
            Some(mut session) => {
                session.dispose();
                info!("Registry: removed session {id}");
                true
            }
            None => false,
        }
    }

    /// Dispose every session. Called before the owning host context is torn
    /// down; safe to call any number of times.
    pub fn remove_all(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        info!("Registry: disposing {} session(s)", self.sessions.len());
        for (_, session) in self.sessions.iter_mut() {
            session.dispose();
        }
        self.sessions.clear();
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.remove_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{ComputeEngine, ComputeRequest};
    use crate::entities::{
        AttributeDescriptor, AttributeDomain, ProgressTree, StatsRecord,
    };
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Engine double that only counts live handles.
    struct CountingEngine {
        live: Arc<AtomicUsize>,
        disposed: bool,
    }

    impl ComputeEngine for CountingEngine {
        fn poll(&mut self) -> crate::error::Result<()> {
            Ok(())
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
        fn progress(&self) -> Option<ProgressTree> {
            None
        }
        fn dispose(&mut self) {
            if !self.disposed {
                self.disposed = true;
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    struct CountingFactory {
        live: Arc<AtomicUsize>,
    }

    impl EngineFactory for CountingFactory {
        fn create(
            &self,
            _id: Uuid,
            _cache_dir: &Path,
            _setup: &SetupDescriptor,
            _quota_bytes: u64,
        ) -> crate::error::Result<Box<dyn ComputeEngine>> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingEngine {
                live: Arc::clone(&self.live),
                disposed: false,
            }))
        }

        fn load(
            &self,
            id: Uuid,
            cache_dir: &Path,
            quota_bytes: u64,
        ) -> crate::error::Result<Box<dyn ComputeEngine>> {
            let _ = quota_bytes;
            self.create(id, cache_dir, &test_setup(), 0)
        }
    }

    fn test_setup() -> SetupDescriptor {
        SetupDescriptor::new(
            "toy",
            4,
            vec![AttributeDescriptor::new("density", AttributeDomain::Point, 1)],
        )
    }

    fn counting_registry() -> (SessionRegistry, Arc<AtomicUsize>) {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = SessionRegistry::new(Arc::new(CountingFactory {
            live: Arc::clone(&live),
        }));
        (registry, live)
    }

    /// At most one live handle per identifier, across any create/load mix.
    #[test]
    fn test_at_most_one_live_handle_per_id() {
        let dir = TempDir::new().unwrap();
        let (mut registry, live) = counting_registry();
        let id = Uuid::new_v4();

        registry.create(id, dir.path(), &test_setup(), 1 << 20).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);

        // Re-create: old handle is disposed before the new one exists
        registry.create(id, dir.path(), &test_setup(), 1 << 20).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);

        registry.load(id, dir.path(), 1 << 20).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        registry.remove(id);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(!registry.exists(id));
    }

    #[test]
    fn test_remove_all_twice_is_safe() {
        let dir = TempDir::new().unwrap();
        let (mut registry, live) = counting_registry();
        for _ in 0..3 {
            registry
                .create(Uuid::new_v4(), dir.path(), &test_setup(), 1 << 20)
                .unwrap();
        }
        assert_eq!(live.load(Ordering::SeqCst), 3);

        registry.remove_all();
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());

        registry.remove_all();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_disposes_everything() {
        let dir = TempDir::new().unwrap();
        let (mut registry, live) = counting_registry();
        registry
            .create(Uuid::new_v4(), dir.path(), &test_setup(), 1 << 20)
            .unwrap();
        registry
            .create(Uuid::new_v4(), dir.path(), &test_setup(), 1 << 20)
            .unwrap();

        drop(registry);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_missing_is_false() {
        let (mut registry, _) = counting_registry();
        assert!(!registry.remove(Uuid::new_v4()));
    }
}

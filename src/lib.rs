//! SIMBAKE - simulation session manager library
//!
//! Coordinates three independently-paced actors: a host's scrubbable
//! timeline, a quota-limited on-disk frame cache, and an asynchronous
//! compute engine reached through a narrow, pollable contract.

// Core engine (cache, engine boundary, sessions, registry, sync, poller)
pub mod core;

// App modules
pub mod cli;
pub mod entities;
pub mod error;

// Re-export commonly used types from core
pub use crate::core::engine::{ComputeEngine, ComputeRequest, EngineFactory};
pub use crate::core::frame_cache::FrameCache;
pub use crate::core::local_engine::{LocalEngine, LocalEngineFactory};
pub use crate::core::poller::{FrameMarkers, ProgressPoller, POLL_INTERVAL};
pub use crate::core::registry::SessionRegistry;
pub use crate::core::session::SimulationSession;

// Re-export entities and errors
pub use entities::{
    AttributeDescriptor, AttributeDomain, FrameRecord, ProgressTree, SetupDescriptor, StatsRecord,
};
pub use error::{DesyncReport, EngineError};

//! Core engine: cache addressing, engine boundary, sessions, registry,
//! timeline synchronization and the progress poller.

pub mod engine;
pub mod frame_cache;
pub mod local_engine;
pub mod poller;
pub mod registry;
pub mod session;
pub mod sync;

pub use engine::{ComputeEngine, ComputeRequest, EngineFactory};
pub use frame_cache::FrameCache;
pub use local_engine::{LocalEngine, LocalEngineFactory};
pub use poller::{FrameMarkers, ProgressPoller, TickOutcome, POLL_INTERVAL};
pub use registry::SessionRegistry;
pub use session::SimulationSession;
pub use sync::{resolve_frame, sync_outputs, OutputBinding};

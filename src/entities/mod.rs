//! Data types shared across the session manager: attribute schemas, frame
//! records, setup descriptors, progress trees and stats snapshots.

pub mod attrs;
pub mod progress;
pub mod setup;
pub mod stats;

pub use attrs::{AttributeBuffer, AttributeDescriptor, AttributeDomain, FrameRecord};
pub use progress::ProgressTree;
pub use setup::{SetupDescriptor, SETUP_FORMAT_VERSION};
pub use stats::{ComputeStats, LoadedStateStats, StatsRecord};

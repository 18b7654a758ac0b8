//! Error taxonomy of the session manager.
//!
//! Everything recoverable travels as [`EngineError`] and ends up latched in
//! the owning session's `last_error` for the UI. Programmer errors (driving
//! a disposed session, resuming past the cached range) panic instead and
//! never appear here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Another process holds the cache's advisory lock marker.
    #[error("cache at {path} is locked by another process")]
    LockedCache { path: PathBuf },

    /// The cache on disk was written by an incompatible engine.
    #[error("cache at {path} is incompatible: {reason}")]
    IncompatibleCache { path: PathBuf, reason: String },

    /// A frame beyond the contiguous cached range was requested.
    #[error("frame {frame} is not available ({available} frame(s) cached)")]
    NoFrameAvailable { frame: usize, available: usize },

    /// Writing the next frame would push disk usage past the quota.
    #[error("disk quota exceeded: next frame projects {projected} bytes, quota is {quota}")]
    QuotaExceeded { projected: u64, quota: u64 },

    /// A compute run is already in flight for this session.
    #[error("a compute run is already in flight")]
    AlreadyComputing,

    /// Bound outputs no longer match the cached frame's schema.
    #[error("{0}")]
    DesyncedOutput(DesyncReport),

    /// The setup descriptor was rejected at cache creation.
    #[error("cannot initialize cache: {0}")]
    Init(String),

    /// The cache could not be attached to.
    #[error("cannot load cache: {0}")]
    Load(String),

    /// On-disk state that violates the cache contract.
    #[error("corrupt cache state: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Corrupt(e.to_string())
    }
}

/// Aggregated result of one desync sweep: every output that was unbound
/// when a frame was applied, with a per-output cause.
///
/// Rendered as a single human-readable message so one sweep surfaces one
/// error, however many outputs it unbinds.
#[derive(Debug, Clone, PartialEq)]
pub struct DesyncReport {
    /// Frame the sweep was applied against.
    pub frame: usize,
    /// `(output name, cause)` for every unbound output, in binding order.
    pub outputs: Vec<(String, String)>,
}

impl std::fmt::Display for DesyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} output(s) desynced from frame {} and were unbound: ",
            self.outputs.len(),
            self.frame
        )?;
        for (i, (output, cause)) in self.outputs.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{output} ({cause})")?;
        }
        Ok(())
    }
}

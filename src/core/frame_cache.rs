//! On-disk frame cache for one session.
//!
//! Layout of a cache directory:
//!
//! ```text
//! setup.json          write-once descriptor for this cache generation
//! frame_00000.json    one record per cached frame, contiguous from 0
//! frame_00001.json
//! lock                zero-byte marker, present iff a process owns the cache
//! ```
//!
//! Frame indices are dense and zero-based: writing frame `k` requires frames
//! `0..k-1` to exist already, and `available_frames()` is defined as the
//! length of the contiguous run starting at 0. Anything after a gap is
//! invisible.
//!
//! The lock marker is advisory. One trusted process participates at a time;
//! a marker surviving a crash is removed by the operator via `remove_lock`,
//! never automatically.
//!
//! Quota enforcement is cooperative: this layer only reports
//! `bytes_on_disk()`, the engine refuses to start a frame that would push
//! usage past the configured maximum. A single in-flight frame may therefore
//! transiently exceed the quota by at most one frame's worth.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::entities::{FrameRecord, SetupDescriptor, SETUP_FORMAT_VERSION};
use crate::error::{EngineError, Result};

/// File name of the write-once setup descriptor.
pub const SETUP_FILE: &str = "setup.json";
/// File name of the advisory lock marker.
pub const LOCK_FILE: &str = "lock";

fn frame_file_name(index: usize) -> String {
    format!("frame_{index:05}.json")
}

/// Parse a frame index back out of a `frame_NNNNN.json` file name.
fn parse_frame_index(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("frame_")?.parse().ok()
}

/// Glob pattern matching the frame records of `dir`. The directory
/// component is escaped so paths containing glob metacharacters (`[`, `*`,
/// `?`) still enumerate their frames.
fn frame_pattern(dir: &Path) -> Option<String> {
    let dir = glob::Pattern::escape(dir.to_str()?);
    Path::new(&dir)
        .join("frame_*.json")
        .to_str()
        .map(str::to_owned)
}

/// Addressing and bookkeeping for one session's cache directory.
///
/// Cheap to clone; holds no open handles, every operation goes back to the
/// filesystem so external mutations (manual reload, operator cleanup) are
/// picked up on the next call.
#[derive(Debug, Clone)]
pub struct FrameCache {
    dir: PathBuf,
    quota_bytes: u64,
}

impl FrameCache {
    pub fn new(dir: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// True iff a setup descriptor is present, regardless of lock state.
    pub fn exists(dir: &Path) -> bool {
        dir.join(SETUP_FILE).is_file()
    }

    /// True iff the advisory lock marker is present.
    pub fn is_locked(dir: &Path) -> bool {
        dir.join(LOCK_FILE).exists()
    }

    /// Operator recovery after an abnormal exit: unconditionally delete the
    /// lock marker. Never called by normal flow; prior frames stay intact.
    pub fn remove_lock(dir: &Path) -> Result<()> {
        let lock = dir.join(LOCK_FILE);
        if lock.exists() {
            fs::remove_file(&lock)?;
            info!("Removed stale lock marker {}", lock.display());
        }
        Ok(())
    }

    /// Claim the cache for writing. Fails with `LockedCache` if another
    /// process already holds it.
    pub fn acquire_lock(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let lock = self.dir.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(_) => {
                debug!("Acquired cache lock {}", lock.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(EngineError::LockedCache {
                    path: self.dir.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release our own lock marker. Errors are logged, not propagated: this
    /// runs during teardown and must always succeed locally.
    pub fn release_lock(&self) {
        let lock = self.dir.join(LOCK_FILE);
        if lock.exists() {
            if let Err(e) = fs::remove_file(&lock) {
                warn!("Failed to release cache lock {}: {}", lock.display(), e);
            } else {
                debug!("Released cache lock {}", lock.display());
            }
        }
    }

    /// Start a fresh cache generation: validate and write the setup
    /// descriptor, discarding any previously cached frames. The caller must
    /// hold the lock.
    pub fn init_fresh(&self, setup: &SetupDescriptor) -> Result<()> {
        setup.validate().map_err(EngineError::Init)?;
        fs::create_dir_all(&self.dir)?;
        self.truncate_from(0)?;

        let setup_path = self.dir.join(SETUP_FILE);
        let json = serde_json::to_string_pretty(setup)?;
        fs::write(&setup_path, json)?;
        info!(
            "Initialized cache generation '{}' at {} ({} elements, {} attribute(s))",
            setup.name,
            self.dir.display(),
            setup.elements,
            setup.attributes.len()
        );
        Ok(())
    }

    /// Read the setup descriptor of an existing cache.
    pub fn read_setup(&self) -> Result<SetupDescriptor> {
        let setup_path = self.dir.join(SETUP_FILE);
        if !setup_path.is_file() {
            return Err(EngineError::Load(format!(
                "no setup descriptor at {}",
                setup_path.display()
            )));
        }
        let json = fs::read_to_string(&setup_path)?;
        let setup: SetupDescriptor = serde_json::from_str(&json)?;
        if setup.format_version != SETUP_FORMAT_VERSION {
            return Err(EngineError::IncompatibleCache {
                path: self.dir.clone(),
                reason: format!(
                    "setup format v{} (engine supports v{})",
                    setup.format_version, SETUP_FORMAT_VERSION
                ),
            });
        }
        Ok(setup)
    }

    /// Count of contiguous frames starting at 0. Records after a gap do not
    /// count; they are unreachable by contract.
    pub fn available_frames(&self) -> usize {
        let Some(pattern) = frame_pattern(&self.dir) else {
            return 0;
        };
        let mut indices = BTreeSet::new();
        if let Ok(paths) = glob::glob(&pattern) {
            for path in paths.flatten() {
                if let Some(idx) = parse_frame_index(&path) {
                    indices.insert(idx);
                }
            }
        }
        let mut count = 0;
        while indices.contains(&count) {
            count += 1;
        }
        count
    }

    /// Total bytes the cache directory occupies on disk (setup + frames;
    /// in-flight temp files are excluded).
    pub fn bytes_on_disk(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) != Some("tmp"))
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }

    /// Append one frame record. The record's index must equal
    /// `available_frames()`; anything else would create a gap.
    ///
    /// The write is atomic: the record lands under a temp name and is
    /// renamed into place, so a crashed write leaves no partial frame.
    pub fn write_frame(&self, record: &FrameRecord) -> Result<u64> {
        let available = self.available_frames();
        if record.index != available {
            return Err(EngineError::Corrupt(format!(
                "non-contiguous frame write: index {} with {} frame(s) cached",
                record.index, available
            )));
        }
        let final_path = self.dir.join(frame_file_name(record.index));
        let tmp_path = final_path.with_extension("json.tmp");
        let json = serde_json::to_vec(record)?;
        let bytes = json.len() as u64;
        fs::write(&tmp_path, &json)?;
        fs::rename(&tmp_path, &final_path)?;
        debug!("Wrote frame {} ({} bytes)", record.index, bytes);
        Ok(bytes)
    }

    /// Read one cached frame record.
    pub fn read_frame(&self, index: usize) -> Result<FrameRecord> {
        let available = self.available_frames();
        if index >= available {
            return Err(EngineError::NoFrameAvailable {
                frame: index,
                available,
            });
        }
        let json = fs::read_to_string(self.dir.join(frame_file_name(index)))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Discard all frames at or after `from` (the branch/rebake step).
    /// Returns the number of records removed. The setup descriptor and
    /// frames before the branch point are untouched.
    pub fn truncate_from(&self, from: usize) -> Result<usize> {
        let Some(pattern) = frame_pattern(&self.dir) else {
            return Ok(0);
        };
        let mut removed = 0;
        if let Ok(paths) = glob::glob(&pattern) {
            for path in paths.flatten() {
                if let Some(idx) = parse_frame_index(&path) {
                    if idx >= from {
                        fs::remove_file(&path)?;
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            info!("Discarded {removed} cached frame(s) at or after frame {from}");
        }
        Ok(removed)
    }

    /// Size of the most recent frame record, if any. Used by the engine to
    /// project disk usage before starting the next frame.
    pub fn last_frame_bytes(&self) -> Option<u64> {
        let available = self.available_frames();
        if available == 0 {
            return None;
        }
        fs::metadata(self.dir.join(frame_file_name(available - 1)))
            .ok()
            .map(|m| m.len())
    }
}

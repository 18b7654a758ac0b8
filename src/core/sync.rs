//! Timeline-to-frame synchronization.
//!
//! `resolve_frame` is the pure mapping the host evaluates once per refresh
//! for every continuously-synced session; it is recomputed from scratch
//! every time and never persisted. `sync_outputs` is the desync sweep that
//! runs when a resolved frame is applied to the outputs bound to a session.

use crate::core::session::SimulationSession;
use crate::entities::AttributeDescriptor;
use crate::error::{DesyncReport, EngineError, Result};

/// Map a host timeline position to a cache frame index.
///
/// Returns `None` when no frame can be shown (nothing cached yet, or a
/// zero frame-count target); otherwise the index is clamped into
/// `[0, min(target_frame_count, available_frames) - 1]`, so any timeline
/// position (before the display start, past the end of the bake) lands on
/// a real cached frame.
pub fn resolve_frame(
    timeline_position: i64,
    display_start: i64,
    target_frame_count: usize,
    available_frames: usize,
) -> Option<usize> {
    let limit = target_frame_count.min(available_frames);
    if limit == 0 {
        return None;
    }
    let relative = timeline_position - display_start;
    Some(relative.clamp(0, limit as i64 - 1) as usize)
}

/// A dependent output and the attribute schema it was saved against.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBinding {
    /// Host-side name of the output (shown in the desync message).
    pub output: String,
    /// Attribute this output reads from each synced frame.
    pub attribute: AttributeDescriptor,
}

impl OutputBinding {
    pub fn new(output: impl Into<String>, attribute: AttributeDescriptor) -> Self {
        Self {
            output: output.into(),
            attribute,
        }
    }
}

/// Apply a resolved frame to a session's bound outputs.
///
/// Outputs whose saved schema no longer matches the cached frame are
/// removed from `outputs` (unbound) and collected into one aggregated
/// `DesyncedOutput` error: a single human-readable message per sweep, not
/// one per output. The session's compute and cache state is untouched; the
/// message is also latched into the session's `last_error`.
pub fn sync_outputs(
    session: &mut SimulationSession,
    frame: usize,
    outputs: &mut Vec<OutputBinding>,
) -> Result<()> {
    let schema = session.available_attributes(frame)?;

    let mut desynced = Vec::new();
    outputs.retain(|binding| {
        if schema.contains(&binding.attribute) {
            return true;
        }
        let cause = if schema.iter().any(|a| a.name == binding.attribute.name) {
            format!("attribute '{}' changed type", binding.attribute)
        } else {
            format!("attribute '{}' renamed or removed", binding.attribute.name)
        };
        desynced.push((binding.output.clone(), cause));
        false
    });

    if desynced.is_empty() {
        return Ok(());
    }
    let report = DesyncReport {
        frame,
        outputs: desynced,
    };
    session.note_error(report.to_string());
    Err(EngineError::DesyncedOutput(report))
}

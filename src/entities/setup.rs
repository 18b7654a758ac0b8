//! Setup descriptor: the write-once, per-generation cache configuration.
//!
//! Written exactly once when a cache generation is created and never edited
//! afterwards; overwriting a cache starts a new generation with a fresh
//! descriptor. Carries a format version so `load` can refuse caches written
//! by an incompatible engine instead of misreading them.

use serde::{Deserialize, Serialize};

use crate::entities::attrs::AttributeDescriptor;

/// Current setup format version. Bump on breaking descriptor changes.
pub const SETUP_FORMAT_VERSION: u32 = 1;

/// Immutable per-session configuration the engine bakes against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupDescriptor {
    /// Format version, checked on load.
    pub format_version: u32,
    /// Human-readable session name.
    pub name: String,
    /// Number of simulated elements per point-domain attribute.
    pub elements: usize,
    /// Attributes every frame of this generation carries.
    pub attributes: Vec<AttributeDescriptor>,
    /// Seed for the deterministic initial state.
    pub seed: u64,
}

impl SetupDescriptor {
    pub fn new(name: impl Into<String>, elements: usize, attributes: Vec<AttributeDescriptor>) -> Self {
        Self {
            format_version: SETUP_FORMAT_VERSION,
            name: name.into(),
            elements,
            attributes,
            seed: 0,
        }
    }

    /// Structural validation; the reason string becomes the init error shown
    /// to the user when `create` rejects a descriptor.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("setup name is empty".to_string());
        }
        if self.elements == 0 {
            return Err("setup declares zero elements".to_string());
        }
        if self.attributes.is_empty() {
            return Err("setup declares no attributes".to_string());
        }
        for attr in &self.attributes {
            if attr.name.trim().is_empty() {
                return Err("attribute with empty name".to_string());
            }
            if attr.components == 0 || attr.components > 16 {
                return Err(format!(
                    "attribute '{}' has unsupported component count {}",
                    attr.name, attr.components
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for attr in &self.attributes {
            if !seen.insert(attr.name.as_str()) {
                return Err(format!("duplicate attribute name '{}'", attr.name));
            }
        }
        Ok(())
    }
}

//! Per-frame attribute model: descriptors plus flat float buffers.
//!
//! The binary layout of individual buffers is not part of the control
//! protocol; frames carry plain flat `f32` vectors keyed by attribute name
//! and the schema (domain + component count) needed to interpret them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Where an attribute lives in the simulated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeDomain {
    /// One value per simulated element (particle, point).
    Point,
    /// One value per grid cell.
    Voxel,
    /// A single value for the whole frame.
    Global,
}

/// Schema of one attribute: the join key between cached frames and the
/// outputs bound to them. Two descriptors match iff all three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub domain: AttributeDomain,
    /// Components per element (1 = scalar, 3 = vector, ...).
    pub components: u32,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, domain: AttributeDomain, components: u32) -> Self {
        Self {
            name: name.into(),
            domain,
            components,
        }
    }
}

impl std::fmt::Display for AttributeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?} x{})", self.name, self.domain, self.components)
    }
}

/// One attribute's flat data inside a frame record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeBuffer {
    pub domain: AttributeDomain,
    pub components: u32,
    pub data: Vec<f32>,
}

impl AttributeBuffer {
    pub fn descriptor(&self, name: &str) -> AttributeDescriptor {
        AttributeDescriptor::new(name, self.domain, self.components)
    }
}

/// One immutable checkpoint of simulated state, as persisted on disk.
///
/// Records are append-only and addressed by a dense zero-based index; the
/// cache layer enforces contiguity, this struct just carries the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub index: usize,
    /// Simulation time at the end of this frame, seconds.
    pub time: f64,
    /// Substeps the engine took to reach this frame.
    pub substeps: u32,
    pub attributes: IndexMap<String, AttributeBuffer>,
}

impl FrameRecord {
    /// Schema of every attribute in this frame, in record order.
    pub fn schema(&self) -> Vec<AttributeDescriptor> {
        self.attributes
            .iter()
            .map(|(name, buf)| buf.descriptor(name))
            .collect()
    }

    /// Flat buffer for `descriptor`, or `None` if the name is absent or the
    /// stored schema does not match.
    pub fn flat_attribute(&self, descriptor: &AttributeDescriptor) -> Option<&[f32]> {
        let buf = self.attributes.get(&descriptor.name)?;
        if buf.domain == descriptor.domain && buf.components == descriptor.components {
            Some(&buf.data)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FrameRecord {
        let mut attributes = IndexMap::new();
        attributes.insert(
            "density".to_string(),
            AttributeBuffer {
                domain: AttributeDomain::Point,
                components: 1,
                data: vec![0.5, 0.25],
            },
        );
        FrameRecord {
            index: 0,
            time: 0.0,
            substeps: 1,
            attributes,
        }
    }

    #[test]
    fn test_schema_roundtrip() {
        let rec = record();
        let schema = rec.schema();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema[0].name, "density");
        assert!(rec.flat_attribute(&schema[0]).is_some());
    }

    /// Test: schema mismatch yields None, not wrong data
    #[test]
    fn test_mismatched_descriptor_rejected() {
        let rec = record();
        let wrong = AttributeDescriptor::new("density", AttributeDomain::Point, 3);
        assert!(rec.flat_attribute(&wrong).is_none());
        let missing = AttributeDescriptor::new("velocity", AttributeDomain::Point, 3);
        assert!(rec.flat_attribute(&missing).is_none());
    }
}

//! Recursive progress tree reported by the compute engine.
//!
//! The poller compares consecutive trees structurally and only requests a
//! redraw when they differ, so `PartialEq` here is load-bearing: two trees
//! that compare equal must describe the same on-screen state.

use serde::{Deserialize, Deserializer, Serialize};

/// One node of a progress tree: a named task with step counters and
/// ordered sub-tasks.
///
/// Invariant: `total >= 1` and `completed <= total`. A zero denominator is
/// never surfaced to consumers; constructors and deserialization clamp
/// instead of trusting the producer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressTree {
    pub name: String,
    completed: u64,
    total: u64,
    pub children: Vec<ProgressTree>,
}

impl<'de> Deserialize<'de> for ProgressTree {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            completed: u64,
            total: u64,
            children: Vec<ProgressTree>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let total = raw.total.max(1);
        Ok(Self {
            name: raw.name,
            completed: raw.completed.min(total),
            total,
            children: raw.children,
        })
    }
}

impl ProgressTree {
    pub fn new(name: impl Into<String>, total: u64) -> Self {
        Self {
            name: name.into(),
            completed: 0,
            total: total.max(1),
            children: Vec::new(),
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Set completed steps, clamped into `0..=total`.
    pub fn set_completed(&mut self, completed: u64) {
        self.completed = completed.min(self.total);
    }

    pub fn push_child(&mut self, child: ProgressTree) {
        self.children.push(child);
    }

    /// Replace the child list with a single node (the "current sub-task"
    /// shape engines typically report).
    pub fn set_current_child(&mut self, child: ProgressTree) {
        self.children.clear();
        self.children.push(child);
    }

    /// Completion in `[0.0, 1.0]`. Leaves report their own ratio; interior
    /// nodes average their children so a deep tree still yields one number.
    pub fn fraction(&self) -> f64 {
        if self.children.is_empty() {
            self.completed as f64 / self.total as f64
        } else {
            let sum: f64 = self.children.iter().map(ProgressTree::fraction).sum();
            sum / self.children.len() as f64
        }
    }

    pub fn is_done(&self) -> bool {
        self.completed == self.total && self.children.iter().all(ProgressTree::is_done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: zero denominator never surfaced
    #[test]
    fn test_total_clamped_to_one() {
        let tree = ProgressTree::new("bake", 0);
        assert_eq!(tree.total(), 1);
        assert!(tree.fraction().is_finite());
    }

    /// Test: completed clamped to total
    #[test]
    fn test_completed_clamped() {
        let mut tree = ProgressTree::new("bake", 10);
        tree.set_completed(99);
        assert_eq!(tree.completed(), 10);
        assert!(tree.is_done());
    }

    /// Test: deserialized trees honor the same clamps as constructed ones
    #[test]
    fn test_deserialized_tree_clamped() {
        let json = r#"{"name":"bake","completed":5,"total":0,"children":[]}"#;
        let tree: ProgressTree = serde_json::from_str(json).unwrap();
        assert_eq!(tree.total(), 1);
        assert_eq!(tree.completed(), 1);
        assert!(tree.fraction().is_finite());
    }

    /// Test: structural equality drives redraw coalescing
    #[test]
    fn test_structural_equality() {
        let mut a = ProgressTree::new("bake", 5);
        a.set_current_child(ProgressTree::new("frame_00002", 4));
        let b = a.clone();
        assert_eq!(a, b);

        a.children[0].set_completed(1);
        assert_ne!(a, b);
    }

    /// Test: interior nodes average child fractions
    #[test]
    fn test_fraction_averages_children() {
        let mut root = ProgressTree::new("bake", 1);
        let mut done = ProgressTree::new("a", 2);
        done.set_completed(2);
        root.push_child(done);
        root.push_child(ProgressTree::new("b", 2));
        assert!((root.fraction() - 0.5).abs() < 1e-9);
    }
}

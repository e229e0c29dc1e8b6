//! Perimeter hierarchy as returned by the backend.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One perimeter in the hierarchy. Children are kept in backend order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationNode {
    pub id: i64,
    #[serde(alias = "nombre")]
    pub name: String,
    #[serde(default, alias = "nivel")]
    pub level: i32,
    #[serde(default, alias = "hijos")]
    pub children: Vec<DestinationNode>,
}

impl DestinationNode {
    pub fn new(id: i64, name: impl Into<String>, level: i32) -> Self {
        Self {
            id,
            name: name.into(),
            level,
            children: Vec::new(),
        }
    }

    /// Builder-style helper to attach a child.
    pub fn with_child(mut self, child: DestinationNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Index of the direct child with `id`.
    pub fn child_index(&self, id: i64) -> Option<usize> {
        self.children.iter().position(|c| c.id == id)
    }

    /// First id that appears more than once in this subtree, if any.
    fn duplicate_id(&self) -> Option<i64> {
        let mut seen = HashSet::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.id) {
                return Some(node.id);
            }
            stack.extend(node.children.iter());
        }
        None
    }
}

/// A loaded, read-only destination tree.
#[derive(Debug, Clone)]
pub struct DestinationTree {
    root: Arc<DestinationNode>,
}

impl DestinationTree {
    /// Wrap a root node. Fails if node ids are not unique.
    pub fn from_root(root: DestinationNode) -> Result<Self, i64> {
        match root.duplicate_id() {
            Some(dup) => Err(dup),
            None => Ok(Self {
                root: Arc::new(root),
            }),
        }
    }

    pub fn root(&self) -> &DestinationNode {
        &self.root
    }

    pub(crate) fn shared_root(&self) -> Arc<DestinationNode> {
        Arc::clone(&self.root)
    }
}

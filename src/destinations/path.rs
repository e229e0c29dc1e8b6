//! Browse path through a destination tree.

use std::sync::Arc;

use crate::error::NavigationError;

use super::model::{DestinationNode, DestinationTree};

/// Root-to-current sequence of nodes being browsed.
///
/// Stored as child indices below the root, so the path always starts at the
/// root and every step is a child of the previous one.
#[derive(Debug, Clone)]
pub struct NavigationPath {
    tree: Arc<DestinationNode>,
    indices: Vec<usize>,
}

impl NavigationPath {
    /// A path containing only the tree root.
    pub fn new(tree: &DestinationTree) -> Self {
        Self {
            tree: tree.shared_root(),
            indices: Vec::new(),
        }
    }

    /// The node at the end of the path.
    pub fn current(&self) -> &DestinationNode {
        self.indices
            .iter()
            .fold(&*self.tree, |node, &i| &node.children[i])
    }

    /// Number of nodes on the path, root included. Never zero.
    pub fn len(&self) -> usize {
        self.indices.len() + 1
    }

    pub fn is_at_root(&self) -> bool {
        self.indices.is_empty()
    }

    /// Nodes from root to current.
    pub fn nodes(&self) -> Vec<&DestinationNode> {
        let mut out = Vec::with_capacity(self.len());
        let mut node = &*self.tree;
        out.push(node);
        for &i in &self.indices {
            node = &node.children[i];
            out.push(node);
        }
        out
    }

    pub fn breadcrumbs(&self) -> Vec<&str> {
        self.nodes().into_iter().map(|n| n.name.as_str()).collect()
    }

    /// Step into the child of the current node with `child_id`.
    pub fn descend(&mut self, child_id: i64) -> Result<&DestinationNode, NavigationError> {
        let current = self.current();
        let index = current
            .child_index(child_id)
            .ok_or(NavigationError::NotAChild {
                parent: current.id,
                child: child_id,
            })?;
        self.indices.push(index);
        Ok(self.current())
    }

    /// Drop the last node. Rejected at the root.
    pub fn ascend(&mut self) -> Result<&DestinationNode, NavigationError> {
        if self.indices.pop().is_none() {
            return Err(NavigationError::AtRoot);
        }
        Ok(self.current())
    }
}

impl PartialEq for NavigationPath {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.indices == other.indices
    }
}

impl Eq for NavigationPath {}

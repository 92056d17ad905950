//! Per-run execution tree.

use super::block::{BlockAction, BlockEntry, BlockId, BlockRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// One block as it takes part in a run.
pub(crate) struct RunNode {
    pub(crate) id: BlockId,
    pub(crate) ordering: i64,
    pub(crate) name: Option<String>,
    pub(crate) action: Arc<dyn BlockAction>,
}

impl RunNode {
    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("block {}", self.id),
        }
    }
}

/// Blocks of one run grouped under their parents.
///
/// The `None` key is the synthetic root holding blocks without a parent.
/// Built from the pending set plus every chain member and ancestor reachable
/// from it; each block appears exactly once.
pub struct RunTree {
    levels: HashMap<Option<BlockId>, Vec<RunNode>>,
    len: usize,
}

impl RunTree {
    /// Build the tree for `pending` from the registry's current state.
    pub fn build(registry: &BlockRegistry, pending: impl IntoIterator<Item = BlockId>) -> Self {
        registry.with_entries(|entries| Self::from_entries(entries, pending))
    }

    fn from_entries(entries: &[BlockEntry], pending: impl IntoIterator<Item = BlockId>) -> Self {
        let mut levels: HashMap<Option<BlockId>, Vec<RunNode>> = HashMap::new();
        levels.insert(None, Vec::new());

        let mut visited = HashSet::new();
        let mut stack: Vec<BlockId> = pending.into_iter().collect();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(entry) = entries.get(id.sequence() as usize) else {
                warn!(block = %id, "Skipping unregistered block handle");
                continue;
            };

            stack.extend(entry.chain.iter().copied());
            if let Some(parent) = entry.parent {
                stack.push(parent);
            }

            levels.entry(entry.parent).or_default().push(RunNode {
                id: entry.id,
                ordering: entry.ordering,
                name: entry.name.clone(),
                action: entry.action.clone(),
            });
        }

        for children in levels.values_mut() {
            children.sort_by_key(|node| (node.ordering, node.id));
        }

        let len = levels.values().map(Vec::len).sum();
        Self { levels, len }
    }

    /// Children of `parent` in execution order (`None` for top level).
    pub(crate) fn children(&self, parent: Option<BlockId>) -> &[RunNode] {
        self.levels.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Handles of the children of `parent`, in execution order.
    pub fn child_ids(&self, parent: Option<BlockId>) -> Vec<BlockId> {
        self.children(parent).iter().map(|node| node.id).collect()
    }

    /// Depth-first order in which a fully successful run executes the tree.
    pub fn execution_order(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.len);
        self.walk(None, &mut order);
        order
    }

    fn walk(&self, parent: Option<BlockId>, order: &mut Vec<BlockId>) {
        for node in self.children(parent) {
            order.push(node.id);
            self.walk(Some(node.id), order);
        }
    }

    /// Whether `block` takes part in this run.
    pub fn contains(&self, block: BlockId) -> bool {
        self.levels
            .values()
            .any(|children| children.iter().any(|node| node.id == block))
    }

    /// Display label for `block` (its name, or its handle).
    pub fn label(&self, block: BlockId) -> String {
        self.levels
            .values()
            .flatten()
            .find(|node| node.id == block)
            .map(RunNode::label)
            .unwrap_or_else(|| format!("block {}", block))
    }

    /// Number of blocks in the run.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the run has nothing to execute.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

//! Blocks and the block registry.

use super::context::CommandContext;
use crate::error::{SchedulerError, SchedulerResult, SerialResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Ordering assigned to blocks registered without one.
pub const DEFAULT_ORDERING: i64 = 0;

/// Opaque handle to a registered block.
///
/// Handles are issued in registration order, so comparing two handles from the
/// same registry compares their registration sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u64);

impl BlockId {
    /// Registration sequence number (monotonic per registry).
    pub fn sequence(self) -> u64 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Command logic executed when its block is part of a run.
///
/// The action may call [`CommandContext::continue_to_children`] to run its
/// descendants at a chosen point; otherwise they run right after it returns.
#[async_trait]
pub trait BlockAction: Send + Sync {
    /// Execute this block's exchange with the instrument.
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> SerialResult<()>;
}

/// Adapter turning a closure into a [`BlockAction`]. Built with [`action_fn`].
pub struct FnAction<F>(F);

/// Wrap a closure as a block action.
///
/// ```rust,ignore
/// let id = scheduler.add_block(BlockSpec::new(action_fn(|ctx| {
///     Box::pin(async move {
///         ctx.write_line("*RST").await?;
///         ctx.continue_to_children().await
///     })
/// })))?;
/// ```
pub fn action_fn<F>(f: F) -> FnAction<F>
where
    F: for<'a, 'c> Fn(&'a mut CommandContext<'c>) -> BoxFuture<'a, SerialResult<()>> + Send + Sync,
{
    FnAction(f)
}

#[async_trait]
impl<F> BlockAction for FnAction<F>
where
    F: for<'a, 'c> Fn(&'a mut CommandContext<'c>) -> BoxFuture<'a, SerialResult<()>> + Send + Sync,
{
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> SerialResult<()> {
        (self.0)(ctx).await
    }
}

/// Everything needed to register one block.
pub struct BlockSpec {
    action: Arc<dyn BlockAction>,
    ordering: Option<i64>,
    parent: Option<BlockId>,
    chain: Vec<BlockId>,
    name: Option<String>,
    prefix: Vec<String>,
}

impl BlockSpec {
    /// Spec for `action` with no parent, no chain and the default ordering.
    pub fn new(action: impl BlockAction + 'static) -> Self {
        Self::from_arc(Arc::new(action))
    }

    /// Spec for an action that is shared with other owners.
    pub fn from_arc(action: Arc<dyn BlockAction>) -> Self {
        Self {
            action,
            ordering: None,
            parent: None,
            chain: Vec::new(),
            name: None,
            prefix: Vec::new(),
        }
    }

    /// Sibling position; lower runs first.
    pub fn ordering(mut self, ordering: i64) -> Self {
        self.ordering = Some(ordering);
        self
    }

    /// Block whose context this block runs inside.
    pub fn parent(mut self, parent: BlockId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Blocks pulled into every run that includes this one.
    pub fn chain(mut self, chain: impl IntoIterator<Item = BlockId>) -> Self {
        self.chain.extend(chain);
        self
    }

    /// Display name, used in logs and errors.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name segments joined before the name with `_`.
    pub fn prefix<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix = segments.into_iter().map(Into::into).collect();
        self
    }

    /// Parent set on this spec, if any.
    pub fn parent_block(&self) -> Option<BlockId> {
        self.parent
    }

    /// Prefix and name joined with `_`; `None` without a name.
    pub fn display_name(&self) -> Option<String> {
        let name = self.name.as_ref()?;
        let mut segments: Vec<&str> = self.prefix.iter().map(String::as_str).collect();
        segments.push(name);
        Some(segments.join("_"))
    }
}

impl fmt::Debug for BlockSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockSpec")
            .field("name", &self.display_name())
            .field("ordering", &self.ordering)
            .field("parent", &self.parent)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

pub(crate) struct BlockEntry {
    pub(crate) id: BlockId,
    pub(crate) name: Option<String>,
    pub(crate) ordering: i64,
    pub(crate) parent: Option<BlockId>,
    pub(crate) chain: Vec<BlockId>,
    pub(crate) action: Arc<dyn BlockAction>,
}

/// Stores every registered block and its static relationships.
///
/// Blocks are never removed. A parent must be registered before its
/// children, so parent links always point backwards and cannot form cycles.
#[derive(Default)]
pub struct BlockRegistry {
    blocks: RwLock<Vec<BlockEntry>>,
}

impl fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("blocks", &self.len())
            .finish()
    }
}

impl BlockRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block and return its handle.
    ///
    /// Fails if the parent or any chain member is not registered.
    pub fn add_block(&self, spec: BlockSpec) -> SchedulerResult<BlockId> {
        let mut blocks = self.blocks.write();

        if let Some(parent) = spec.parent {
            if parent.index() >= blocks.len() {
                return Err(SchedulerError::UnknownParent(parent));
            }
        }
        if let Some(unknown) = spec.chain.iter().find(|member| member.index() >= blocks.len()) {
            return Err(SchedulerError::UnknownBlock(*unknown));
        }

        let id = BlockId(blocks.len() as u64);
        let name = spec.display_name();
        tracing::trace!(block = %id, name = ?name, parent = ?spec.parent, "Registered block");
        blocks.push(BlockEntry {
            id,
            name,
            ordering: spec.ordering.unwrap_or(DEFAULT_ORDERING),
            parent: spec.parent,
            chain: spec.chain,
            action: spec.action,
        });
        Ok(id)
    }

    /// Append blocks to an existing block's chain.
    pub fn extend_chain(&self, block: BlockId, more: &[BlockId]) -> SchedulerResult<()> {
        let mut blocks = self.blocks.write();
        let len = blocks.len();
        if let Some(unknown) = more.iter().find(|member| member.index() >= len) {
            return Err(SchedulerError::UnknownBlock(*unknown));
        }
        let entry = blocks
            .get_mut(block.index())
            .ok_or(SchedulerError::UnknownBlock(block))?;
        entry.chain.extend_from_slice(more);
        Ok(())
    }

    /// Whether `block` was issued by this registry.
    pub fn contains(&self, block: BlockId) -> bool {
        block.index() < self.blocks.read().len()
    }

    /// Number of registered blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display name of `block`.
    pub fn name(&self, block: BlockId) -> Option<String> {
        self.blocks.read().get(block.index())?.name.clone()
    }

    /// Parent of `block`.
    pub fn parent(&self, block: BlockId) -> Option<BlockId> {
        self.blocks.read().get(block.index())?.parent
    }

    /// Effective ordering of `block`.
    pub fn ordering(&self, block: BlockId) -> Option<i64> {
        self.blocks.read().get(block.index()).map(|entry| entry.ordering)
    }

    /// Current chain of `block`.
    pub fn chain(&self, block: BlockId) -> Option<Vec<BlockId>> {
        self.blocks.read().get(block.index()).map(|entry| entry.chain.clone())
    }

    /// Run `f` over the entries under one read lock.
    pub(crate) fn with_entries<R>(&self, f: impl FnOnce(&[BlockEntry]) -> R) -> R {
        f(&self.blocks.read())
    }
}

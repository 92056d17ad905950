//! Scoped views onto a scheduler.
//!
//! A device driver usually hangs all of its blocks below one root block (for
//! example an identity check). A [`SubScope`] lets the driver register and
//! queue blocks without repeating that parent on every call, and without
//! knowing whether it talks to the scheduler itself or to another scope.

use super::block::{BlockId, BlockSpec};
use super::error_channel::ErrorChannel;
use super::scheduler::RunSummary;
use crate::error::SchedulerResult;
use crate::observable::Observable;
use async_trait::async_trait;
use std::sync::Arc;

/// Anything blocks can be registered with and queued on.
///
/// Implemented by [`Scheduler`](super::Scheduler) and [`SubScope`].
#[async_trait]
pub trait BlockHost: Send + Sync {
    /// Register a block.
    fn add_block(&self, spec: BlockSpec) -> SchedulerResult<BlockId>;

    /// Append to an existing block's chain.
    fn extend_chain(&self, block: BlockId, more: &[BlockId]) -> SchedulerResult<()>;

    /// Queue a block for the next run.
    fn enqueue(&self, block: BlockId) -> SchedulerResult<()>;

    /// Drop the pending set.
    fn clear_pending(&self);

    /// Execute everything pending now.
    async fn run(&self) -> SchedulerResult<RunSummary>;

    /// Connection status.
    fn connected(&self) -> Observable<bool>;

    /// Run status.
    fn running(&self) -> Observable<bool>;

    /// Channel that blocks registered here report errors on.
    fn errors(&self) -> ErrorChannel;
}

/// A host that defaults the parent of new blocks to a local root.
///
/// Everything else is forwarded to the owner. Status observables are the
/// owner's; the error channel is the owner's unless one is given with
/// [`SubScope::with_errors`].
#[derive(Clone)]
pub struct SubScope {
    owner: Arc<dyn BlockHost>,
    local_root: BlockId,
    errors: Option<ErrorChannel>,
}

impl std::fmt::Debug for SubScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubScope")
            .field("local_root", &self.local_root)
            .field("own_errors", &self.errors.is_some())
            .finish_non_exhaustive()
    }
}

impl SubScope {
    /// Scope over `owner` rooted at `local_root`.
    pub fn new(owner: Arc<dyn BlockHost>, local_root: BlockId) -> Self {
        Self {
            owner,
            local_root,
            errors: None,
        }
    }

    /// Give this scope its own error channel.
    pub fn with_errors(mut self, errors: ErrorChannel) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Default parent of blocks registered through this scope.
    pub fn local_root(&self) -> BlockId {
        self.local_root
    }

    /// The wrapped host.
    pub fn owner(&self) -> &Arc<dyn BlockHost> {
        &self.owner
    }

    /// Nested scope over this one.
    pub fn scope(self: &Arc<Self>, local_root: BlockId) -> SubScope {
        SubScope::new(self.clone(), local_root)
    }
}

#[async_trait]
impl BlockHost for SubScope {
    fn add_block(&self, spec: BlockSpec) -> SchedulerResult<BlockId> {
        let spec = match spec.parent_block() {
            Some(_) => spec,
            None => spec.parent(self.local_root),
        };
        self.owner.add_block(spec)
    }

    fn extend_chain(&self, block: BlockId, more: &[BlockId]) -> SchedulerResult<()> {
        self.owner.extend_chain(block, more)
    }

    fn enqueue(&self, block: BlockId) -> SchedulerResult<()> {
        self.owner.enqueue(block)
    }

    fn clear_pending(&self) {
        self.owner.clear_pending();
    }

    async fn run(&self) -> SchedulerResult<RunSummary> {
        self.owner.run().await
    }

    fn connected(&self) -> Observable<bool> {
        self.owner.connected()
    }

    fn running(&self) -> Observable<bool> {
        self.owner.running()
    }

    fn errors(&self) -> ErrorChannel {
        match &self.errors {
            Some(errors) => errors.clone(),
            None => self.owner.errors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SchedulerError, SerialError};
    use crate::sequencer::{action_fn, Scheduler};

    fn noop() -> BlockSpec {
        BlockSpec::new(action_fn(|_ctx| Box::pin(async { Ok::<(), SerialError>(()) })))
    }

    #[test]
    fn missing_parent_defaults_to_local_root() {
        let scheduler = Arc::new(Scheduler::new());
        let root = scheduler.add_block(noop().name("root")).unwrap();
        let other = scheduler.add_block(noop()).unwrap();

        let scope = SubScope::new(scheduler.clone(), root);
        let defaulted = scope.add_block(noop()).unwrap();
        let explicit = scope.add_block(noop().parent(other)).unwrap();

        assert_eq!(scheduler.registry().parent(defaulted), Some(root));
        assert_eq!(scheduler.registry().parent(explicit), Some(other));
    }

    #[test]
    fn nested_scopes_use_the_innermost_root() {
        let scheduler = Arc::new(Scheduler::new());
        let device = scheduler.add_block(noop()).unwrap();
        let outer = Arc::new(SubScope::new(scheduler.clone(), device));
        let channel = outer.add_block(noop()).unwrap();

        let inner = outer.scope(channel);
        let setting = inner.add_block(noop()).unwrap();
        assert_eq!(scheduler.registry().parent(channel), Some(device));
        assert_eq!(scheduler.registry().parent(setting), Some(channel));
    }

    #[test]
    fn unknown_local_root_surfaces_on_registration() {
        let scheduler = Arc::new(Scheduler::new());
        let elsewhere = Scheduler::new();
        elsewhere.add_block(noop()).unwrap();
        let foreign = elsewhere.add_block(noop()).unwrap();

        let scope = SubScope::new(scheduler, foreign);
        assert!(matches!(
            scope.add_block(noop()),
            Err(SchedulerError::UnknownParent(id)) if id == foreign
        ));
    }

    #[test]
    fn own_error_channel_overrides_owner() {
        let scheduler = Arc::new(Scheduler::new());
        let root = scheduler.add_block(noop()).unwrap();

        let shared = SubScope::new(scheduler.clone(), root);
        shared.errors().report(2, "timeout");
        assert!(scheduler.errors().current().is_some());

        let own = ErrorChannel::new("IFR_error");
        let scoped = SubScope::new(scheduler.clone(), root).with_errors(own.clone());
        scoped.errors().report(1, "Wrong Device");
        assert_eq!(own.current().map(|r| r.code), Some(1));
        assert_eq!(scheduler.errors().current().map(|r| r.code), Some(2));
    }

    #[test]
    fn status_is_shared_with_owner() {
        let scheduler = Arc::new(Scheduler::new());
        let root = scheduler.add_block(noop()).unwrap();
        let scope = SubScope::new(scheduler.clone(), root);

        scheduler.connected().set(true);
        assert!(scope.connected().get());
        assert!(!scope.running().get());
    }
}

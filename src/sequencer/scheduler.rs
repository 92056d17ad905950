//! The scheduler: registry, pending set, transport and status in one place.
//!
//! # Example
//!
//! ```rust,ignore
//! let scheduler = Arc::new(Scheduler::new());
//! scheduler.spawn_debouncer();
//! scheduler.attach(ScriptedTransport::new().reply("*IDN?", ["IFR,2026"])).await;
//!
//! let idn = scheduler.add_block(BlockSpec::new(action_fn(|ctx| {
//!     Box::pin(async move {
//!         let reply = ctx.query("*IDN?", Duration::from_millis(250)).await?;
//!         tracing::info!(%reply, "Identified");
//!         Ok(())
//!     })
//! })))?;
//! scheduler.enqueue(idn)?;
//! ```

use super::block::{BlockId, BlockRegistry, BlockSpec};
use super::context::run_level;
use super::error_channel::ErrorChannel;
use super::pending::{DebounceWorker, PendingQueue};
use super::sub_scope::BlockHost;
use super::tree::RunTree;
use crate::config::DebounceSettings;
use crate::error::{SchedulerError, SchedulerResult};
use crate::observable::Observable;
use crate::serial::{DynTransport, LineTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Blocks executed, in execution order.
    pub executed: Vec<BlockId>,
    /// Wall-clock duration of the walk.
    pub elapsed: Duration,
}

impl RunSummary {
    /// True when the run had nothing to do.
    pub fn is_empty(&self) -> bool {
        self.executed.is_empty()
    }
}

/// Drives one serial connection.
///
/// Owns the block registry, the pending set and the transport. Runs are
/// serialized by the transport lock: only one walk is ever in flight.
pub struct Scheduler {
    registry: BlockRegistry,
    pending: PendingQueue,
    link: AsyncMutex<Option<DynTransport>>,
    connected: Observable<bool>,
    running: Observable<bool>,
    errors: ErrorChannel,
    settings: DebounceSettings,
    debouncer: Mutex<Option<DebounceWorker>>,
    /// Attach or detach requested while a walk held the transport.
    deferred: Mutex<Option<LinkChange>>,
}

enum LinkChange {
    Attach(DynTransport),
    Detach,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("blocks", &self.registry.len())
            .field("pending", &self.pending.len())
            .field("connected", &self.connected.get())
            .field("running", &self.running.get())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds `running` at true; resets it on every exit path.
struct RunningGuard<'a> {
    flag: &'a Observable<bool>,
}

impl<'a> RunningGuard<'a> {
    fn engage(flag: &'a Observable<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl Scheduler {
    /// Disconnected scheduler with the default debounce window.
    pub fn new() -> Self {
        Self::with_settings(DebounceSettings::default())
    }

    /// Disconnected scheduler with a custom debounce window.
    pub fn with_settings(settings: DebounceSettings) -> Self {
        Self {
            registry: BlockRegistry::new(),
            pending: PendingQueue::new(),
            link: AsyncMutex::new(None),
            connected: Observable::new("connected", false),
            running: Observable::new("running", false),
            errors: ErrorChannel::new("error"),
            settings,
            debouncer: Mutex::new(None),
            deferred: Mutex::new(None),
        }
    }

    /// Debounce window used by [`Scheduler::spawn_debouncer`].
    pub fn settings(&self) -> DebounceSettings {
        self.settings
    }

    /// Register a block. See [`BlockRegistry::add_block`].
    pub fn add_block(&self, spec: BlockSpec) -> SchedulerResult<BlockId> {
        self.registry.add_block(spec)
    }

    /// Append to a block's chain. See [`BlockRegistry::extend_chain`].
    pub fn extend_chain(&self, block: BlockId, more: &[BlockId]) -> SchedulerResult<()> {
        self.registry.extend_chain(block, more)
    }

    /// Queue `block` for the next run.
    ///
    /// Never blocks on the transport, so it may be called from inside a block
    /// action; such blocks run in the following run.
    pub fn enqueue(&self, block: BlockId) -> SchedulerResult<()> {
        if !self.registry.contains(block) {
            return Err(SchedulerError::UnknownBlock(block));
        }
        if self.pending.insert(block) {
            debug!(block = %block, "Queued block");
        }
        Ok(())
    }

    /// Drop the pending set without executing it.
    pub fn clear_pending(&self) {
        self.pending.clear();
    }

    /// The pending set.
    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    /// The block registry.
    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    /// Connect a transport, replacing any previous one.
    ///
    /// Blocks queued while disconnected are scheduled immediately. Called
    /// while a run is walking the tree (from a block action or another task),
    /// the swap is deferred until the walk ends; the rest of that walk keeps
    /// the current transport.
    pub async fn attach<T>(&self, transport: T)
    where
        T: LineTransport + 'static,
    {
        self.attach_boxed(Box::new(transport)).await;
    }

    /// [`Scheduler::attach`] for an already boxed transport.
    pub async fn attach_boxed(&self, transport: DynTransport) {
        match self.link.try_lock() {
            Ok(mut link) => self.install(&mut link, transport),
            Err(_) if self.running.get() => {
                debug!(transport = %transport.describe(), "Run in flight; attach deferred");
                *self.deferred.lock() = Some(LinkChange::Attach(transport));
            }
            Err(_) => {
                let mut link = self.link.lock().await;
                self.install(&mut link, transport);
            }
        }
    }

    /// Disconnect the transport and drop the pending set.
    ///
    /// Returns the detached transport. Called while a run is walking the tree,
    /// the disconnect happens when the walk ends, the transport is dropped
    /// then and `None` is returned.
    pub async fn detach(&self) -> Option<DynTransport> {
        match self.link.try_lock() {
            Ok(mut link) => self.remove(&mut link),
            Err(_) if self.running.get() => {
                debug!("Run in flight; detach deferred");
                *self.deferred.lock() = Some(LinkChange::Detach);
                None
            }
            Err(_) => {
                let mut link = self.link.lock().await;
                self.remove(&mut link)
            }
        }
    }

    fn install(&self, link: &mut Option<DynTransport>, transport: DynTransport) {
        info!(transport = %transport.describe(), "Transport attached");
        *link = Some(transport);
        self.connected.set(true);
        if !self.pending.is_empty() {
            self.pending.notify();
        }
    }

    fn remove(&self, link: &mut Option<DynTransport>) -> Option<DynTransport> {
        let transport = link.take();
        self.pending.clear();
        self.connected.set(false);
        if let Some(transport) = &transport {
            info!(transport = %transport.describe(), "Transport detached");
        }
        transport
    }

    /// Apply the latest attach or detach requested during a walk.
    fn apply_deferred(&self, link: &mut Option<DynTransport>) {
        let change = self.deferred.lock().take();
        match change {
            Some(LinkChange::Attach(transport)) => self.install(link, transport),
            Some(LinkChange::Detach) => drop(self.remove(link)),
            None => {}
        }
    }

    /// Whether a transport is attached.
    pub fn connected(&self) -> &Observable<bool> {
        &self.connected
    }

    /// Whether a run is in flight.
    pub fn running(&self) -> &Observable<bool> {
        &self.running
    }

    /// Error-report channel of this connection.
    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Execute everything pending now.
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] if another run holds the
    /// transport (including a call from inside a block action) and with
    /// [`SchedulerError::NotConnected`] if nothing is attached; in both cases
    /// the pending set is left untouched. An empty pending set returns an
    /// empty [`RunSummary`] without toggling `running`. The first error raised
    /// by a block action aborts the rest of the run. Attach or detach requests
    /// made during the walk are applied once it ends.
    pub async fn run(&self) -> SchedulerResult<RunSummary> {
        let mut link = self
            .link
            .try_lock()
            .map_err(|_| SchedulerError::AlreadyRunning)?;
        // Left over from a walk that unwound.
        self.apply_deferred(&mut link);
        let transport = link.as_mut().ok_or(SchedulerError::NotConnected)?;

        let pending = self.pending.take();
        if pending.is_empty() {
            return Ok(RunSummary::default());
        }

        let running = RunningGuard::engage(&self.running);
        let tree = RunTree::build(&self.registry, pending);
        info!(
            blocks = tree.len(),
            transport = %transport.describe(),
            "Starting run"
        );

        let started = Instant::now();
        let mut executed = Vec::with_capacity(tree.len());
        let result = run_level(transport, &tree, &self.errors, &mut executed, None).await;
        let elapsed = started.elapsed();
        drop(running);
        self.apply_deferred(&mut link);

        match result {
            Ok(()) => {
                info!(
                    executed = executed.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Run finished"
                );
                Ok(RunSummary { executed, elapsed })
            }
            Err(failure) => {
                let block = tree.label(failure.origin);
                warn!(
                    block = %block,
                    error = %failure.error,
                    executed = executed.len(),
                    skipped = tree.len() - executed.len(),
                    "Run aborted"
                );
                Err(SchedulerError::Block {
                    block,
                    source: failure.error,
                })
            }
        }
    }

    /// Start the background debounce worker, replacing any previous one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_debouncer(self: &Arc<Self>) {
        let worker = DebounceWorker::spawn(
            Arc::downgrade(self),
            self.pending.wakeup(),
            self.settings,
        );
        if let Some(previous) = self.debouncer.lock().replace(worker) {
            previous.shutdown();
        }
        // Blocks queued before the worker existed.
        if !self.pending.is_empty() {
            self.pending.notify();
        }
    }

    /// Stop the background debounce worker, if any.
    pub fn stop_debouncer(&self) {
        if let Some(worker) = self.debouncer.lock().take() {
            worker.shutdown();
        }
    }

    /// Whether a debounce worker is alive.
    pub fn debouncer_active(&self) -> bool {
        self.debouncer
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }
}

#[async_trait]
impl BlockHost for Scheduler {
    fn add_block(&self, spec: BlockSpec) -> SchedulerResult<BlockId> {
        Scheduler::add_block(self, spec)
    }

    fn extend_chain(&self, block: BlockId, more: &[BlockId]) -> SchedulerResult<()> {
        Scheduler::extend_chain(self, block, more)
    }

    fn enqueue(&self, block: BlockId) -> SchedulerResult<()> {
        Scheduler::enqueue(self, block)
    }

    fn clear_pending(&self) {
        Scheduler::clear_pending(self)
    }

    async fn run(&self) -> SchedulerResult<RunSummary> {
        Scheduler::run(self).await
    }

    fn connected(&self) -> Observable<bool> {
        self.connected.clone()
    }

    fn running(&self) -> Observable<bool> {
        self.running.clone()
    }

    fn errors(&self) -> ErrorChannel {
        self.errors.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SerialError;
    use crate::sequencer::action_fn;
    use crate::serial::ScriptedTransport;
    use tracing_test::traced_test;

    fn noop() -> BlockSpec {
        BlockSpec::new(action_fn(|_ctx| Box::pin(async { Ok::<(), SerialError>(()) })))
    }

    #[tokio::test]
    async fn run_without_transport_keeps_pending() {
        let scheduler = Scheduler::new();
        let id = scheduler.add_block(noop()).unwrap();
        scheduler.enqueue(id).unwrap();

        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotConnected));
        assert!(scheduler.pending().contains(id));
        assert!(!scheduler.running().get());
    }

    #[tokio::test]
    async fn empty_run_does_not_toggle_running() {
        let scheduler = Scheduler::new();
        scheduler.attach(ScriptedTransport::new()).await;
        let rx = scheduler.running().subscribe();

        let summary = scheduler.run().await.unwrap();
        assert!(summary.is_empty());
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_handles() {
        let scheduler = Scheduler::new();
        let other = Scheduler::new();
        other.add_block(noop()).unwrap();
        let foreign = other.add_block(noop()).unwrap();

        assert!(matches!(
            scheduler.enqueue(foreign),
            Err(SchedulerError::UnknownBlock(_))
        ));
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn detach_clears_pending_and_status() {
        let scheduler = Scheduler::new();
        scheduler.attach(ScriptedTransport::new()).await;
        assert!(scheduler.connected().get());

        let id = scheduler.add_block(noop()).unwrap();
        scheduler.enqueue(id).unwrap();

        let transport = scheduler.detach().await;
        assert!(transport.is_some());
        assert!(!scheduler.connected().get());
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn failure_is_attributed_to_the_raising_block() {
        let scheduler = Scheduler::new();
        scheduler.attach(ScriptedTransport::new()).await;

        let root = scheduler.add_block(noop().name("root")).unwrap();
        let child = scheduler
            .add_block(
                BlockSpec::new(action_fn(|_ctx| {
                    Box::pin(async { Err::<(), _>(SerialError::protocol("bad echo")) })
                }))
                .parent(root)
                .prefix(["IFR"])
                .name("id_check"),
            )
            .unwrap();
        scheduler.enqueue(child).unwrap();

        match scheduler.run().await {
            Err(SchedulerError::Block { block, source }) => {
                assert_eq!(block, "IFR_id_check");
                assert!(matches!(source, SerialError::Protocol(_)));
            }
            other => panic!("expected block failure, got {other:?}"),
        }
        assert!(!scheduler.running().get());
    }

    #[tokio::test]
    #[traced_test]
    async fn aborted_run_is_logged_with_the_block_name() {
        let scheduler = Scheduler::new();
        scheduler.attach(ScriptedTransport::new()).await;
        let id = scheduler
            .add_block(BlockSpec::new(action_fn(|ctx| {
                Box::pin(async move {
                    ctx.read_line(Duration::from_millis(10)).await?;
                    Ok(())
                })
            }))
            .name("readback"))
            .unwrap();
        scheduler.enqueue(id).unwrap();

        assert!(scheduler.run().await.is_err());
        assert!(logs_contain("Run aborted"));
        assert!(logs_contain("readback"));
    }
}

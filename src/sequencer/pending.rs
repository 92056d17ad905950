//! Pending set and debounced dispatch.
//!
//! Enqueueing only touches an in-memory set and pokes a [`Notify`]; the
//! [`DebounceWorker`] owns the timing. A burst of enqueues collapses into one
//! run once the link has been quiet for `coalesce`, and a steady stream still
//! fires no later than `max_latency` after the first enqueue of the burst.

use super::block::BlockId;
use super::scheduler::Scheduler;
use crate::config::DebounceSettings;
use crate::error::SchedulerError;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace, warn};

/// Blocks queued for the next run.
#[derive(Debug, Default)]
pub struct PendingQueue {
    blocks: Mutex<BTreeSet<BlockId>>,
    wakeup: Arc<Notify>,
}

impl PendingQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `block` and wake the debounce worker.
    ///
    /// Returns `false` if the block was already queued. The worker is woken
    /// either way so the coalescing window restarts.
    pub fn insert(&self, block: BlockId) -> bool {
        let inserted = self.blocks.lock().insert(block);
        self.wakeup.notify_one();
        inserted
    }

    /// Remove and return everything queued, in handle order.
    pub fn take(&self) -> Vec<BlockId> {
        std::mem::take(&mut *self.blocks.lock()).into_iter().collect()
    }

    /// Drop everything queued without running it.
    pub fn clear(&self) {
        let dropped = {
            let mut blocks = self.blocks.lock();
            let dropped = blocks.len();
            blocks.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "Cleared pending blocks");
        }
    }

    /// Whether `block` is queued.
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.lock().contains(&block)
    }

    /// Queued handles, in handle order.
    pub fn snapshot(&self) -> Vec<BlockId> {
        self.blocks.lock().iter().copied().collect()
    }

    /// Number of queued blocks.
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Wake the debounce worker without queueing anything.
    pub(crate) fn notify(&self) {
        self.wakeup.notify_one();
    }

    pub(crate) fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }
}

/// Background task that turns enqueue notifications into runs.
///
/// Holds only a weak reference to its scheduler. The task is aborted when the
/// handle is dropped or shut down.
#[derive(Debug)]
pub struct DebounceWorker {
    handle: JoinHandle<()>,
}

impl DebounceWorker {
    pub(crate) fn spawn(
        scheduler: Weak<Scheduler>,
        wakeup: Arc<Notify>,
        settings: DebounceSettings,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let coalesce = settings.coalesce();
            let max_latency = settings.max_latency();

            loop {
                wakeup.notified().await;
                let latest = Instant::now() + max_latency;

                loop {
                    let fire_at = (Instant::now() + coalesce).min(latest);
                    tokio::select! {
                        _ = sleep_until(fire_at) => break,
                        _ = wakeup.notified() => {
                            trace!("Debounce window restarted");
                        }
                    }
                }

                let Some(scheduler) = scheduler.upgrade() else {
                    debug!("Scheduler dropped; debounce worker exiting");
                    break;
                };
                dispatch(&scheduler).await;
            }
        });

        Self { handle }
    }

    /// Stop the worker. Queued blocks stay queued.
    pub fn shutdown(&self) {
        self.handle.abort();
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for DebounceWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One debounced run. A panicking block action is contained here so the
/// worker survives; the blocks of that run are not retried.
async fn dispatch(scheduler: &Scheduler) {
    if scheduler.pending().is_empty() {
        trace!("Debounce fired with nothing pending");
        return;
    }

    let outcome = match AssertUnwindSafe(scheduler.run()).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            error!(
                panic = %panic_message(payload.as_ref()),
                "Block action panicked; run abandoned"
            );
            return;
        }
    };

    match outcome {
        Ok(_) => {}
        Err(SchedulerError::AlreadyRunning) => {
            warn!("Run already in flight; rescheduling pending blocks");
            scheduler.pending().notify();
        }
        Err(SchedulerError::NotConnected) => {
            warn!(
                pending = scheduler.pending().len(),
                "Transport detached; pending blocks kept until attach"
            );
        }
        // Already logged by the scheduler.
        Err(err) => debug!(error = %err, "Debounced run failed"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SerialResult;
    use crate::sequencer::{BlockRegistry, BlockSpec, CommandContext};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl crate::sequencer::BlockAction for Noop {
        async fn execute(&self, _ctx: &mut CommandContext<'_>) -> SerialResult<()> {
            Ok(())
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let registry = BlockRegistry::new();
        let a = registry.add_block(BlockSpec::new(Noop)).unwrap();
        let b = registry.add_block(BlockSpec::new(Noop)).unwrap();

        let queue = PendingQueue::new();
        assert!(queue.insert(b));
        assert!(queue.insert(a));
        assert!(!queue.insert(b));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.snapshot(), vec![a, b]);
        assert_eq!(queue.take(), vec![a, b]);
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let registry = BlockRegistry::new();
        let a = registry.add_block(BlockSpec::new(Noop)).unwrap();

        let queue = PendingQueue::new();
        queue.insert(a);
        assert!(queue.contains(a));
        queue.clear();
        assert!(!queue.contains(a));
        assert!(queue.take().is_empty());
    }

    #[tokio::test]
    async fn insert_leaves_a_wakeup_permit() {
        let registry = BlockRegistry::new();
        let a = registry.add_block(BlockSpec::new(Noop)).unwrap();

        let queue = PendingQueue::new();
        let wakeup = queue.wakeup();
        queue.insert(a);

        tokio::time::timeout(std::time::Duration::from_millis(50), wakeup.notified())
            .await
            .expect("insert should wake the worker");
    }
}

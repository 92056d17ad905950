//! Per-block command context and the depth-first walk.
//!
//! Every block invocation gets its own [`CommandContext`]. The context borrows
//! the transport for the duration of that invocation and carries the
//! continuation for exactly one block: the one whose action is executing. A
//! nested action receives a fresh context, so the enclosing block's binding is
//! untouched and is back in effect as soon as the nested action returns.

use super::block::BlockId;
use super::error_channel::ErrorChannel;
use super::tree::{RunNode, RunTree};
use crate::error::{SerialError, SerialResult};
use crate::serial::DynTransport;
use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;
use tracing::{debug, debug_span, Instrument};

/// Failure escaping a subtree: the error and the block it is attributed to.
pub(crate) struct BlockFailure {
    pub(crate) origin: BlockId,
    pub(crate) error: SerialError,
}

enum Children {
    Pending,
    Done,
    /// A descendant failed; its rendered error identifies a propagated copy.
    Failed { origin: BlockId, message: String },
}

/// Facade handed to a block action while it executes.
pub struct CommandContext<'c> {
    link: &'c mut DynTransport,
    tree: &'c RunTree,
    errors: &'c ErrorChannel,
    executed: &'c mut Vec<BlockId>,
    node: &'c RunNode,
    children: Children,
}

impl<'c> CommandContext<'c> {
    /// Send one line to the instrument.
    pub async fn write_line(&mut self, line: &str) -> SerialResult<()> {
        self.link.write_line(line).await
    }

    /// Wait up to `timeout` for one response line.
    pub async fn read_line(&mut self, timeout: Duration) -> SerialResult<String> {
        self.link.read_line(timeout).await
    }

    /// Read one line using the transport's default timeout.
    pub async fn read_line_default(&mut self) -> SerialResult<String> {
        let timeout = self.link.default_timeout();
        self.link.read_line(timeout).await
    }

    /// Write `line`, then read one response line within `timeout`.
    pub async fn query(&mut self, line: &str, timeout: Duration) -> SerialResult<String> {
        self.link.write_line(line).await?;
        self.link.read_line(timeout).await
    }

    /// Run this block's descendants now.
    ///
    /// Only the first call has an effect; descendants execute once per run.
    /// If the action never calls this, the scheduler calls it after the action
    /// returns. A descendant's error is returned here so the action can report
    /// it or propagate it.
    pub async fn continue_to_children(&mut self) -> SerialResult<()> {
        if !matches!(self.children, Children::Pending) {
            return Ok(());
        }
        self.children = Children::Done;

        let result = run_level(
            &mut *self.link,
            self.tree,
            self.errors,
            &mut *self.executed,
            Some(self.node.id),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(failure) => {
                self.children = Children::Failed {
                    origin: failure.origin,
                    message: failure.error.to_string(),
                };
                Err(failure.error)
            }
        }
    }

    /// Handle of the executing block.
    pub fn block(&self) -> BlockId {
        self.node.id
    }

    /// Display name of the executing block.
    pub fn block_name(&self) -> Option<&str> {
        self.node.name.as_deref()
    }

    /// Error-report channel of the connection.
    pub fn errors(&self) -> &ErrorChannel {
        self.errors
    }

    /// Blocks executed so far in this run, in order.
    pub fn executed(&self) -> &[BlockId] {
        self.executed.as_slice()
    }

    /// Block to blame for `error` escaping this invocation.
    ///
    /// The descendant only when the action passed its error through; an
    /// action that replaced it with its own error owns the failure.
    fn origin_of(&self, error: &SerialError) -> BlockId {
        match &self.children {
            Children::Failed { origin, message } if *message == error.to_string() => *origin,
            _ => self.node.id,
        }
    }
}

/// Execute the children of `parent` in order, each followed by its subtree.
///
/// Stops at the first error; later siblings and unvisited subtrees are skipped.
pub(crate) fn run_level<'a>(
    link: &'a mut DynTransport,
    tree: &'a RunTree,
    errors: &'a ErrorChannel,
    executed: &'a mut Vec<BlockId>,
    parent: Option<BlockId>,
) -> BoxFuture<'a, Result<(), BlockFailure>> {
    async move {
        for node in tree.children(parent) {
            executed.push(node.id);

            let mut ctx = CommandContext {
                link: &mut *link,
                tree,
                errors,
                executed: &mut *executed,
                node,
                children: Children::Pending,
            };

            let span = debug_span!("block", id = %node.id, name = %node.label());
            let result = async {
                debug!("Executing block");
                node.action.execute(&mut ctx).await?;
                ctx.continue_to_children().await
            }
            .instrument(span)
            .await;

            if let Err(error) = result {
                let origin = ctx.origin_of(&error);
                return Err(BlockFailure { origin, error });
            }
        }
        Ok(())
    }
    .boxed()
}

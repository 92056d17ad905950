//! Hierarchical command scheduling over one serial link.
//!
//! Device drivers describe their exchanges with an instrument as *blocks*.
//! Each block has an action, an optional parent whose context it runs inside,
//! an ordering among its siblings and an optional chain of blocks that must
//! run with it. Enqueueing a block schedules it for the next run; a run
//! executes the queued blocks together with all of their ancestors and chain
//! members, depth first, each block exactly once.
//!
//! ```text
//!  enqueue ──► PendingQueue ──► DebounceWorker ──► Scheduler::run
//!                                                      │
//!                               RunTree::build ◄───────┘
//!                                     │
//!                          run_level (depth first, one CommandContext per block)
//! ```
//!
//! - [`BlockRegistry`] stores blocks and their static relationships.
//! - [`PendingQueue`] and [`DebounceWorker`] coalesce enqueue bursts.
//! - [`Scheduler`] owns the transport and executes runs.
//! - [`CommandContext`] is what a [`BlockAction`] sees while it executes.
//! - [`SubScope`] registers blocks below a local root through a [`BlockHost`].

mod block;
mod context;
mod error_channel;
mod pending;
mod scheduler;
mod sub_scope;
mod tree;

pub use block::{action_fn, BlockAction, BlockId, BlockRegistry, BlockSpec, FnAction, DEFAULT_ORDERING};
pub use context::CommandContext;
pub use error_channel::{ErrorAttempt, ErrorChannel, ErrorReport};
pub use pending::{DebounceWorker, PendingQueue};
pub use scheduler::{RunSummary, Scheduler};
pub use sub_scope::{BlockHost, SubScope};
pub use tree::RunTree;

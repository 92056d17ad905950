//! # DAQ Sequencer
//!
//! Hierarchical command scheduling for line-oriented serial instruments.
//!
//! Instrument drivers register *blocks* (units of command logic) with a
//! [`Scheduler`](sequencer::Scheduler). Blocks form a tree: a block runs inside
//! the context established by its parent, so queueing a channel setting
//! automatically re-runs the identity check and channel selection above it.
//! Bursts of changes are debounced into one physical run over the link.
//!
//! ## Crate Structure
//!
//! - **`sequencer`**: Block registry, pending queue with debounce, the
//!   scheduler and its depth-first walk, `CommandContext`, `SubScope`.
//! - **`serial`**: The `LineTransport` trait, a transport over any async
//!   serial port, and a scripted in-memory transport.
//! - **`blocks`**: Device-independent blocks such as `CommandResponse`.
//! - **`observable`**: Watch-based status values (`connected`, `running`).
//! - **`config`**: Figment-based configuration (`SequencerConfig`).
//! - **`error`**: `SerialError` (inside block actions) and `SchedulerError`.
//! - **`tracing_setup`**: Subscriber initialization.

pub mod blocks;
pub mod config;
pub mod error;
pub mod observable;
pub mod sequencer;
pub mod serial;
pub mod tracing_setup;

pub use error::{SchedulerError, SchedulerResult, SerialError, SerialResult};
pub use sequencer::{BlockHost, BlockId, BlockSpec, CommandContext, Scheduler, SubScope};

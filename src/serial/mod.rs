//! Line-oriented transports
//!
//! The scheduler talks to instruments exclusively through [`LineTransport`]:
//! one line out, one line in, each read bounded by its own timeout. Two
//! implementations are provided:
//!
//! - [`SerialLineTransport`]: any `AsyncRead + AsyncWrite` port (a real
//!   `tokio_serial::SerialStream`, a `tokio::io::DuplexStream`, ...) wrapped in a
//!   shared buffered reader.
//! - [`ScriptedTransport`]: in-memory device simulation with scripted replies
//!   and a transcript, for tests and dry runs.

mod port;
mod scripted;

pub use port::{wrap_shared, DynSerial, SerialLineTransport, SerialPortIO, SharedPort};
pub use scripted::{Exchange, ScriptedTransport, Transcript};

use crate::error::SerialResult;
use async_trait::async_trait;
use std::time::Duration;

/// Default bound for a single read when the caller does not choose one.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// A transport that exchanges whole lines with one instrument.
///
/// Implementations must not retry or reconnect on their own; those decisions
/// belong to the block actions that drive the transport.
#[async_trait]
pub trait LineTransport: Send {
    /// Send one line. The implementation appends its own terminator.
    async fn write_line(&mut self, line: &str) -> SerialResult<()>;

    /// Wait up to `timeout` for one line, returned without its terminator.
    ///
    /// Fails with `SerialError::Timeout` if nothing arrives in time.
    async fn read_line(&mut self, timeout: Duration) -> SerialResult<String>;

    /// Read bound used by `CommandContext::read_line_default`.
    fn default_timeout(&self) -> Duration {
        DEFAULT_READ_TIMEOUT
    }

    /// Human-readable description for logs.
    fn describe(&self) -> String {
        "line transport".to_string()
    }
}

/// Type-erased transport owned by a scheduler.
pub type DynTransport = Box<dyn LineTransport>;

//! Error types for the serial block scheduler.
//!
//! Two enums cover the crate, both built with `thiserror`:
//!
//! - **`SerialError`**: raised from inside block actions while talking to the
//!   instrument. `Timeout` is a recoverable sub-kind of transport failure
//!   (`is_transport()` is true for it), `Protocol` means the device answered but
//!   the content failed validation (identity mismatch, channel echo, ...).
//! - **`SchedulerError`**: returned by the registry, the pending queue and
//!   `Scheduler::run`. An action failure that escapes the block tree is wrapped
//!   in `SchedulerError::Block` together with the name of the failing block.
//!
//! The scheduler never classifies or retries errors; it only propagates them and
//! aborts the rest of the current run.

use crate::sequencer::BlockId;
use std::time::Duration;
use thiserror::Error;

/// Result alias for transport and block-action operations.
pub type SerialResult<T> = std::result::Result<T, SerialError>;

/// Result alias for registry and scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Failure while exchanging lines with an instrument.
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial transport error: {0}")]
    Transport(String),

    #[error("Serial read timeout after {0:?}")]
    Timeout(Duration),

    #[error("Serial link closed by peer")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SerialError {
    /// Build a protocol error from a validation message.
    pub fn protocol(message: impl Into<String>) -> Self {
        SerialError::Protocol(message.into())
    }

    /// Build a generic transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        SerialError::Transport(message.into())
    }

    /// True when no response arrived within the read bound.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SerialError::Timeout(_))
    }

    /// True for every failure of the link itself, timeouts included.
    pub fn is_transport(&self) -> bool {
        !matches!(self, SerialError::Protocol(_))
    }
}

/// Failure of a registry, queue or run operation.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Unknown block handle {0}")]
    UnknownBlock(BlockId),

    #[error("Parent block {0} is not registered")]
    UnknownParent(BlockId),

    #[error("A run is already in flight on this transport")]
    AlreadyRunning,

    #[error("No transport attached")]
    NotConnected,

    #[error("Block '{0}' has not been registered with a scheduler")]
    NotRegistered(String),

    #[error("Block '{block}' failed: {source}")]
    Block {
        block: String,
        #[source]
        source: SerialError,
    },
}

impl SchedulerError {
    /// The action error behind a failed run, if any.
    pub fn block_error(&self) -> Option<&SerialError> {
        match self {
            SchedulerError::Block { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_a_transport_failure() {
        let err = SerialError::Timeout(Duration::from_millis(250));
        assert!(err.is_timeout());
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "Serial read timeout after 250ms");
    }

    #[test]
    fn protocol_errors_are_not_transport_failures() {
        let err = SerialError::protocol("Wrong Device");
        assert!(!err.is_transport());
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "Protocol error: Wrong Device");
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn fails() -> SerialResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "cable pulled"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err, SerialError::Io(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn block_failure_exposes_source() {
        let err = SchedulerError::Block {
            block: "IFR_id_check".into(),
            source: SerialError::protocol("Wrong Device"),
        };
        assert_eq!(
            err.to_string(),
            "Block 'IFR_id_check' failed: Protocol error: Wrong Device"
        );
        assert!(matches!(err.block_error(), Some(SerialError::Protocol(_))));
        assert!(SchedulerError::AlreadyRunning.block_error().is_none());
    }
}

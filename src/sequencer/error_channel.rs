//! Per-connection error reporting.
//!
//! Block actions surface failures to the status layer through an
//! [`ErrorChannel`] instead of (or in addition to) returning them. Several
//! blocks often share one channel; each claims it for the duration of its own
//! attempt with [`ErrorChannel::attempt`], so a stale report left by an
//! earlier block is cleared once a later attempt completes without reporting.
//!
//! ```rust,ignore
//! async fn execute(&self, ctx: &mut CommandContext<'_>) -> SerialResult<()> {
//!     let _attempt = ctx.errors().attempt();
//!     if let Err(err) = ctx.continue_to_children().await {
//!         ctx.errors().report(1, err.to_string());
//!     }
//!     Ok(())
//! }
//! ```

use crate::observable::Observable;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// One published failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Numeric code chosen by the reporting block.
    pub code: u32,
    /// Human-readable description.
    pub message: String,
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Observable error slot shared by the blocks of one connection.
#[derive(Debug, Clone)]
pub struct ErrorChannel {
    current: Observable<Option<ErrorReport>>,
    reports: Arc<AtomicU64>,
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new("error")
    }
}

impl ErrorChannel {
    /// Empty channel published under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            current: Observable::new(name, None),
            reports: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a failure, replacing any previous report.
    pub fn report(&self, code: u32, message: impl Into<String>) {
        let report = ErrorReport {
            code,
            message: message.into(),
        };
        warn!(channel = %self.current.name(), code, message = %report.message, "Error reported");
        self.reports.fetch_add(1, Ordering::SeqCst);
        self.current.set(Some(report));
    }

    /// Withdraw the current report.
    pub fn clear(&self) {
        self.current.set_if_changed(None);
    }

    /// The report currently published, if any.
    pub fn current(&self) -> Option<ErrorReport> {
        self.current.get()
    }

    /// Subscribe to report changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<ErrorReport>> {
        self.current.subscribe()
    }

    /// Claim the channel for one attempt.
    ///
    /// When the returned guard drops and nothing was reported since it was
    /// created, the channel is cleared.
    pub fn attempt(&self) -> ErrorAttempt {
        ErrorAttempt {
            channel: self.clone(),
            reports_at_start: self.reports.load(Ordering::SeqCst),
        }
    }
}

/// Guard returned by [`ErrorChannel::attempt`].
#[must_use = "the attempt ends when this guard is dropped"]
#[derive(Debug)]
pub struct ErrorAttempt {
    channel: ErrorChannel,
    reports_at_start: u64,
}

impl ErrorAttempt {
    /// Whether anything was reported since the attempt started.
    pub fn reported(&self) -> bool {
        self.channel.reports.load(Ordering::SeqCst) != self.reports_at_start
    }
}

impl Drop for ErrorAttempt {
    fn drop(&mut self) {
        if !self.reported() {
            self.channel.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_attempt_clears_stale_report() {
        let channel = ErrorChannel::new("IFR_error");
        channel.report(2, "no response");

        {
            let _attempt = channel.attempt();
            assert!(channel.current().is_some());
        }
        assert_eq!(channel.current(), None);
    }

    #[test]
    fn failed_attempt_keeps_its_report() {
        let channel = ErrorChannel::new("IFR_error");
        channel.report(2, "old");

        {
            let attempt = channel.attempt();
            channel.report(1, "Wrong Device");
            assert!(attempt.reported());
        }
        assert_eq!(
            channel.current(),
            Some(ErrorReport {
                code: 1,
                message: "Wrong Device".into()
            })
        );
    }

    #[test]
    fn nested_attempts_only_clear_when_quiet() {
        let channel = ErrorChannel::default();
        let outer = channel.attempt();
        {
            let _inner = channel.attempt();
            channel.report(3, "channel echo mismatch");
        }
        assert!(outer.reported());
        drop(outer);
        assert!(channel.current().is_some());
    }

    #[test]
    fn report_display() {
        let report = ErrorReport {
            code: 2,
            message: "timeout".into(),
        };
        assert_eq!(report.to_string(), "[2] timeout");
    }
}

//! Scripted in-memory transport for tests and dry runs.
//!
//! ```rust,ignore
//! let transport = ScriptedTransport::new()
//!     .reply("*IDN?", ["IFR,2026,SN1234"])
//!     .reply(":SOURCE A;:SOURCE?", [":SOURCE A"]);
//! let transcript = transport.transcript();
//! scheduler.attach(transport).await;
//! // ... run ...
//! assert_eq!(transcript.sent(), vec!["*IDN?", ":SOURCE A;:SOURCE?"]);
//! ```

use super::LineTransport;
use crate::error::{SerialError, SerialResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// One entry of a [`Transcript`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// A line written by the host.
    Sent(String),
    /// A line handed back to the host.
    Received(String),
    /// A read that found nothing queued.
    TimedOut,
}

/// Shared record of everything a [`ScriptedTransport`] saw.
///
/// Cloned out of the transport before it is moved into a scheduler.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Arc<Mutex<Vec<Exchange>>>,
}

impl Transcript {
    fn push(&self, entry: Exchange) {
        self.entries.lock().push(entry);
    }

    /// All exchanges in order.
    pub fn entries(&self) -> Vec<Exchange> {
        self.entries.lock().clone()
    }

    /// Only the lines written by the host, in order.
    pub fn sent(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Exchange::Sent(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// In-memory device simulation.
///
/// Each written line that matches a scripted command queues that command's
/// reply lines for subsequent reads. A read with nothing queued fails with
/// `SerialError::Timeout` immediately instead of waiting out the timeout.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: HashMap<String, Vec<String>>,
    inbox: VecDeque<String>,
    transcript: Transcript,
    write_budget: Option<usize>,
    timeout: Option<Duration>,
}

impl ScriptedTransport {
    /// Transport with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every write of `command` with `lines`.
    pub fn reply<I, S>(mut self, command: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replies
            .insert(command.into(), lines.into_iter().map(Into::into).collect());
        self
    }

    /// Queue a line that is readable without any prior write.
    pub fn unsolicited(mut self, line: impl Into<String>) -> Self {
        self.inbox.push_back(line.into());
        self
    }

    /// Accept `writes` more writes, then fail every write with `Disconnected`.
    pub fn disconnect_after(mut self, writes: usize) -> Self {
        self.write_budget = Some(writes);
        self
    }

    /// Override the default read timeout reported to block actions.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shared handle to the transcript.
    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }
}

#[async_trait]
impl LineTransport for ScriptedTransport {
    async fn write_line(&mut self, line: &str) -> SerialResult<()> {
        if let Some(budget) = self.write_budget.as_mut() {
            if *budget == 0 {
                return Err(SerialError::Disconnected);
            }
            *budget -= 1;
        }

        trace!(command = %line, "Scripted write");
        self.transcript.push(Exchange::Sent(line.to_string()));
        if let Some(lines) = self.replies.get(line) {
            self.inbox.extend(lines.iter().cloned());
        }
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> SerialResult<String> {
        match self.inbox.pop_front() {
            Some(line) => {
                self.transcript.push(Exchange::Received(line.clone()));
                Ok(line)
            }
            None => {
                self.transcript.push(Exchange::TimedOut);
                Err(SerialError::Timeout(timeout))
            }
        }
    }

    fn default_timeout(&self) -> Duration {
        self.timeout.unwrap_or(super::DEFAULT_READ_TIMEOUT)
    }

    fn describe(&self) -> String {
        "scripted transport".to_string()
    }
}

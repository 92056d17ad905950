//! Raw command passthrough.
//!
//! Sends up to three operator-supplied command lines and collects the
//! replies. The number of replies expected for each command is the number of
//! `?` characters in it; an explicit response-line count can ask for more.
//!
//! ```rust,ignore
//! let raw = Arc::new(CommandResponse::new());
//! raw.set_commands(["*IDN?", "RF:LEVEL?"]);
//! raw.register(&*scheduler, ["IFR"])?;
//! raw.send(&*scheduler).await?;
//! let [first, second, third] = raw.response_slots();
//! ```

use crate::error::{SchedulerError, SchedulerResult, SerialResult};
use crate::observable::Observable;
use crate::sequencer::{
    BlockAction, BlockHost, BlockId, BlockSpec, CommandContext, ErrorChannel, RunSummary,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Number of command lines and display slots.
pub const COMMAND_SLOTS: usize = 3;

/// Per-read timeout while collecting replies.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(250);

/// Default sibling ordering of the block.
pub const COMMAND_RESPONSE_ORDERING: i64 = 10;

/// Shown in the last slot when more replies arrived than there are slots.
pub const OVERFLOW_NOTICE: &str = "<response >3 lines, check log>";

const AUTOCOUNT_MARKER: char = '?';

/// Error code reported when the link fails mid-exchange.
const LINK_ERROR_CODE: u32 = 2;

#[derive(Debug, Default, Clone)]
struct Settings {
    commands: [String; COMMAND_SLOTS],
    response_lines: Option<usize>,
}

/// Device-independent command/response block.
#[derive(Debug)]
pub struct CommandResponse {
    settings: RwLock<Settings>,
    responses: Observable<Vec<String>>,
    block: Mutex<Option<BlockId>>,
    errors: Mutex<Option<ErrorChannel>>,
}

impl Default for CommandResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandResponse {
    /// Block with no commands configured.
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(Settings::default()),
            responses: Observable::new("command_response", Vec::new()),
            block: Mutex::new(None),
            errors: Mutex::new(None),
        }
    }

    /// Replace the command lines. Extra lines beyond three are ignored;
    /// missing ones are left empty.
    pub fn set_commands<I, S>(&self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut slots: [String; COMMAND_SLOTS] = Default::default();
        for (slot, command) in slots.iter_mut().zip(commands) {
            *slot = command.into();
        }
        self.settings.write().commands = slots;
    }

    /// Set one command line (`index` 0..3).
    pub fn set_command(&self, index: usize, command: impl Into<String>) {
        if let Some(slot) = self.settings.write().commands.get_mut(index) {
            *slot = command.into();
        }
    }

    /// Current command lines.
    pub fn commands(&self) -> [String; COMMAND_SLOTS] {
        self.settings.read().commands.clone()
    }

    /// Total number of reply lines to collect, or `None` to rely on the `?`
    /// count alone.
    pub fn set_response_lines(&self, lines: Option<usize>) {
        self.settings.write().response_lines = lines;
    }

    /// Configured response-line count.
    pub fn response_lines(&self) -> Option<usize> {
        self.settings.read().response_lines
    }

    /// Replies of the latest successful exchange.
    pub fn responses(&self) -> &Observable<Vec<String>> {
        &self.responses
    }

    /// The three display slots for the latest replies.
    pub fn response_slots(&self) -> [String; COMMAND_SLOTS] {
        slots_for(&self.responses.get())
    }

    /// Handle of the registered block, if registered.
    pub fn block(&self) -> Option<BlockId> {
        *self.block.lock()
    }

    /// Register with `host` under the given name prefix.
    ///
    /// Errors are reported on the host's error channel.
    pub fn register<I, S>(
        self: &Arc<Self>,
        host: &dyn BlockHost,
        prefix: I,
    ) -> SchedulerResult<BlockId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let action: Arc<dyn BlockAction> = self.clone();
        let id = host.add_block(
            BlockSpec::from_arc(action)
                .ordering(COMMAND_RESPONSE_ORDERING)
                .prefix(prefix)
                .name("command_response"),
        )?;
        *self.block.lock() = Some(id);
        *self.errors.lock() = Some(host.errors());
        Ok(id)
    }

    /// Queue the block and run immediately.
    pub async fn send(&self, host: &dyn BlockHost) -> SchedulerResult<RunSummary> {
        let block = self
            .block()
            .ok_or_else(|| SchedulerError::NotRegistered("command_response".into()))?;
        host.enqueue(block)?;
        host.run().await
    }

    async fn exchange(&self, ctx: &mut CommandContext<'_>) -> SerialResult<Vec<String>> {
        let settings = self.settings.read().clone();
        let mut responses = Vec::new();

        for line in settings.commands.iter().map(|c| c.trim()) {
            if line.is_empty() {
                continue;
            }
            let expected = line.matches(AUTOCOUNT_MARKER).count();
            info!(command = %line, "Direct send");
            ctx.write_line(line).await?;
            collect(ctx, expected, &mut responses).await?;
        }

        if let Some(total) = settings.response_lines {
            let remaining = total.saturating_sub(responses.len());
            collect(ctx, remaining, &mut responses).await?;
        }

        for response in &responses {
            info!(response = %response, "Direct response");
        }
        Ok(responses)
    }
}

/// Read up to `count` lines into `responses`; a timeout ends collection early.
async fn collect(
    ctx: &mut CommandContext<'_>,
    count: usize,
    responses: &mut Vec<String>,
) -> SerialResult<()> {
    for _ in 0..count {
        match ctx.read_line(RESPONSE_TIMEOUT).await {
            Ok(line) => responses.push(line),
            Err(err) if err.is_timeout() => {
                debug!("Response read timed out");
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn slots_for(responses: &[String]) -> [String; COMMAND_SLOTS] {
    let slot = |index: usize| responses.get(index).cloned().unwrap_or_default();
    let last = if responses.len() > COMMAND_SLOTS {
        OVERFLOW_NOTICE.to_string()
    } else {
        slot(2)
    };
    [slot(0), slot(1), last]
}

#[async_trait]
impl BlockAction for CommandResponse {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> SerialResult<()> {
        let errors = self
            .errors
            .lock()
            .clone()
            .unwrap_or_else(|| ctx.errors().clone());
        let _attempt = errors.attempt();

        match self.exchange(ctx).await {
            Ok(responses) => {
                self.responses.set(responses);
            }
            Err(err) => errors.report(LINK_ERROR_CODE, err.to_string()),
        }
        Ok(())
    }
}

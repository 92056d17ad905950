//! Shared helpers for scheduler integration tests.
//!
//! Actions record what they did into a shared [`Trace`] so tests can assert on
//! execution order without a real instrument.

#![allow(dead_code)]

use async_trait::async_trait;
use daq_sequencer::sequencer::{BlockAction, BlockHost, BlockId, BlockSpec, CommandContext};
use daq_sequencer::{SerialError, SerialResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// Ordered log of events shared between actions and the test body.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| e.as_str() == event).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Records its label and lets the scheduler run the children afterwards.
pub struct Record {
    pub label: String,
    pub trace: Trace,
}

#[async_trait]
impl BlockAction for Record {
    async fn execute(&self, _ctx: &mut CommandContext<'_>) -> SerialResult<()> {
        self.trace.push(self.label.clone());
        Ok(())
    }
}

/// Records `label:start`, runs the children, records `label:end`.
pub struct Bracket {
    pub label: String,
    pub trace: Trace,
}

#[async_trait]
impl BlockAction for Bracket {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> SerialResult<()> {
        self.trace.push(format!("{}:start", self.label));
        ctx.continue_to_children().await?;
        self.trace.push(format!("{}:end", self.label));
        Ok(())
    }
}

/// Records its label and fails with a protocol error.
pub struct Fail {
    pub label: String,
    pub trace: Trace,
}

#[async_trait]
impl BlockAction for Fail {
    async fn execute(&self, _ctx: &mut CommandContext<'_>) -> SerialResult<()> {
        self.trace.push(self.label.clone());
        Err(SerialError::protocol(format!("{} rejected", self.label)))
    }
}

pub fn record(trace: &Trace, label: &str) -> Record {
    Record {
        label: label.to_string(),
        trace: trace.clone(),
    }
}

pub fn bracket(trace: &Trace, label: &str) -> Bracket {
    Bracket {
        label: label.to_string(),
        trace: trace.clone(),
    }
}

pub fn fail(trace: &Trace, label: &str) -> Fail {
    Fail {
        label: label.to_string(),
        trace: trace.clone(),
    }
}

/// Register `action` named `label` under `parent` with `ordering`.
pub fn add(
    host: &dyn BlockHost,
    action: impl BlockAction + 'static,
    label: &str,
    parent: Option<BlockId>,
    ordering: i64,
) -> BlockId {
    let mut spec = BlockSpec::new(action).name(label).ordering(ordering);
    if let Some(parent) = parent {
        spec = spec.parent(parent);
    }
    host.add_block(spec).unwrap()
}

//! A backend that plays back a script.
//!
//! Every step takes the next scripted turn. Tests use it to drive the
//! conversation loop deterministically; the `echo` provider uses it with an
//! empty script so the CLI works without network access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parley_core::{
    BackendDefaults, Error, Llm, Query, Reply, Result, SingleToolCall, StepParams, StreamEvent,
    StreamingReply, StreamingTextReply, StreamingToolCallsReply, TextReply, ToolCallsReply,
    streaming_reply,
};
use tokio::sync::Mutex;
use tracing::debug;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Text(String),
    Calls(Vec<SingleToolCall>),
    /// Raw stream events, run through the streaming assembler.
    Events(Vec<Result<StreamEvent>>),
    Fail(Error),
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedTurn::Text(text.into())
    }
}

/// What happens once the script runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenExhausted {
    Fail,
    /// Answer with the last user message.
    Echo,
}

pub struct ScriptedLlm {
    name: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    when_exhausted: WhenExhausted,
    steps: AtomicUsize,
    seen: Mutex<Vec<Query>>,
    defaults: BackendDefaults,
}

impl ScriptedLlm {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            name: "scripted".into(),
            turns: Mutex::new(turns.into_iter().collect()),
            when_exhausted: WhenExhausted::Fail,
            steps: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            defaults: BackendDefaults {
                temperature: Some(0.0),
                model: Some("scripted".into()),
                tool_fn: None,
                cycle_limit: Some(5),
            },
        }
    }

    /// Repeats the user's last message forever.
    pub fn echo() -> Self {
        let mut llm = Self::new([]);
        llm.name = "echo".into();
        llm.when_exhausted = WhenExhausted::Echo;
        llm
    }

    pub fn with_defaults(mut self, defaults: BackendDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// How many steps (streaming or not) were taken.
    pub fn step_count(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }

    /// Every query the backend was stepped with, in order.
    pub async fn seen_queries(&self) -> Vec<Query> {
        self.seen.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.turns.lock().await.len()
    }

    async fn next_turn(&self, query: &Query) -> Result<ScriptedTurn> {
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().await.push(query.clone());
        let turn = self.turns.lock().await.pop_front();
        debug!(backend = %self.name, step, scripted = turn.is_some(), "Scripted step");
        match (turn, self.when_exhausted) {
            (Some(turn), _) => Ok(turn),
            (None, WhenExhausted::Echo) => Ok(ScriptedTurn::Text(query.last_message().to_string())),
            (None, WhenExhausted::Fail) => Err(Error::ProtocolViolation(format!(
                "script exhausted after {} steps",
                step - 1
            ))),
        }
    }
}

fn event_source(events: Vec<Result<StreamEvent>>) -> parley_core::EventSource {
    stream::iter(events).boxed()
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn defaults(&self) -> BackendDefaults {
        self.defaults.clone()
    }

    async fn step(&self, query: &Query, _params: &StepParams) -> Result<Reply> {
        match self.next_turn(query).await? {
            ScriptedTurn::Text(text) => Ok(TextReply::new(query.clone(), text).into()),
            ScriptedTurn::Calls(calls) => Ok(ToolCallsReply::new(query.clone(), calls).into()),
            ScriptedTurn::Events(events) => {
                match streaming_reply(query.clone(), event_source(events)).await? {
                    StreamingReply::Text(reply) => {
                        Ok(TextReply::new(query.clone(), reply.text().await?).into())
                    }
                    StreamingReply::ToolCalls(reply) => {
                        Ok(ToolCallsReply::new(query.clone(), reply.calls().await?).into())
                    }
                }
            }
            ScriptedTurn::Fail(err) => Err(err),
        }
    }

    async fn streamstep(&self, query: &Query, _params: &StepParams) -> Result<StreamingReply> {
        match self.next_turn(query).await? {
            ScriptedTurn::Text(text) => Ok(StreamingReply::Text(StreamingTextReply::of_text(
                query.clone(),
                &text,
            ))),
            ScriptedTurn::Calls(calls) => Ok(StreamingReply::ToolCalls(
                StreamingToolCallsReply::of_calls(query.clone(), calls),
            )),
            ScriptedTurn::Events(events) => streaming_reply(query.clone(), event_source(events)).await,
            ScriptedTurn::Fail(err) => Err(err),
        }
    }
}

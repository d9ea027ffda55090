//! Streaming replies and the token assembler behind them.
//!
//! A backend hands over its raw output as an [`EventSource`]: a single-pass
//! stream of [`StreamEvent`]s. [`streaming_reply`] reads just enough of it
//! to decide whether the model is answering in text or requesting tools,
//! then wraps the remainder:
//!
//! * text replies buffer every chunk they pull, so any number of readers
//!   can replay the answer from the start while the raw source is read
//!   exactly once;
//! * tool-call replies assemble the call fragments lazily, on first use.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::entry::{Entry, History, HistoryFilter, SingleToolCall};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::reply::{Continuation, continue_with, evaluate_calls, filters_or_default};
use crate::tool::{ToolDict, ToolFunction, params_from_json, valid_tools_against_calls};

/// One incremental event from a streaming backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamEvent {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<String>,
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn fragment(fragment: ToolCallFragment) -> Self {
        Self {
            tool_calls: vec![fragment],
            ..Default::default()
        }
    }
}

/// A piece of one tool call. Fragments sharing an `index` belong to the same
/// call; the id and name usually arrive once, the arguments in pieces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Raw, single-pass backend output.
pub type EventSource = BoxStream<'static, Result<StreamEvent>>;

/// The text chunks of a streaming answer.
pub type TokenSource = BoxStream<'static, Result<String>>;

struct BufferState {
    source: Option<TokenSource>,
    chunks: Vec<String>,
    failure: Option<Error>,
}

/// Append-only chunk list in front of a single-consumer source.
///
/// Readers keep only an index. Whoever asks for the first position past
/// the buffered prefix pulls the next raw chunk; everyone else replays.
struct TokenBuffer {
    state: Mutex<BufferState>,
}

impl TokenBuffer {
    fn new(source: TokenSource) -> Self {
        Self {
            state: Mutex::new(BufferState {
                source: Some(source),
                chunks: Vec::new(),
                failure: None,
            }),
        }
    }

    /// The chunk at `mark`, or `None` once the source is exhausted.
    async fn chunk_at(&self, mark: usize) -> Option<Result<String>> {
        let mut state = self.state.lock().await;
        if let Some(chunk) = state.chunks.get(mark) {
            return Some(Ok(chunk.clone()));
        }
        if let Some(failure) = &state.failure {
            return Some(Err(failure.clone()));
        }
        let next = state.source.as_mut()?.next().await;
        match next {
            Some(Ok(chunk)) => {
                state.chunks.push(chunk.clone());
                debug!(buffered = state.chunks.len(), "Token buffer grew");
                Some(Ok(chunk))
            }
            Some(Err(err)) => {
                state.source = None;
                state.failure = Some(err.clone());
                Some(Err(err))
            }
            None => {
                state.source = None;
                None
            }
        }
    }
}

/// Seeds the first turn of a streaming conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingRootReply {
    lastquery: Query,
}

impl StreamingRootReply {
    pub fn new(lastquery: Query) -> Self {
        Self { lastquery }
    }

    pub fn lastquery(&self) -> &Query {
        &self.lastquery
    }

    pub fn newquery(&self, userinput: &str, filters: &[HistoryFilter]) -> Query {
        continue_with(&self.lastquery, self.lastquery.history().clone(), userinput, filters)
    }
}

#[async_trait]
impl Continuation for StreamingRootReply {
    async fn next_query(&self, userinput: &str, filters: &[HistoryFilter]) -> Result<Query> {
        Ok(self.newquery(userinput, filters))
    }
}

/// A text answer delivered chunk by chunk.
///
/// Cloning is cheap and clones share the buffer.
#[derive(Clone)]
pub struct StreamingTextReply {
    lastquery: Query,
    buffer: Arc<TokenBuffer>,
}

impl StreamingTextReply {
    pub fn new(lastquery: Query, source: TokenSource) -> Self {
        Self {
            lastquery,
            buffer: Arc::new(TokenBuffer::new(source)),
        }
    }

    /// Wrap an already complete text. The text is split into words, each
    /// keeping its trailing space, so consumers still see several chunks.
    pub fn of_text(lastquery: Query, text: &str) -> Self {
        let parts: Vec<&str> = text.split(' ').collect();
        let last = parts.len().saturating_sub(1);
        let chunks: Vec<Result<String>> = parts
            .into_iter()
            .enumerate()
            .map(|(i, part)| Ok(if i < last { format!("{part} ") } else { part.to_string() }))
            .collect();
        Self::new(lastquery, stream::iter(chunks).boxed())
    }

    pub fn lastquery(&self) -> &Query {
        &self.lastquery
    }

    /// A fresh reader starting at the first chunk.
    ///
    /// Readers are independent: each yields every chunk in order no matter
    /// how the others advance. A source failure ends every reader with the
    /// same error.
    pub fn stream(&self) -> TokenSource {
        let buffer = Arc::clone(&self.buffer);
        stream::unfold(Some((buffer, 0usize)), |cursor| async move {
            let (buffer, mark) = cursor?;
            match buffer.chunk_at(mark).await? {
                Ok(chunk) => Some((Ok(chunk), Some((buffer, mark + 1)))),
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }

    /// The full answer. Drains whatever is still unread.
    pub async fn text(&self) -> Result<String> {
        let mut text = String::new();
        let mut mark = 0;
        while let Some(chunk) = self.buffer.chunk_at(mark).await {
            text.push_str(&chunk?);
            mark += 1;
        }
        Ok(text)
    }

    pub async fn history(&self) -> Result<History> {
        let mut history = self.lastquery.history().clone();
        history.push(Entry::Assistant(self.text().await?));
        Ok(history)
    }

    /// Same as [`crate::TextReply::newquery`], after draining the answer.
    pub async fn newquery(&self, userinput: &str, filters: &[HistoryFilter]) -> Result<Query> {
        let history = self.history().await?;
        Ok(continue_with(&self.lastquery, history, userinput, filters_or_default(filters)))
    }
}

impl fmt::Debug for StreamingTextReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingTextReply")
            .field("lastquery", &self.lastquery)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Continuation for StreamingTextReply {
    async fn next_query(&self, userinput: &str, filters: &[HistoryFilter]) -> Result<Query> {
        self.newquery(userinput, filters).await
    }
}

enum CallsState {
    Pending(BoxFuture<'static, Result<Vec<SingleToolCall>>>),
    Ready(Result<Vec<SingleToolCall>>),
}

/// Tool calls whose fragments are still arriving.
///
/// The calls are assembled the first time they are needed. Until then the
/// rest of the raw source stays unread.
#[derive(Clone)]
pub struct StreamingToolCallsReply {
    lastquery: Query,
    calls: Arc<Mutex<CallsState>>,
}

impl StreamingToolCallsReply {
    /// Wrap calls that are already complete.
    pub fn of_calls(lastquery: Query, calls: Vec<SingleToolCall>) -> Self {
        Self {
            lastquery,
            calls: Arc::new(Mutex::new(CallsState::Ready(Ok(calls)))),
        }
    }

    fn from_events(lastquery: Query, first: StreamEvent, rest: EventSource) -> Self {
        let builder = assemble_calls(lastquery.tools().clone(), first, rest);
        Self {
            lastquery,
            calls: Arc::new(Mutex::new(CallsState::Pending(Box::pin(builder)))),
        }
    }

    pub fn lastquery(&self) -> &Query {
        &self.lastquery
    }

    /// The assembled calls. The first caller drives the assembly; later
    /// callers get the stored outcome.
    pub async fn calls(&self) -> Result<Vec<SingleToolCall>> {
        let mut state = self.calls.lock().await;
        let outcome = match &mut *state {
            CallsState::Ready(outcome) => return outcome.clone(),
            CallsState::Pending(builder) => builder.await,
        };
        *state = CallsState::Ready(outcome.clone());
        outcome
    }

    pub async fn history(&self) -> Result<History> {
        let mut history = self.lastquery.history().clone();
        history.push(Entry::ToolCalls(self.calls().await?));
        Ok(history)
    }

    pub async fn evaluate(&self, tool_fn: &dyn ToolFunction) -> Result<Query> {
        let calls = self.calls().await?;
        let mut history = self.lastquery.history().clone();
        history.push(Entry::ToolCalls(calls.clone()));
        evaluate_calls(&self.lastquery, history, &calls, tool_fn).await
    }
}

impl fmt::Debug for StreamingToolCallsReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingToolCallsReply")
            .field("lastquery", &self.lastquery)
            .finish_non_exhaustive()
    }
}

/// What a streaming model step returns.
#[derive(Debug, Clone)]
pub enum StreamingReply {
    Text(StreamingTextReply),
    ToolCalls(StreamingToolCallsReply),
}

impl StreamingReply {
    pub fn lastquery(&self) -> &Query {
        match self {
            StreamingReply::Text(reply) => reply.lastquery(),
            StreamingReply::ToolCalls(reply) => reply.lastquery(),
        }
    }

    pub async fn history(&self) -> Result<History> {
        match self {
            StreamingReply::Text(reply) => reply.history().await,
            StreamingReply::ToolCalls(reply) => reply.history().await,
        }
    }
}

/// Classify a streaming answer from its first content-bearing event.
///
/// Events carrying neither text nor call fragments (role announcements,
/// keep-alives) are skipped. A finish before any content, or a source that
/// ends first, is a protocol violation.
pub async fn streaming_reply(lastquery: Query, mut source: EventSource) -> Result<StreamingReply> {
    loop {
        let event = match source.next().await {
            Some(event) => event?,
            None => {
                return Err(Error::ProtocolViolation(
                    "stream ended before any content".into(),
                ));
            }
        };
        if !event.tool_calls.is_empty() {
            debug!("Streaming reply is a tool-calls reply");
            return Ok(StreamingReply::ToolCalls(StreamingToolCallsReply::from_events(
                lastquery, event, source,
            )));
        }
        if event.text.as_deref().is_some_and(|text| !text.is_empty()) {
            debug!("Streaming reply is a text reply");
            let tokens = text_tokens(event, source);
            return Ok(StreamingReply::Text(StreamingTextReply::new(lastquery, tokens)));
        }
        if let Some(finish) = event.finish_reason {
            return Err(Error::ProtocolViolation(format!(
                "stream finished with '{finish}' before any content"
            )));
        }
    }
}

/// Text chunks of a text reply, starting with the event that classified it.
fn text_tokens(first: StreamEvent, source: EventSource) -> TokenSource {
    stream::unfold(Some((Some(first), source)), |state| async move {
        let (mut pending, mut source) = state?;
        loop {
            let mut event = match pending.take() {
                Some(event) => event,
                None => match source.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(err)) => return Some((Err(err), None)),
                    None => {
                        let err = Error::ProtocolViolation(
                            "text stream ended without a finish reason".into(),
                        );
                        return Some((Err(err), None));
                    }
                },
            };
            if !event.tool_calls.is_empty() {
                let err = Error::ProtocolViolation("tool call fragment inside a text reply".into());
                return Some((Err(err), None));
            }
            if let Some(text) = event.text.take().filter(|text| !text.is_empty()) {
                let rest = event.finish_reason.is_some().then_some(event);
                return Some((Ok(text), Some((rest, source))));
            }
            match event.finish_reason.as_deref() {
                Some("stop") => {
                    drain(source).await;
                    return None;
                }
                Some(other) => {
                    let err = Error::ProtocolViolation(format!(
                        "text stream finished with '{other}' instead of 'stop'"
                    ));
                    return Some((Err(err), None));
                }
                None => {}
            }
        }
    })
    .boxed()
}

/// Read a source to its end after the terminal event. Late errors are of no
/// consequence by then.
async fn drain(mut source: EventSource) {
    let mut skipped = 0usize;
    while let Some(item) = source.next().await {
        if let Err(err) = item {
            debug!(error = %err, "Ignoring error after finish");
        }
        skipped += 1;
    }
    if skipped > 0 {
        debug!(skipped, "Drained events after finish");
    }
}

async fn assemble_calls(
    tools: ToolDict,
    first: StreamEvent,
    mut source: EventSource,
) -> Result<Vec<SingleToolCall>> {
    let mut assembler = ToolCallAssembler::new();
    let mut event = first;
    loop {
        let StreamEvent {
            tool_calls,
            finish_reason,
            ..
        } = event;
        for fragment in tool_calls {
            assembler.push(fragment);
        }
        match finish_reason.as_deref() {
            Some("tool_calls") => break,
            Some(other) => {
                return Err(Error::ProtocolViolation(format!(
                    "tool call stream finished with '{other}' instead of 'tool_calls'"
                )));
            }
            None => {}
        }
        event = match source.next().await {
            Some(event) => event?,
            None => {
                return Err(Error::ProtocolViolation(
                    "tool call stream ended without a finish reason".into(),
                ));
            }
        };
    }
    drain(source).await;

    let calls = assembler.finish()?;
    debug!(calls = calls.len(), "Assembled streamed tool calls");
    if !valid_tools_against_calls(&tools, &calls) {
        return Err(Error::InvalidToolCall(
            "streamed tool calls do not match the declared tools".into(),
        ));
    }
    Ok(calls)
}

#[derive(Debug, Default)]
struct PartialCall {
    call_id: Option<String>,
    name: Option<String>,
    arguments: Vec<String>,
}

/// Groups tool call fragments by index.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    partials: BTreeMap<u32, PartialCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: ToolCallFragment) {
        let partial = self.partials.entry(fragment.index).or_default();
        if let Some(call_id) = fragment.call_id.filter(|id| !id.is_empty()) {
            partial.call_id = Some(call_id);
        }
        if let Some(name) = fragment.name.filter(|name| !name.is_empty()) {
            partial.name = Some(name);
        }
        if let Some(arguments) = fragment.arguments {
            partial.arguments.push(arguments);
        }
    }

    /// Complete calls in index order.
    pub fn finish(self) -> Result<Vec<SingleToolCall>> {
        self.partials
            .into_iter()
            .map(|(index, partial)| {
                let call_id = partial.call_id.ok_or(Error::IncompleteToolCall {
                    index,
                    missing: "call_id",
                })?;
                let name = partial.name.ok_or(Error::IncompleteToolCall {
                    index,
                    missing: "name",
                })?;
                if partial.arguments.is_empty() {
                    return Err(Error::IncompleteToolCall {
                        index,
                        missing: "arguments",
                    });
                }
                let paramvalues = params_from_json(&partial.arguments.concat())?;
                Ok(SingleToolCall::new(call_id, name, paramvalues))
            })
            .collect()
    }
}

//! Non-streaming replies and the turn-to-turn transition.
//!
//! Every reply carries the query that produced it. `history()` is that
//! query's history plus exactly one entry standing for the reply itself,
//! and the next query is always derived from a reply: by adding user input
//! to a text reply, or by evaluating the calls of a tool-calls reply.

use async_trait::async_trait;
use tracing::debug;

use crate::entry::{Entry, History, HistoryFilter, SingleToolCall, apply_history_filters, drop_tool_exchanges};
use crate::error::Result;
use crate::query::Query;
use crate::tool::{ToolFunction, evaluate_single_call};

/// Filter `history`, install it on `lastquery` and append the user input.
pub(crate) fn continue_with(
    lastquery: &Query,
    history: History,
    userinput: &str,
    filters: &[HistoryFilter],
) -> Query {
    let filtered = apply_history_filters(history, filters);
    lastquery.with_history(filtered).with_user(userinput)
}

/// Filters used by text replies when the caller supplies none.
pub(crate) fn filters_or_default(filters: &[HistoryFilter]) -> &[HistoryFilter] {
    const DEFAULT: &[HistoryFilter] = &[drop_tool_exchanges];
    if filters.is_empty() { DEFAULT } else { filters }
}

/// Run every call in order and append one result entry per call.
pub(crate) async fn evaluate_calls(
    lastquery: &Query,
    mut history: History,
    calls: &[SingleToolCall],
    tool_fn: &dyn ToolFunction,
) -> Result<Query> {
    debug!(calls = calls.len(), "Evaluating tool calls");
    history.reserve(calls.len());
    for call in calls {
        let result = evaluate_single_call(tool_fn, call).await?;
        history.push(Entry::ToolResult(result));
    }
    Ok(lastquery.with_history(history))
}

/// Anything a new user turn can be started from.
///
/// Implemented by both root replies and both text replies, so an
/// interactive loop can keep one `Box<dyn Continuation>` for "the last
/// thing that happened" from the first turn on.
#[async_trait]
pub trait Continuation: Send + Sync {
    async fn next_query(&self, userinput: &str, filters: &[HistoryFilter]) -> Result<Query>;
}

/// Seeds the first turn of a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct RootReply {
    lastquery: Query,
}

impl RootReply {
    pub fn new(lastquery: Query) -> Self {
        Self { lastquery }
    }

    pub fn lastquery(&self) -> &Query {
        &self.lastquery
    }

    /// Filter the original query's history (no default filter), then add
    /// the user entry.
    pub fn newquery(&self, userinput: &str, filters: &[HistoryFilter]) -> Query {
        continue_with(&self.lastquery, self.lastquery.history().clone(), userinput, filters)
    }
}

#[async_trait]
impl Continuation for RootReply {
    async fn next_query(&self, userinput: &str, filters: &[HistoryFilter]) -> Result<Query> {
        Ok(self.newquery(userinput, filters))
    }
}

/// A final, plain answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TextReply {
    lastquery: Query,
    text: String,
}

impl TextReply {
    pub fn new(lastquery: Query, text: impl Into<String>) -> Self {
        Self {
            lastquery,
            text: text.into(),
        }
    }

    pub fn lastquery(&self) -> &Query {
        &self.lastquery
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn history(&self) -> History {
        let mut history = self.lastquery.history().clone();
        history.push(Entry::Assistant(self.text.clone()));
        history
    }

    /// Start the next turn. With no filters the tool exchanges are dropped
    /// so they do not pollute the next model call.
    ///
    /// May be called any number of times; each call returns a fresh query.
    pub fn newquery(&self, userinput: &str, filters: &[HistoryFilter]) -> Query {
        let filters = filters_or_default(filters);
        debug!(filters = filters.len(), "TextReply.newquery");
        continue_with(&self.lastquery, self.history(), userinput, filters)
    }
}

#[async_trait]
impl Continuation for TextReply {
    async fn next_query(&self, userinput: &str, filters: &[HistoryFilter]) -> Result<Query> {
        Ok(self.newquery(userinput, filters))
    }
}

/// The model asked for one or more tool calls.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallsReply {
    lastquery: Query,
    calls: Vec<SingleToolCall>,
}

impl ToolCallsReply {
    pub fn new(lastquery: Query, calls: Vec<SingleToolCall>) -> Self {
        Self { lastquery, calls }
    }

    pub fn lastquery(&self) -> &Query {
        &self.lastquery
    }

    pub fn calls(&self) -> &[SingleToolCall] {
        &self.calls
    }

    pub fn history(&self) -> History {
        let mut history = self.lastquery.history().clone();
        history.push(Entry::ToolCalls(self.calls.clone()));
        history
    }

    /// Evaluate every call and return the query for the next model step.
    ///
    /// The reply is not consumed: evaluating again, perhaps with another
    /// tool function, branches the history.
    pub async fn evaluate(&self, tool_fn: &dyn ToolFunction) -> Result<Query> {
        evaluate_calls(&self.lastquery, self.history(), &self.calls, tool_fn).await
    }
}

/// What a non-streaming model step returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(TextReply),
    ToolCalls(ToolCallsReply),
}

impl Reply {
    pub fn lastquery(&self) -> &Query {
        match self {
            Reply::Text(reply) => reply.lastquery(),
            Reply::ToolCalls(reply) => reply.lastquery(),
        }
    }

    pub fn history(&self) -> History {
        match self {
            Reply::Text(reply) => reply.history(),
            Reply::ToolCalls(reply) => reply.history(),
        }
    }
}

impl From<TextReply> for Reply {
    fn from(reply: TextReply) -> Self {
        Reply::Text(reply)
    }
}

impl From<ToolCallsReply> for Reply {
    fn from(reply: ToolCallsReply) -> Self {
        Reply::ToolCalls(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ToolError};
    use crate::tool::{ParamValues, tool_fn};

    fn call(id: &str, x: &str) -> SingleToolCall {
        let mut params = ParamValues::new();
        params.insert("x".into(), x.into());
        SingleToolCall::new(id, "t", params)
    }

    fn keep_all(history: History) -> History {
        history
    }

    #[test]
    fn text_reply_history_appends_assistant_entry() {
        let q = Query::empty().with_user("hi");
        let reply = TextReply::new(q, "hello");
        assert_eq!(reply.history(), vec![Entry::user("hi"), Entry::assistant("hello")]);
        assert_eq!(reply.history(), reply.history());
    }

    #[test]
    fn text_reply_newquery_drops_tool_exchanges_by_default() {
        let q = Query::empty()
            .with_user("hi")
            .with_toolcalls(vec![call("c1", "1")])
            .with_toolreply("c1", "t", "r");
        let reply = TextReply::new(q, "done");

        let next = reply.newquery("again", &[]);
        assert_eq!(
            next.history(),
            &vec![Entry::user("hi"), Entry::assistant("done"), Entry::user("again")]
        );

        let kept = reply.newquery("again", &[keep_all]);
        assert_eq!(kept.history().len(), 5);
    }

    #[test]
    fn root_reply_newquery_applies_no_default_filter() {
        let q = Query::empty()
            .with_systeminstr("S")
            .with_toolcalls(vec![call("c1", "1")]);
        let next = q.replify().newquery("hi", &[]);
        assert_eq!(next.history().len(), 2);
        assert_eq!(next.last_message(), "hi");
        assert_eq!(next.systeminstr(), "S");

        let filtered = q.replify().newquery("hi", &[drop_tool_exchanges]);
        assert_eq!(filtered.history(), &vec![Entry::user("hi")]);
    }

    #[tokio::test]
    async fn evaluate_appends_results_in_call_order() {
        let q = Query::empty().with_user("go");
        let calls = vec![call("A", "1"), call("B", "2")];
        let reply = ToolCallsReply::new(q, calls.clone());
        let f = tool_fn(|_: &str, p: &ParamValues| Ok(format!("x={}", p["x"])));

        let next = reply.evaluate(&f).await.unwrap();
        assert_eq!(
            next.history(),
            &vec![
                Entry::user("go"),
                Entry::ToolCalls(calls),
                Entry::tool_result("A", "t", "x=1"),
                Entry::tool_result("B", "t", "x=2"),
            ]
        );
    }

    #[tokio::test]
    async fn evaluate_twice_branches_history() {
        let reply = ToolCallsReply::new(Query::empty().with_user("go"), vec![call("A", "1")]);
        let first = reply
            .evaluate(&tool_fn(|_: &str, _: &ParamValues| Ok("one".into())))
            .await
            .unwrap();
        let second = reply
            .evaluate(&tool_fn(|_: &str, _: &ParamValues| Ok("two".into())))
            .await
            .unwrap();
        assert_eq!(first.history()[2], Entry::tool_result("A", "t", "one"));
        assert_eq!(second.history()[2], Entry::tool_result("A", "t", "two"));
        assert_eq!(reply.history().len(), 2);
    }

    #[tokio::test]
    async fn tool_failure_propagates() {
        let reply = ToolCallsReply::new(Query::empty(), vec![call("A", "1")]);
        let failing = tool_fn(|name: &str, _: &ParamValues| {
            Err(ToolError::ExecutionFailed {
                tool_name: name.into(),
                reason: "boom".into(),
            })
        });
        let err = reply.evaluate(&failing).await.unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::ExecutionFailed { .. })));
    }

    #[tokio::test]
    async fn continuation_is_uniform_across_turns() {
        let root: Box<dyn Continuation> = Box::new(Query::empty().replify());
        let q1 = root.next_query("hi", &[]).await.unwrap();
        let text: Box<dyn Continuation> = Box::new(TextReply::new(q1, "hello"));
        let q2 = text.next_query("bye", &[]).await.unwrap();
        assert_eq!(
            q2.history(),
            &vec![Entry::user("hi"), Entry::assistant("hello"), Entry::user("bye")]
        );
    }

    #[test]
    fn reply_enum_delegates() {
        let q = Query::empty().with_user("u");
        let reply: Reply = ToolCallsReply::new(q.clone(), vec![call("A", "1")]).into();
        assert_eq!(reply.lastquery(), &q);
        assert_eq!(reply.history().len(), 2);
    }
}

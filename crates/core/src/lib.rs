//! # Parley Core
//!
//! Model-agnostic conversation and tool-calling protocol types.
//!
//! A conversation is an append-only [`History`] of typed [`Entry`] values.
//! A [`Query`] bundles that history with a system instruction and the tool
//! declarations, and an [`Llm`] backend turns a query into a reply: either
//! a final text or a batch of tool calls, delivered whole ([`Reply`]) or
//! incrementally ([`StreamingReply`]). Every reply knows the query that
//! produced it, so the next query is always derived from the last reply.
//!
//! The driver loop that repeats this until a text answer appears lives in
//! `parley-agent`; concrete backends live in `parley-providers`.

pub mod comments;
pub mod entry;
pub mod error;
pub mod llm;
pub mod pretty;
pub mod query;
pub mod reply;
pub mod stream;
pub mod tool;

pub use comments::remove_comments;
pub use entry::{
    Entry, History, HistoryFilter, RawMap, RawValue, SingleToolCall, ToolResultEntry,
    apply_history_filters, deserialize_history, drop_tool_exchanges, is_tool_entry,
    serialize_history,
};
pub use error::{Error, Result, ToolError};
pub use llm::{BackendDefaults, Llm, StepParams};
pub use pretty::Pretty;
pub use query::Query;
pub use reply::{Continuation, Reply, RootReply, TextReply, ToolCallsReply};
pub use stream::{
    EventSource, StreamEvent, StreamingReply, StreamingRootReply, StreamingTextReply,
    StreamingToolCallsReply, ToolCallAssembler, ToolCallFragment, TokenSource, streaming_reply,
};
pub use tool::{
    ParamValues, Parameter, SentinelToolFunction, Tool, ToolDescription, ToolDict, ToolFunction,
    ToolRegistry, evaluate_single_call, optional, param, tool, tool_fn,
    valid_tools_against_calls,
};

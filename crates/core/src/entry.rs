//! Entry and History domain types.
//!
//! A [`History`] is the ordered, append-only log of a conversation. Entries
//! are never mutated in place: every transformation builds a new history.
//!
//! The serialized form is a list of single-key JSON objects, the key naming
//! the entry kind:
//!
//! ```json
//! [{"user": "hi"},
//!  {"calls": [{"call_id": "c1", "name": "t", "paramvalues": {"x": "1"}}]},
//!  {"tool": {"call_id": "c1", "name": "t", "result": "42"}},
//!  {"assistant": "done"},
//!  {"raw": {"role": "developer", "content": "..."}}]
//! ```
//!
//! Callers persist this list between requests and must hand it back
//! verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::tool::ParamValues;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleToolCall {
    /// Unique within the enclosing tool-calls entry.
    pub call_id: String,
    pub name: String,
    pub paramvalues: ParamValues,
}

impl SingleToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, paramvalues: ParamValues) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            paramvalues,
        }
    }
}

/// The application's report of one tool call's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub call_id: String,
    pub name: String,
    /// A plain value like `20250801` or the text of a JSON document.
    pub result: String,
}

/// Payload of a raw entry: a recursive map of strings.
pub type RawMap = BTreeMap<String, RawValue>;

/// A value inside a raw entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Text(String),
    List(Vec<RawValue>),
    Map(RawMap),
}

impl From<&RawValue> for Value {
    fn from(raw: &RawValue) -> Self {
        match raw {
            RawValue::Text(text) => Value::String(text.clone()),
            RawValue::List(items) => Value::Array(items.iter().map(Value::from).collect()),
            RawValue::Map(map) => Value::Object(raw_map_to_json(map)),
        }
    }
}

/// Convert a raw payload to a JSON object.
pub fn raw_map_to_json(map: &RawMap) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), Value::from(value)))
        .collect()
}

/// One immutable event in a conversation.
///
/// The serde representation is externally tagged, which yields exactly the
/// single-key records of the history wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    #[serde(rename = "user")]
    User(String),

    /// Final text written by the model.
    #[serde(rename = "assistant")]
    Assistant(String),

    /// A model turn requesting one or more tool invocations.
    #[serde(rename = "calls")]
    ToolCalls(Vec<SingleToolCall>),

    #[serde(rename = "tool")]
    ToolResult(ToolResultEntry),

    /// Model-specific payload passed through untouched.
    #[serde(rename = "raw")]
    Raw(RawMap),
}

impl Entry {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User(content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant(content.into())
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self::ToolResult(ToolResultEntry {
            call_id: call_id.into(),
            name: name.into(),
            result: result.into(),
        })
    }

    /// The record key used for this entry kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Entry::User(_) => "user",
            Entry::Assistant(_) => "assistant",
            Entry::ToolCalls(_) => "calls",
            Entry::ToolResult(_) => "tool",
            Entry::Raw(_) => "raw",
        }
    }
}

/// Ordered sequence of entries.
pub type History = Vec<Entry>;

/// A pure history transformation applied when deriving a new query.
pub type HistoryFilter = fn(History) -> History;

fn single_key(key: &str, value: Value) -> Value {
    let mut record = Map::with_capacity(1);
    record.insert(key.to_string(), value);
    Value::Object(record)
}

fn call_to_json(call: &SingleToolCall) -> Value {
    let params: Map<String, Value> = call
        .paramvalues
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect();
    let mut record = Map::with_capacity(3);
    record.insert("call_id".into(), Value::String(call.call_id.clone()));
    record.insert("name".into(), Value::String(call.name.clone()));
    record.insert("paramvalues".into(), Value::Object(params));
    Value::Object(record)
}

/// Serialize one entry to its single-key record.
pub fn serialize_entry(entry: &Entry) -> Value {
    let payload = match entry {
        Entry::User(content) | Entry::Assistant(content) => Value::String(content.clone()),
        Entry::ToolCalls(calls) => Value::Array(calls.iter().map(call_to_json).collect()),
        Entry::ToolResult(result) => {
            let mut record = Map::with_capacity(3);
            record.insert("call_id".into(), Value::String(result.call_id.clone()));
            record.insert("name".into(), Value::String(result.name.clone()));
            record.insert("result".into(), Value::String(result.result.clone()));
            Value::Object(record)
        }
        Entry::Raw(content) => Value::Object(raw_map_to_json(content)),
    };
    single_key(entry.kind(), payload)
}

/// Serialize a history to its JSON wire form.
pub fn serialize_history(history: &[Entry]) -> Vec<Value> {
    history.iter().map(serialize_entry).collect()
}

/// Parse one record, enforcing the single-key shape and the entry
/// invariants serde cannot express.
pub fn deserialize_entry(record: &Value) -> Result<Entry> {
    let keys = record.as_object().map(Map::len).unwrap_or(0);
    if keys != 1 {
        return Err(Error::MalformedHistory(format!(
            "history record must have exactly one key, found {keys}: {record}"
        )));
    }

    let entry: Entry = serde_json::from_value(record.clone())
        .map_err(|e| Error::MalformedHistory(format!("{e}: {record}")))?;

    if let Entry::ToolCalls(calls) = &entry {
        if calls.is_empty() {
            return Err(Error::MalformedHistory(
                "tool-calls record carries no calls".into(),
            ));
        }
        let mut seen = HashSet::with_capacity(calls.len());
        if let Some(dup) = calls.iter().find(|c| !seen.insert(c.call_id.as_str())) {
            return Err(Error::MalformedHistory(format!(
                "duplicate call_id '{}' within one tool-calls record",
                dup.call_id
            )));
        }
    }
    Ok(entry)
}

/// Inverse of [`serialize_history`].
pub fn deserialize_history(records: &[Value]) -> Result<History> {
    records.iter().map(deserialize_entry).collect()
}

/// Whether an entry belongs to a tool exchange.
///
/// Raw entries are never classified as tool entries, even when they carry
/// tool traffic; callers that use raw entries write their own filters.
pub fn is_tool_entry(entry: &Entry) -> bool {
    match entry {
        Entry::ToolCalls(_) | Entry::ToolResult(_) => true,
        Entry::User(_) | Entry::Assistant(_) | Entry::Raw(_) => false,
    }
}

/// Remove every tool-call and tool-result entry.
pub fn drop_tool_exchanges(history: History) -> History {
    history.into_iter().filter(|e| !is_tool_entry(e)).collect()
}

/// Apply filters left to right.
pub fn apply_history_filters(history: History, filters: &[HistoryFilter]) -> History {
    filters.iter().fold(history, |acc, filter| filter(acc))
}

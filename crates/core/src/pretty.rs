//! Indented, human-oriented rendering of protocol values.
//!
//! Used by the CLI in verbose mode and by the manual backend, which shows
//! the whole query to the person playing the model. Streaming replies are
//! not covered: what they contain depends on how far they were read.

use std::fmt;

use crate::entry::{Entry, SingleToolCall};
use crate::query::Query;
use crate::reply::Reply;
use crate::tool::{Parameter, ToolDescription};

/// One level of indentation.
pub const INDENT: &str = "  ";

fn line(out: &mut String, indent: &str, text: &str) {
    out.push_str(indent);
    out.push_str(text);
    out.push('\n');
}

fn deeper(indent: &str) -> String {
    format!("{indent}{INDENT}")
}

pub trait Pretty {
    /// Append the rendering, every line prefixed with `indent`.
    fn pretty(&self, indent: &str, out: &mut String);

    fn to_pretty(&self) -> String {
        let mut out = String::new();
        self.pretty("", &mut out);
        out
    }
}

impl Pretty for SingleToolCall {
    fn pretty(&self, indent: &str, out: &mut String) {
        line(out, indent, &format!("Id: {}", self.call_id));
        line(out, indent, &format!("Function name: {}", self.name));
        let inner = deeper(indent);
        for (name, value) in &self.paramvalues {
            line(out, &inner, &format!("{name} = {value}"));
        }
    }
}

impl Pretty for Entry {
    fn pretty(&self, indent: &str, out: &mut String) {
        let inner = deeper(indent);
        match self {
            Entry::User(content) => line(out, indent, &format!("User: {content}")),
            Entry::Assistant(content) => line(out, indent, &format!("Assistant: {content}")),
            Entry::ToolCalls(calls) => {
                line(out, indent, "Assistant:");
                for call in calls {
                    call.pretty(&inner, out);
                }
            }
            Entry::ToolResult(result) => {
                line(out, indent, "Tool:");
                line(out, &inner, &format!("Id: {}", result.call_id));
                line(out, &inner, &format!("Function name: {}", result.name));
                line(out, &inner, &format!("Result: {}", result.result));
            }
            Entry::Raw(content) => {
                let json = serde_json::Value::Object(crate::entry::raw_map_to_json(content));
                line(out, indent, &json.to_string());
            }
        }
    }
}

impl Pretty for [Entry] {
    fn pretty(&self, indent: &str, out: &mut String) {
        for entry in self {
            entry.pretty(indent, out);
        }
    }
}

impl Pretty for Parameter {
    fn pretty(&self, indent: &str, out: &mut String) {
        let kind = if self.must { "Mandatory" } else { "Optional " };
        line(
            out,
            indent,
            &format!("{kind} {} : {} -- {}", self.name, self.typ, self.description),
        );
    }
}

impl Pretty for ToolDescription {
    fn pretty(&self, indent: &str, out: &mut String) {
        line(out, indent, &self.description);
        let inner = deeper(indent);
        for param in &self.paramdecls {
            param.pretty(&inner, out);
        }
    }
}

impl Pretty for Query {
    fn pretty(&self, indent: &str, out: &mut String) {
        let inner = deeper(indent);
        line(out, indent, "Tools:");
        for (name, description) in self.tools() {
            line(out, &inner, &format!("Tool name: {name}"));
            description.pretty(&deeper(&inner), out);
        }
        line(out, indent, &format!("System instruction: {}", self.systeminstr()));
        line(out, indent, "History:");
        self.history().pretty(&inner, out);
    }
}

impl Pretty for Reply {
    fn pretty(&self, indent: &str, out: &mut String) {
        let inner = deeper(indent);
        match self {
            Reply::Text(reply) => {
                line(out, indent, "<TextReply>");
                reply.lastquery().pretty(&inner, out);
                line(out, &inner, &format!("Text: {}", reply.text()));
            }
            Reply::ToolCalls(reply) => {
                line(out, indent, "<ToolCallsReply>");
                reply.lastquery().pretty(&inner, out);
                line(out, &inner, "Current calls:");
                for call in reply.calls() {
                    call.pretty(&inner, out);
                }
            }
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pretty())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pretty())
    }
}

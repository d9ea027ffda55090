//! The immutable request bundle sent to a model.
//!
//! Builder methods come in two flavours and the difference matters:
//! `with_user`, `with_assistant`, `with_toolcalls`, `with_toolreply` and
//! `with_raw` APPEND one entry to the history, while `with_history`,
//! `with_systeminstr` and `with_tools` REPLACE a field wholesale. Every
//! method returns a new `Query` and leaves the receiver untouched.

use crate::comments::remove_comments;
use crate::entry::{Entry, History, RawMap, SingleToolCall};
use crate::reply::RootReply;
use crate::stream::StreamingRootReply;
use crate::tool::ToolDict;

/// Returned by [`Query::last_message`] for an empty history.
pub const EMPTY_HISTORY_MARKER: &str = "<EMPTY CHAT HISTORY>";

/// Returned by [`Query::last_message`] when the last entry is not a user
/// entry.
pub const NOT_USER_MARKER: &str = "<LAST ENTRY IS NOT AN USER ENTRY>";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    history: History,
    system_instruction: String,
    tools: ToolDict,
}

impl Query {
    /// Starting block of the builder chain.
    pub fn empty() -> Self {
        Self::default()
    }

    fn appending(&self, entry: Entry) -> Self {
        let mut history = Vec::with_capacity(self.history.len() + 1);
        history.extend_from_slice(&self.history);
        history.push(entry);
        self.with_history(history)
    }

    /// APPENDS a user entry.
    pub fn with_user(&self, content: impl Into<String>) -> Self {
        self.appending(Entry::User(content.into()))
    }

    /// APPENDS an assistant entry.
    pub fn with_assistant(&self, content: impl Into<String>) -> Self {
        self.appending(Entry::Assistant(content.into()))
    }

    /// APPENDS a tool-calls entry.
    pub fn with_toolcalls(&self, calls: Vec<SingleToolCall>) -> Self {
        self.appending(Entry::ToolCalls(calls))
    }

    /// APPENDS a tool-result entry.
    pub fn with_toolreply(
        &self,
        call_id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        self.appending(Entry::tool_result(call_id, name, result))
    }

    /// APPENDS a raw entry.
    pub fn with_raw(&self, content: RawMap) -> Self {
        self.appending(Entry::Raw(content))
    }

    /// REPLACES the history.
    pub fn with_history(&self, history: History) -> Self {
        Self {
            history,
            system_instruction: self.system_instruction.clone(),
            tools: self.tools.clone(),
        }
    }

    /// REPLACES the system instruction. `(* ... *)` comments are stripped.
    pub fn with_systeminstr(&self, instruction: &str) -> Self {
        Self {
            history: self.history.clone(),
            system_instruction: remove_comments(instruction),
            tools: self.tools.clone(),
        }
    }

    /// REPLACES the tool declarations.
    pub fn with_tools(&self, tools: ToolDict) -> Self {
        Self {
            history: self.history.clone(),
            system_instruction: self.system_instruction.clone(),
            tools,
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn systeminstr(&self) -> &str {
        &self.system_instruction
    }

    pub fn tools(&self) -> &ToolDict {
        &self.tools
    }

    /// A pseudo-reply that lets the first turn be derived exactly like
    /// later ones.
    pub fn replify(&self) -> RootReply {
        RootReply::new(self.clone())
    }

    /// Streaming counterpart of [`Query::replify`].
    pub fn streamreplify(&self) -> StreamingRootReply {
        StreamingRootReply::new(self.clone())
    }

    /// The last user message, for logging. Never fails.
    pub fn last_message(&self) -> &str {
        match self.history.last() {
            None => EMPTY_HISTORY_MARKER,
            Some(Entry::User(content)) => content,
            Some(_) => NOT_USER_MARKER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{param, tool};

    fn base() -> Query {
        let mut tools = ToolDict::new();
        tools.insert("t".into(), tool("Test tool", vec![param("x", "string", "")]));
        Query::empty()
            .with_systeminstr("S")
            .with_tools(tools)
            .with_user("first")
    }

    #[test]
    fn empty_query_has_nothing() {
        let q = Query::empty();
        assert!(q.history().is_empty());
        assert_eq!(q.systeminstr(), "");
        assert!(q.tools().is_empty());
    }

    #[test]
    fn appenders_append() {
        let q = base();
        let next = q.with_user("x");
        let mut expected = q.history().clone();
        expected.push(Entry::user("x"));
        assert_eq!(next.history(), &expected);

        let chained = q
            .with_assistant("a")
            .with_toolcalls(vec![SingleToolCall::new("c", "t", Default::default())])
            .with_toolreply("c", "t", "r")
            .with_raw(RawMap::new());
        let kinds: Vec<&str> = chained.history().iter().map(Entry::kind).collect();
        assert_eq!(kinds, ["user", "assistant", "calls", "tool", "raw"]);
    }

    #[test]
    fn with_history_replaces_regardless_of_prior_history() {
        let replacement = vec![Entry::assistant("only")];
        let q = base().with_user("more").with_history(replacement.clone());
        assert_eq!(q.history(), &replacement);
        assert_eq!(q.systeminstr(), "S");
        assert!(q.tools().contains_key("t"));
    }

    #[test]
    fn with_tools_and_systeminstr_replace() {
        let q = base().with_tools(ToolDict::new()).with_systeminstr("T");
        assert!(q.tools().is_empty());
        assert_eq!(q.systeminstr(), "T");
        assert_eq!(q.history().len(), 1);
    }

    #[test]
    fn builders_leave_receiver_untouched() {
        let q = base();
        let before = q.clone();
        let _ = q.with_user("x").with_history(vec![]).with_systeminstr("other");
        assert_eq!(q, before);
    }

    #[test]
    fn system_instruction_comments_are_stripped() {
        let q = Query::empty().with_systeminstr("Answer (* internal note *) briefly.");
        assert_eq!(q.systeminstr(), "Answer briefly.");
    }

    #[test]
    fn last_message_sentinels() {
        assert_eq!(Query::empty().last_message(), EMPTY_HISTORY_MARKER);
        assert_eq!(base().last_message(), "first");
        assert_eq!(base().with_assistant("a").last_message(), NOT_USER_MARKER);
    }

    #[test]
    fn replify_keeps_query() {
        let q = base();
        assert_eq!(q.replify().lastquery(), &q);
        assert_eq!(q.streamreplify().lastquery(), &q);
    }
}

//! Built-in demo tools.

use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use parley_agent::{Resources, Shell, ShellTool};
use parley_core::{ParamValues, Tool, ToolDescription, ToolError, ToolRegistry, optional, param, tool};
use serde_json::{Map, Value};

/// Reports the local date and time.
pub struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> ToolDescription {
        tool(
            "Returns the current local date and time.",
            vec![optional(
                "format",
                "string",
                "strftime-style format, RFC 3339 when omitted",
            )],
        )
    }

    async fn execute(&self, params: &ParamValues) -> Result<String, ToolError> {
        let now = chrono::Local::now();
        let Some(format) = params.get("format") else {
            return Ok(now.to_rfc3339());
        };
        let mut out = String::new();
        write!(out, "{}", now.format(format))
            .map_err(|_| ToolError::InvalidArguments(format!("bad time format '{format}'")))?;
        Ok(out)
    }
}

/// Stores a table for the answer and returns its identifier.
pub struct MakeTable;

#[async_trait]
impl ShellTool for MakeTable {
    fn name(&self) -> &str {
        "make_table"
    }

    fn description(&self) -> ToolDescription {
        tool(
            "Creates a table to show in the answer and returns its identifier. \
             Reference the identifier in a table item of the final answer.",
            vec![param(
                "rows",
                "string",
                "JSON list of objects, one per row; object keys become column headings",
            )],
        )
    }

    async fn run(&self, params: &ParamValues, resources: &Resources) -> Result<String, ToolError> {
        let raw = params
            .get("rows")
            .ok_or_else(|| ToolError::InvalidArguments("'rows' is required".into()))?;
        let rows = parse_rows(raw)?;
        let id = resources.add_table(rows).await;
        Ok(serde_json::json!({"status": "success", "identifier": id}).to_string())
    }
}

fn parse_rows(raw: &str) -> Result<Vec<Map<String, Value>>, ToolError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ToolError::InvalidArguments(format!("rows are not JSON: {e}")))?;
    let Value::Array(items) = value else {
        return Err(ToolError::InvalidArguments("rows must be a JSON list".into()));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row),
            other => Err(ToolError::InvalidArguments(format!(
                "row {other} is not an object"
            ))),
        })
        .collect()
}

/// Tools for `parley chat`.
pub fn chat_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CurrentTime));
    registry
}

/// Add the built-in tools to a shell.
pub fn with_shell_tools(shell: Shell) -> Shell {
    shell
        .with_plain_tool(Arc::new(CurrentTime))
        .with_tool(Arc::new(MakeTable))
}

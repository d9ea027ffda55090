//! Tool declarations, validation and tool functions.
//!
//! The model only ever sees [`ToolDescription`]s. When it asks for a tool,
//! the call is checked against the declared [`ToolDict`] and then handed to
//! a caller-supplied [`ToolFunction`] whose string result is folded back
//! into the history.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::entry::{SingleToolCall, ToolResultEntry};
use crate::error::{Error, Result, ToolError};

/// Parameter values of a call, by parameter name.
pub type ParamValues = BTreeMap<String, String>;

/// Description of a single tool parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Type tag sent to the model: `string`, `integer`, `number`, `boolean`.
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub description: String,
    /// Mandatory parameters must be present in every call.
    #[serde(default = "default_must")]
    pub must: bool,
}

fn default_must() -> bool {
    true
}

/// A mandatory parameter.
pub fn param(name: impl Into<String>, typ: impl Into<String>, description: impl Into<String>) -> Parameter {
    Parameter {
        name: name.into(),
        typ: typ.into(),
        description: description.into(),
        must: true,
    }
}

/// An optional parameter.
pub fn optional(
    name: impl Into<String>,
    typ: impl Into<String>,
    description: impl Into<String>,
) -> Parameter {
    Parameter {
        must: false,
        ..param(name, typ, description)
    }
}

/// Full description of a single tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub description: String,
    #[serde(default)]
    pub paramdecls: Vec<Parameter>,
}

pub fn tool(description: impl Into<String>, paramdecls: Vec<Parameter>) -> ToolDescription {
    ToolDescription {
        description: description.into(),
        paramdecls,
    }
}

/// Declared tools by name. Ordered so that requests and printouts are
/// deterministic.
pub type ToolDict = BTreeMap<String, ToolDescription>;

fn valid_call_against(description: &ToolDescription, params: &ParamValues) -> bool {
    description
        .paramdecls
        .iter()
        .filter(|p| p.must)
        .all(|p| params.contains_key(&p.name))
}

/// True iff every call names a declared tool and supplies all of its
/// mandatory parameters. Extra parameters are not checked.
pub fn valid_tools_against_calls(tools: &ToolDict, calls: &[SingleToolCall]) -> bool {
    calls.iter().all(|call| {
        tools
            .get(&call.name)
            .is_some_and(|description| valid_call_against(description, &call.paramvalues))
    })
}

/// Parse a JSON argument object into parameter values.
///
/// String members are taken as they are; any other member is kept as its
/// JSON text, so `{"limit": 10}` yields `limit = "10"`. A call without
/// arguments must still send `{}`; blank text is rejected.
pub fn params_from_json(arguments: &str) -> Result<ParamValues> {
    let trimmed = arguments.trim();
    let value: Value = serde_json::from_str(trimmed).map_err(|e| {
        Error::ProtocolViolation(format!("tool call arguments are not valid JSON: {e}"))
    })?;
    let Value::Object(members) = value else {
        return Err(Error::ProtocolViolation(format!(
            "tool call arguments are not a JSON object: {trimmed}"
        )));
    };
    Ok(members
        .into_iter()
        .map(|(name, value)| {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (name, text)
        })
        .collect())
}

/// The caller-supplied function that executes tool calls.
///
/// Failures propagate to the driver loop unchanged; nothing here retries.
#[async_trait]
pub trait ToolFunction: Send + Sync {
    async fn call(&self, name: &str, params: &ParamValues) -> std::result::Result<String, ToolError>;
}

#[async_trait]
impl<F> ToolFunction for F
where
    F: Fn(&str, &ParamValues) -> std::result::Result<String, ToolError> + Send + Sync,
{
    async fn call(&self, name: &str, params: &ParamValues) -> std::result::Result<String, ToolError> {
        self(name, params)
    }
}

/// Pin a closure to the [`ToolFunction`] signature.
///
/// Closures passed straight to a generic bound do not infer the
/// higher-ranked argument lifetimes; routing them through here does.
pub fn tool_fn<F>(f: F) -> F
where
    F: Fn(&str, &ParamValues) -> std::result::Result<String, ToolError> + Send + Sync,
{
    f
}

/// Fails every call. Used where a backend must offer a default but no tool
/// function was configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentinelToolFunction;

#[async_trait]
impl ToolFunction for SentinelToolFunction {
    async fn call(&self, _name: &str, _params: &ParamValues) -> std::result::Result<String, ToolError> {
        Err(ToolError::NotProvided)
    }
}

/// Run one call through the tool function.
pub async fn evaluate_single_call(
    tool_fn: &dyn ToolFunction,
    call: &SingleToolCall,
) -> Result<ToolResultEntry> {
    debug!(call_id = %call.call_id, tool = %call.name, "Evaluating tool call");
    let result = tool_fn.call(&call.name, &call.paramvalues).await?;
    Ok(ToolResultEntry {
        call_id: call.call_id.clone(),
        name: call.name.clone(),
        result,
    })
}

/// A named capability that can be registered in a [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name the model uses to call this tool.
    fn name(&self) -> &str;

    /// What the model is told about this tool.
    fn description(&self) -> ToolDescription;

    async fn execute(&self, params: &ParamValues) -> std::result::Result<String, ToolError>;
}

/// A registry of tools that doubles as a tool function.
///
/// `tool_dict()` produces the declarations for a query; calling the
/// registry dispatches by name.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Declarations of every registered tool.
    pub fn tool_dict(&self) -> ToolDict {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description()))
            .collect()
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolFunction for ToolRegistry {
    async fn call(&self, name: &str, params: &ParamValues) -> std::result::Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(params).await
    }
}

//! One request/response turn of an element-producing assistant.
//!
//! The caller keeps the conversation as serialized history records between
//! turns. [`Shell::request`] deserializes them, asks the model with the
//! configured instruction and tools, and returns display elements plus the
//! history records to store for the next turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parley_config::ShellConfig;
use parley_core::{
    Entry, Error, ParamValues, Query, Tool, ToolDescription, ToolDict, ToolError, ToolFunction,
    deserialize_history, serialize_history,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::element::{Element, Resources, WrongAnswer, extract_json, textify, unparse_answer};

/// A tool that may deposit tables and graphics for the final answer.
#[async_trait]
pub trait ShellTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> ToolDescription;

    /// Run the tool. Resources stored in `resources` can be referenced by
    /// identifier in the model's answer.
    async fn run(&self, params: &ParamValues, resources: &Resources) -> Result<String, ToolError>;
}

/// A plain tool that never produces resources.
struct PlainTool(Arc<dyn Tool>);

#[async_trait]
impl ShellTool for PlainTool {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> ToolDescription {
        self.0.description()
    }

    async fn run(&self, params: &ParamValues, _resources: &Resources) -> Result<String, ToolError> {
        self.0.execute(params).await
    }
}

type ShellTools = BTreeMap<String, Arc<dyn ShellTool>>;

/// Tool function for a single attempt, bound to that attempt's resources.
struct AttemptTools {
    tools: Arc<ShellTools>,
    resources: Resources,
}

#[async_trait]
impl ToolFunction for AttemptTools {
    async fn call(&self, name: &str, params: &ParamValues) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.run(params, &self.resources).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error(transparent)]
    Protocol(#[from] Error),

    #[error("No final answer to '{utterance}' after {attempts} attempts: {reason}")]
    NoAnswer {
        utterance: String,
        attempts: u32,
        reason: String,
    },
}

pub struct Shell {
    driver: Driver,
    system_instruction: String,
    answer_attempts: u32,
    tools: Arc<ShellTools>,
}

impl Shell {
    /// The driver supplies the backend and its settings; the tool function
    /// is replaced on every attempt.
    pub fn new(driver: Driver, config: &ShellConfig) -> Self {
        let driver = match config.temperature {
            Some(temperature) => driver.with_temperature(temperature),
            None => driver,
        };
        Self {
            driver,
            system_instruction: config.system_instruction.clone(),
            answer_attempts: config.answer_attempts.max(1),
            tools: Arc::new(ShellTools::new()),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn ShellTool>) -> Self {
        Arc::make_mut(&mut self.tools).insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_plain_tool(self, tool: Arc<dyn Tool>) -> Self {
        self.with_tool(Arc::new(PlainTool(tool)))
    }

    /// Declarations of every tool offered to the model.
    pub fn tool_dict(&self) -> ToolDict {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description()))
            .collect()
    }

    /// The system instruction with today's date filled in.
    pub fn system_instruction(&self) -> String {
        let today = chrono::Local::now().date_naive().to_string();
        self.system_instruction.replace("{date}", &today)
    }

    /// Answer `utterance` in the context of the serialized `history`.
    ///
    /// Returns the answer elements and the history records to keep: the
    /// prior history, the utterance and any tool exchanges, then one
    /// assistant entry holding the textified elements. An answer that is
    /// not acceptable is asked for again, up to `answer_attempts` times in
    /// total, each attempt with a fresh resource table.
    pub async fn request(
        &self,
        history: &[Value],
        utterance: &str,
    ) -> Result<(Vec<Element>, Vec<Value>), ShellError> {
        info!(utterance, records = history.len(), "Shell request");
        let history = deserialize_history(history)?;
        let query = Query::empty()
            .with_history(history)
            .with_systeminstr(&self.system_instruction())
            .with_tools(self.tool_dict())
            .with_user(utterance);

        let mut reason = String::new();
        for attempt in 1..=self.answer_attempts {
            debug!(attempt, of = self.answer_attempts, "Shell attempt");
            match self.attempt(&query).await? {
                Ok((elements, query)) => {
                    let mut history = query.history().clone();
                    history.push(Entry::assistant(textify(&elements)));
                    return Ok((elements, serialize_history(&history)));
                }
                Err(wrong) => {
                    warn!(attempt, error = %wrong, "Unusable answer");
                    reason = wrong.0;
                }
            }
        }

        Err(ShellError::NoAnswer {
            utterance: utterance.to_string(),
            attempts: self.answer_attempts,
            reason,
        })
    }

    /// One attempt. The outer error is fatal, the inner one is retried.
    async fn attempt(
        &self,
        query: &Query,
    ) -> Result<Result<(Vec<Element>, Query), WrongAnswer>, ShellError> {
        let resources = Resources::new();
        let tool_fn = AttemptTools {
            tools: Arc::clone(&self.tools),
            resources: resources.clone(),
        };
        let driver = self.driver.clone().with_tool_fn(Arc::new(tool_fn));

        let reply = match driver.answer(query).await {
            Ok(reply) => reply,
            // A call to a tool that does not exist or with unusable
            // arguments is the model's mistake, not ours.
            Err(Error::Tool(
                err @ (ToolError::NotFound(_) | ToolError::InvalidArguments(_)),
            )) => return Ok(Err(WrongAnswer(err.to_string()))),
            Err(err) => return Err(err.into()),
        };

        let text = reply.text();
        let elements = if extract_json(text).is_none() {
            debug!("Answer carries no JSON, keeping it as text");
            vec![Element::Text(text.to_string())]
        } else {
            match unparse_answer(&resources.snapshot().await, text) {
                Ok(elements) => elements,
                Err(wrong) => return Ok(Err(wrong)),
            }
        };
        Ok(Ok((elements, reply.lastquery().clone())))
    }
}

//! The driver loop: step, evaluate tool calls, step again.

use std::fmt;
use std::sync::Arc;

use parley_core::{
    Error, Llm, Query, Reply, Result, StepParams, StreamingReply, StreamingTextReply, TextReply,
    ToolFunction,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Runs a backend until it answers with text.
///
/// Every named setting may be given here or left to the backend's
/// [`parley_core::BackendDefaults`]. A setting that is in neither place makes
/// `answer`/`streamanswer` fail with [`Error::Config`].
#[derive(Clone)]
pub struct Driver {
    llm: Arc<dyn Llm>,
    temperature: Option<f32>,
    model: Option<String>,
    tool_fn: Option<Arc<dyn ToolFunction>>,
    cycle_limit: Option<u32>,
    extra: Map<String, Value>,
}

/// Settings after resolution against the backend defaults.
struct Resolved {
    params: StepParams,
    tool_fn: Arc<dyn ToolFunction>,
    cycle_limit: u32,
}

impl Driver {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self {
            llm,
            temperature: None,
            model: None,
            tool_fn: None,
            cycle_limit: None,
            extra: Map::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tool_fn(mut self, tool_fn: Arc<dyn ToolFunction>) -> Self {
        self.tool_fn = Some(tool_fn);
        self
    }

    /// Maximum number of tool-requesting turns per answer.
    pub fn with_cycle_limit(mut self, limit: u32) -> Self {
        self.cycle_limit = Some(limit);
        self
    }

    /// Backend-specific request fields passed through on every step.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn llm(&self) -> &Arc<dyn Llm> {
        &self.llm
    }

    fn resolve(&self) -> Result<Resolved> {
        let defaults = self.llm.defaults();
        let backend = self.llm.name();
        let temperature = self
            .temperature
            .or(defaults.temperature)
            .ok_or_else(|| missing("temperature", backend))?;
        let model = self
            .model
            .clone()
            .or(defaults.model)
            .ok_or_else(|| missing("model", backend))?;
        let tool_fn = self
            .tool_fn
            .clone()
            .or(defaults.tool_fn)
            .ok_or_else(|| missing("tool function", backend))?;
        let cycle_limit = self
            .cycle_limit
            .or(defaults.cycle_limit)
            .ok_or_else(|| missing("cycle limit", backend))?;

        Ok(Resolved {
            params: StepParams {
                temperature,
                model,
                extra: self.extra.clone(),
            },
            tool_fn,
            cycle_limit,
        })
    }

    /// Step until the model answers with text.
    ///
    /// With a cycle limit of `n` the backend is stepped at most `n + 1`
    /// times: the tool-call reply that would start round `n + 1` fails with
    /// [`Error::CycleLimitExceeded`] before anything is evaluated.
    pub async fn answer(&self, query: &Query) -> Result<TextReply> {
        let settings = self.resolve()?;
        info!(
            backend = self.llm.name(),
            model = %settings.params.model,
            mode = "normal",
            query = query.last_message(),
            "Calling model"
        );

        let mut query = query.clone();
        let mut iterations = 0u32;
        loop {
            match self.llm.step(&query, &settings.params).await? {
                Reply::Text(reply) => {
                    debug!(iterations, "Model answered with text");
                    return Ok(reply);
                }
                Reply::ToolCalls(reply) => {
                    iterations += 1;
                    if iterations > settings.cycle_limit {
                        warn!(
                            limit = settings.cycle_limit,
                            "Cycle limit reached, giving up on tool calls"
                        );
                        return Err(Error::CycleLimitExceeded {
                            limit: settings.cycle_limit,
                        });
                    }
                    debug!(
                        iteration = iterations,
                        calls = reply.calls().len(),
                        "Evaluating tool calls"
                    );
                    query = reply.evaluate(settings.tool_fn.as_ref()).await?;
                }
            }
        }
    }

    /// Streaming counterpart of [`Driver::answer`].
    ///
    /// The returned reply may still be unread; draining it is up to the
    /// caller.
    pub async fn streamanswer(&self, query: &Query) -> Result<StreamingTextReply> {
        let settings = self.resolve()?;
        info!(
            backend = self.llm.name(),
            model = %settings.params.model,
            mode = "streaming",
            query = query.last_message(),
            "Calling model"
        );

        let mut query = query.clone();
        let mut iterations = 0u32;
        loop {
            match self.llm.streamstep(&query, &settings.params).await? {
                StreamingReply::Text(reply) => {
                    debug!(iterations, "Model started a text answer");
                    return Ok(reply);
                }
                StreamingReply::ToolCalls(reply) => {
                    iterations += 1;
                    if iterations > settings.cycle_limit {
                        warn!(
                            limit = settings.cycle_limit,
                            "Cycle limit reached, giving up on tool calls"
                        );
                        return Err(Error::CycleLimitExceeded {
                            limit: settings.cycle_limit,
                        });
                    }
                    debug!(iteration = iterations, "Evaluating streamed tool calls");
                    query = reply.evaluate(settings.tool_fn.as_ref()).await?;
                }
            }
        }
    }
}

fn missing(setting: &str, backend: &str) -> Error {
    Error::config(format!(
        "no {setting} given and backend '{backend}' has no default"
    ))
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("llm", &self.llm.name())
            .field("temperature", &self.temperature)
            .field("model", &self.model)
            .field("tool_fn", &self.tool_fn.as_ref().map(|_| "<tool function>"))
            .field("cycle_limit", &self.cycle_limit)
            .field("extra", &self.extra)
            .finish()
    }
}

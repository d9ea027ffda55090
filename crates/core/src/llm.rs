//! The model-stepping abstraction.
//!
//! A backend turns one [`Query`] into one reply and classifies it: text or
//! tool calls. Looping until a text answer arrives is the driver's job, not
//! the backend's.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::query::Query;
use crate::reply::Reply;
use crate::stream::{StreamingReply, StreamingTextReply, StreamingToolCallsReply};
use crate::tool::ToolFunction;

/// Per-step request parameters, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct StepParams {
    pub temperature: f32,
    pub model: String,
    /// Backend-specific request fields, merged into the request as-is.
    pub extra: Map<String, Value>,
}

impl StepParams {
    pub fn new(temperature: f32, model: impl Into<String>) -> Self {
        Self {
            temperature,
            model: model.into(),
            extra: Map::new(),
        }
    }
}

/// Values a backend offers for parameters the caller left out.
///
/// A `None` here and no explicit value from the caller is a configuration
/// error in the driver; nothing falls back to zero or empty.
#[derive(Clone, Default)]
pub struct BackendDefaults {
    pub temperature: Option<f32>,
    pub model: Option<String>,
    pub tool_fn: Option<Arc<dyn ToolFunction>>,
    pub cycle_limit: Option<u32>,
}

impl fmt::Debug for BackendDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDefaults")
            .field("temperature", &self.temperature)
            .field("model", &self.model)
            .field("tool_fn", &self.tool_fn.as_ref().map(|_| "<tool function>"))
            .field("cycle_limit", &self.cycle_limit)
            .finish()
    }
}

/// A language-model backend.
#[async_trait]
pub trait Llm: Send + Sync {
    /// A short name for logs ("openai", "scripted", ...).
    fn name(&self) -> &str;

    fn defaults(&self) -> BackendDefaults {
        BackendDefaults::default()
    }

    /// One non-streaming model call.
    async fn step(&self, query: &Query, params: &StepParams) -> Result<Reply>;

    /// One streaming model call.
    ///
    /// The default runs [`Llm::step`] and re-wraps the finished reply, for
    /// backends that cannot stream.
    async fn streamstep(&self, query: &Query, params: &StepParams) -> Result<StreamingReply> {
        Ok(match self.step(query, params).await? {
            Reply::Text(reply) => StreamingReply::Text(StreamingTextReply::of_text(
                reply.lastquery().clone(),
                reply.text(),
            )),
            Reply::ToolCalls(reply) => StreamingReply::ToolCalls(StreamingToolCallsReply::of_calls(
                reply.lastquery().clone(),
                reply.calls().to_vec(),
            )),
        })
    }
}

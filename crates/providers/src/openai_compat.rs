//! Backend for OpenAI-compatible chat completion endpoints.
//!
//! Works with OpenAI, Azure OpenAI, Ollama, vLLM and anything else that
//! speaks the `/chat/completions` protocol. Only OpenAI and Azure are
//! trusted to stream tool calls; for the others a streaming step is a
//! normal step re-wrapped as a streaming reply.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::stream::EventSource;
use parley_core::tool::params_from_json;
use parley_core::{
    BackendDefaults, Entry, Error, Llm, Parameter, Query, Reply, Result, SentinelToolFunction,
    SingleToolCall, StepParams, StreamEvent, StreamingReply, StreamingTextReply,
    StreamingToolCallsReply, TextReply, ToolCallFragment, ToolCallsReply, remove_comments,
    streaming_reply, valid_tools_against_calls,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::transport::{ChatTransport, HttpTransport};

/// The service behind a base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Azure,
    OpenAi,
    Ollama,
    Vllm,
    Unknown,
}

impl Service {
    pub fn detect(base_url: &str) -> Self {
        let url = base_url.to_lowercase();
        if url.contains("openai.azure.com") {
            Service::Azure
        } else if url.contains("api.openai.com") {
            Service::OpenAi
        } else if url.contains(":11434") || url.contains("ollama") {
            Service::Ollama
        } else if url.contains(":8000") || url.contains("vllm") {
            Service::Vllm
        } else {
            Service::Unknown
        }
    }

    pub fn can_stream(self) -> bool {
        matches!(self, Service::OpenAi | Service::Azure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Service::Azure => "azure",
            Service::OpenAi => "openai",
            Service::Ollama => "ollama",
            Service::Vllm => "vllm",
            Service::Unknown => "unknown",
        }
    }
}

pub struct OpenAiCompatLlm {
    name: String,
    transport: Arc<dyn ChatTransport>,
    service: Service,
    default_model: String,
    default_temperature: f32,
    cycle_limit: u32,
}

impl OpenAiCompatLlm {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
        default_model: impl Into<String>,
    ) -> Self {
        let service = Service::detect(transport.base_url());
        let name = name.into();
        debug!(backend = %name, service = service.as_str(), "Created OpenAI-compatible backend");
        Self {
            name,
            transport,
            service,
            default_model: default_model.into(),
            default_temperature: 0.7,
            cycle_limit: 5,
        }
    }

    /// The public OpenAI endpoint.
    pub fn openai(api_key: impl Into<String>, default_model: impl Into<String>) -> Result<Self> {
        let transport = HttpTransport::new("https://api.openai.com/v1", api_key)?;
        Ok(Self::new("openai", Arc::new(transport), default_model))
    }

    /// A local Ollama server (`http://localhost:11434/v1` unless given).
    pub fn ollama(base_url: Option<&str>, default_model: impl Into<String>) -> Result<Self> {
        let transport = HttpTransport::new(base_url.unwrap_or("http://localhost:11434/v1"), "ollama")?;
        Ok(Self::new("ollama", Arc::new(transport), default_model))
    }

    pub fn with_default_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = temperature;
        self
    }

    pub fn with_cycle_limit(mut self, cycle_limit: u32) -> Self {
        self.cycle_limit = cycle_limit;
        self
    }

    pub fn service(&self) -> Service {
        self.service
    }

    fn request_body(query: &Query, params: &StepParams, stream: bool) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(params.model));
        body.insert("messages".into(), Value::Array(format_messages(query)));
        body.insert("temperature".into(), json!(params.temperature));
        body.insert("stream".into(), json!(stream));
        let tools = format_tools(query);
        if !tools.is_empty() {
            body.insert("tools".into(), Value::Array(tools));
        }
        for (key, value) in &params.extra {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }

    async fn complete(&self, query: &Query, params: &StepParams) -> Result<Completion> {
        let body = Self::request_body(query, params, false);
        let response = self.transport.complete(body).await?;
        decode_completion(query, response)
    }
}

#[async_trait]
impl Llm for OpenAiCompatLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn defaults(&self) -> BackendDefaults {
        BackendDefaults {
            temperature: Some(self.default_temperature),
            model: Some(self.default_model.clone()),
            tool_fn: Some(Arc::new(SentinelToolFunction)),
            cycle_limit: Some(self.cycle_limit),
        }
    }

    async fn step(&self, query: &Query, params: &StepParams) -> Result<Reply> {
        debug!(backend = %self.name, model = %params.model, "Step");
        Ok(match self.complete(query, params).await? {
            Completion::Text(text) => TextReply::new(query.clone(), text).into(),
            Completion::Calls(calls) => ToolCallsReply::new(query.clone(), calls).into(),
        })
    }

    async fn streamstep(&self, query: &Query, params: &StepParams) -> Result<StreamingReply> {
        debug!(backend = %self.name, model = %params.model, streaming = self.service.can_stream(), "Streaming step");
        if !self.service.can_stream() {
            return Ok(match self.complete(query, params).await? {
                Completion::Text(text) => {
                    StreamingReply::Text(StreamingTextReply::of_text(query.clone(), &text))
                }
                Completion::Calls(calls) => {
                    StreamingReply::ToolCalls(StreamingToolCallsReply::of_calls(query.clone(), calls))
                }
            });
        }

        let body = Self::request_body(query, params, true);
        let chunks = self.transport.stream(body).await?;
        let events: EventSource = chunks
            .map(|chunk| chunk.and_then(decode_chunk))
            .boxed();
        streaming_reply(query.clone(), events).await
    }
}

fn format_param(parameter: &Parameter) -> Value {
    if parameter.description.is_empty() {
        json!({ "type": parameter.typ })
    } else {
        json!({ "type": parameter.typ, "description": remove_comments(&parameter.description) })
    }
}

/// Tool declarations in the `tools` request field.
///
/// A tool without parameters gets an empty `parameters` object; some
/// servers reject an empty `properties` map.
pub fn format_tools(query: &Query) -> Vec<Value> {
    query
        .tools()
        .iter()
        .map(|(name, description)| {
            let parameters = if description.paramdecls.is_empty() {
                json!({})
            } else {
                let properties: Map<String, Value> = description
                    .paramdecls
                    .iter()
                    .map(|p| (p.name.clone(), format_param(p)))
                    .collect();
                let required: Vec<&str> = description
                    .paramdecls
                    .iter()
                    .filter(|p| p.must)
                    .map(|p| p.name.as_str())
                    .collect();
                json!({ "type": "object", "properties": properties, "required": required })
            };
            json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": remove_comments(&description.description),
                    "parameters": parameters,
                }
            })
        })
        .collect()
}

fn format_call(call: &SingleToolCall) -> Value {
    // a BTreeMap of strings always serializes
    let arguments = serde_json::to_string(&call.paramvalues).unwrap_or_default();
    json!({
        "id": call.call_id,
        "type": "function",
        "function": { "name": call.name, "arguments": arguments },
    })
}

fn format_entry(entry: &Entry) -> Value {
    match entry {
        Entry::User(content) => json!({ "role": "user", "content": content }),
        Entry::Assistant(content) => json!({ "role": "assistant", "content": content }),
        Entry::ToolCalls(calls) => json!({
            "role": "assistant",
            "tool_calls": calls.iter().map(format_call).collect::<Vec<_>>(),
        }),
        Entry::ToolResult(result) => json!({
            "role": "tool",
            "name": result.name,
            "tool_call_id": result.call_id,
            "content": result.result,
        }),
        Entry::Raw(content) => Value::Object(parley_core::entry::raw_map_to_json(content)),
    }
}

/// The `messages` request field: the system instruction, then one message
/// per history entry.
pub fn format_messages(query: &Query) -> Vec<Value> {
    std::iter::once(json!({ "role": "system", "content": query.systeminstr() }))
        .chain(query.history().iter().map(format_entry))
        .collect()
}

#[derive(Debug, PartialEq)]
enum Completion {
    Text(String),
    Calls(Vec<SingleToolCall>),
}

// --- Response types (internal) ---
//
// Every field is optional so a missing one becomes a protocol violation
// naming the field instead of a generic decode error.

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    message: Option<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ApiFunction>,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn violation(message: impl Into<String>) -> Error {
    Error::ProtocolViolation(message.into())
}

fn decode_completion(query: &Query, response: Value) -> Result<Completion> {
    let response: ApiResponse = serde_json::from_value(response)
        .map_err(|e| violation(format!("malformed completion response: {e}")))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| violation("no choices in response"))?;
    let finish_reason = choice
        .finish_reason
        .ok_or_else(|| violation("no finish_reason in a non-streaming response"))?;
    let message = choice.message.ok_or_else(|| violation("response has no 'message' field"))?;

    match finish_reason.as_str() {
        "stop" => match message.content {
            Some(Value::String(text)) => {
                debug!(chars = text.len(), "finish_reason=stop");
                Ok(Completion::Text(text))
            }
            Some(_) => Err(violation("message.content is not a string")),
            None => Err(violation("message.content is missing")),
        },
        "tool_calls" => {
            let tool_calls = message.tool_calls.ok_or_else(|| {
                violation("message has no 'tool_calls' field despite finish_reason=tool_calls")
            })?;
            let calls = tool_calls
                .into_iter()
                .map(decode_call)
                .collect::<Result<Vec<_>>>()?;
            debug!(calls = calls.len(), "finish_reason=tool_calls");
            if !valid_tools_against_calls(query.tools(), &calls) {
                return Err(Error::InvalidToolCall(
                    "tool calls do not match the tool declarations".into(),
                ));
            }
            Ok(Completion::Calls(calls))
        }
        other => Err(violation(format!("unexpected finish_reason '{other}'"))),
    }
}

fn decode_call(call: ApiToolCall) -> Result<SingleToolCall> {
    let id = call.id.ok_or_else(|| violation("tool call has no 'id' field"))?;
    let function = call
        .function
        .ok_or_else(|| violation("tool call has no 'function' field"))?;
    let name = function
        .name
        .ok_or_else(|| violation("tool call function has no 'name' field"))?;
    let arguments = function
        .arguments
        .ok_or_else(|| violation("tool call function has no 'arguments' field"))?;
    Ok(SingleToolCall::new(id, name, params_from_json(&arguments)?))
}

// --- Streaming chunk types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Turn one SSE chunk into a stream event. Chunks without choices (usage
/// reports) become empty events.
fn decode_chunk(chunk: Value) -> Result<StreamEvent> {
    let response: StreamResponse = serde_json::from_value(chunk)
        .map_err(|e| violation(format!("malformed stream chunk: {e}")))?;
    let Some(choice) = response.choices.into_iter().next() else {
        return Ok(StreamEvent::default());
    };
    let delta = choice.delta.unwrap_or(StreamDelta {
        content: None,
        tool_calls: None,
    });
    let tool_calls = delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            ToolCallFragment {
                index: tc.index,
                call_id: tc.id,
                name,
                arguments,
            }
        })
        .collect();
    Ok(StreamEvent {
        text: delta.content,
        tool_calls,
        finish_reason: choice.finish_reason,
    })
}

//! Shared primitives for the chat-completion service behind the agents.
//!
//! The runtime never talks to a vendor SDK directly: every reasoning step
//! goes through the [`ChatClient`] trait, which turns an ordered history plus
//! a tool catalog into an [`AssistantReply`] (free-form text, tool-call
//! descriptors, or both). The one concrete implementation,
//! [`OpenAiCompatClient`], speaks the OpenAI-compatible
//! `/chat/completions` JSON dialect over `reqwest`, which covers every
//! backend the team runs against.
//!
//! # Example
//!
//! ```rust,no_run
//! use crewllm::client::{ChatClient, ChatRecord, ChatRequest, OpenAiCompatClient};
//!
//! # async {
//! let client = OpenAiCompatClient::new("secret", "https://api.openai.com/v1", "gpt-4o");
//! let history = vec![ChatRecord::user("Who are you?")];
//! let reply = client
//!     .complete(ChatRequest::new(&history, 0.6))
//!     .await
//!     .unwrap();
//! println!("{}", reply.content.unwrap_or_default());
//! # };
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::pin::Pin;

/// Conversation roles recognized by the chat service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the assistant.
///
/// `arguments` is kept as the raw JSON string the service produced; it is
/// only parsed at dispatch time so malformed arguments surface as a tool
/// error rather than a deserialization failure of the whole reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Service-assigned call id, echoed back on the matching tool record.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Raw JSON argument string.
    pub arguments: String,
}

/// One record of an agent's conversation history.
///
/// The tool-call-pair invariant binds sequences of these records: an
/// assistant record with non-empty `tool_calls` must be followed, before the
/// next assistant record, by exactly one tool record per descriptor, matched
/// by `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub role: ChatRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// For tool records: the id of the assistant descriptor being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool records: the tool's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// For assistant records: pending tool-call descriptors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatRecord {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(content.into()),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(content.into()),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    /// Build the assistant record for a reply, preserving text and
    /// descriptors exactly as returned.
    pub fn assistant(reply: &AssistantReply) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: reply.content.clone(),
            tool_call_id: None,
            name: None,
            tool_calls: reply.tool_calls.clone(),
        }
    }

    /// Build a tool record answering the descriptor with id `tool_call_id`.
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Render this record in the chat-completions wire shape.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        let role = match self.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };
        obj.insert("role".into(), serde_json::Value::String(role.into()));
        if let Some(content) = &self.content {
            obj.insert("content".into(), serde_json::Value::String(content.clone()));
        }
        if let Some(id) = &self.tool_call_id {
            obj.insert("tool_call_id".into(), serde_json::Value::String(id.clone()));
        }
        if let Some(name) = &self.name {
            obj.insert("name".into(), serde_json::Value::String(name.clone()));
        }
        if !self.tool_calls.is_empty() {
            let calls: Vec<serde_json::Value> = self
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": { "name": tc.name, "arguments": tc.arguments }
                    })
                })
                .collect();
            obj.insert("tool_calls".into(), serde_json::Value::Array(calls));
        }
        serde_json::Value::Object(obj)
    }
}

/// The assistant's answer to one reasoning step.
#[derive(Debug, Clone, Default)]
pub struct AssistantReply {
    /// Free-form text, if any.
    pub content: Option<String>,
    /// Tool-call descriptors, if any.
    pub tool_calls: Vec<ToolCallRequest>,
}

impl AssistantReply {
    /// A text-only reply. Convenience for scripted clients in tests.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Parameters for one chat completion.
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatRecord],
    pub temperature: f32,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Tool catalog in `{"type": "function", ...}` form, if tools are offered.
    pub tools: Option<&'a [serde_json::Value]>,
    /// Optional `response_format` object (e.g. `{"type": "json_object"}`).
    pub response_format: Option<serde_json::Value>,
}

impl<'a> ChatRequest<'a> {
    /// A plain request with the default 4 096-token ceiling and no tools.
    pub fn new(messages: &'a [ChatRecord], temperature: f32) -> Self {
        Self {
            messages,
            temperature,
            max_tokens: 4096,
            tools: None,
            response_format: None,
        }
    }

    /// Offer a tool catalog with this request (builder pattern).
    pub fn with_tools(mut self, tools: &'a [serde_json::Value]) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Constrain the response format (builder pattern).
    pub fn with_response_format(mut self, format: serde_json::Value) -> Self {
        self.response_format = Some(format);
        self
    }
}

/// An incremental piece of a streamed reply.
#[derive(Clone, Debug)]
pub struct ReplyChunk {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// Stream alias for implementations that support incremental replies.
pub type ReplyChunkStream =
    Pin<Box<dyn Stream<Item = Result<ReplyChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Trait-driven abstraction over the chat-completion service.
///
/// Implementations must be `Send + Sync` so one client can be shared across
/// all agent tasks.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// One full request/response round-trip.
    async fn complete(
        &self,
        request: ChatRequest<'_>,
    ) -> Result<AssistantReply, Box<dyn Error + Send + Sync>>;

    /// Optional streaming variant. Implementations without streaming support
    /// inherit this default, which resolves to `Ok(None)`; callers then fall
    /// back to [`complete`](ChatClient::complete).
    async fn complete_stream(
        &self,
        _request: ChatRequest<'_>,
    ) -> Result<Option<ReplyChunkStream>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }

    /// Identifier of the upstream model (e.g. `"gpt-4o"`).
    fn model_name(&self) -> &str;
}

/// Error raised by [`OpenAiCompatClient`] for non-success HTTP statuses and
/// malformed response bodies.
#[derive(Debug)]
pub struct ChatServiceError(pub String);

impl fmt::Display for ChatServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat service error: {}", self.0)
    }
}

impl Error for ChatServiceError {}

#[derive(Deserialize)]
struct WireCompletion {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

/// [`ChatClient`] for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    /// Build a client from the process-wide [`Settings`](crate::crewllm::config::Settings).
    pub fn from_settings(settings: &crate::crewllm::config::Settings) -> Self {
        Self::new(&settings.api_key, &settings.base_url, &settings.model)
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn complete(
        &self,
        request: ChatRequest<'_>,
    ) -> Result<AssistantReply, Box<dyn Error + Send + Sync>> {
        let wire_messages: Vec<serde_json::Value> =
            request.messages.iter().map(|m| m.to_wire()).collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        if let Some(tools) = request.tools {
            body["tools"] = serde_json::Value::Array(tools.to_vec());
            body["tool_choice"] = serde_json::Value::String("auto".into());
        }
        if let Some(format) = request.response_format {
            body["response_format"] = format;
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "OpenAiCompatClient::complete(...): {} from {}: {}",
                    status,
                    url,
                    detail
                );
            }
            return Err(Box::new(ChatServiceError(format!(
                "{}: {}",
                status, detail
            ))));
        }

        let completion: WireCompletion = response.json().await?;
        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| ChatServiceError("empty choices array".into()))?;

        Ok(AssistantReply {
            content: message.content.filter(|c| !c.is_empty()),
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCallRequest {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_record_keeps_descriptors() {
        let reply = AssistantReply {
            content: Some("thinking".into()),
            tool_calls: vec![ToolCallRequest {
                id: "call_1".into(),
                name: "web_search".into(),
                arguments: "{\"query\":\"rust\"}".into(),
            }],
        };
        let record = ChatRecord::assistant(&reply);
        assert_eq!(record.tool_calls.len(), 1);

        let wire = record.to_wire();
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "web_search");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
    }

    #[test]
    fn tool_record_carries_call_id_on_the_wire() {
        let record = ChatRecord::tool("call_7", "python_run", "ok");
        let wire = record.to_wire();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_7");
        assert_eq!(wire["content"], "ok");
    }
}

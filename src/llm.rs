//! Language model implementations and abstractions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::ModelConfig;
use crate::error::{ChatError, Result};
use crate::message::{Message, ToolCallRequest};
use crate::tool::ToolDescription;

/// Result of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelCompletion {
    pub fn into_message(self) -> Message {
        Message::ai_with_tool_calls(self.content.unwrap_or_default(), self.tool_calls)
    }
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelCompletion>;
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> ChatError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return ChatError::LanguageModel(format!("{provider} rate limit exceeded: {body}"));
    }
    ChatError::LanguageModel(format!("{provider} request failed with {}: {body}", status))
}

fn serialize_tool_arguments(args: &Value) -> String {
    match args {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Convert the conversation into OpenAI-compatible chat messages.
fn to_openai_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut built = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt {
        built.push(json!({ "role": "system", "content": prompt }));
    }
    for message in messages {
        let entry = match message {
            Message::Human { content } => json!({ "role": "user", "content": content }),
            Message::Ai {
                content,
                tool_calls,
            } if !tool_calls.is_empty() => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": serialize_tool_arguments(&call.arguments)
                            }
                        })
                    })
                    .collect();
                json!({
                    "role": "assistant",
                    "content": if content.is_empty() { Value::Null } else { json!(content) },
                    "tool_calls": calls
                })
            }
            Message::Ai { content, .. } => json!({ "role": "assistant", "content": content }),
            Message::ToolResult { tool_call_id, .. } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": message.text()
            }),
        };
        built.push(entry);
    }
    built
}

fn to_openai_tools(tools: &[ToolDescription]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters.clone().unwrap_or_else(|| json!({"type": "object"}))
                }
            })
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Groq Client (OpenAI-compatible API)
// ─────────────────────────────────────────────────────────────────────────────

/// Groq client - uses OpenAI-compatible API with Groq's endpoint.
/// Default model: llama-3.3-70b-versatile
#[derive(Clone)]
pub struct GroqClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for GroqClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroqClient")
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GroqClient {
    pub const DEFAULT_MODEL: &'static str = "llama-3.3-70b-versatile";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.groq.com/openai/v1";

    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .map_err(|err| ChatError::LanguageModel(format!("http client error: {err}")))?,
            model: Self::DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GROQ_API_KEY")
            .map_err(|_| ChatError::Config("GROQ_API_KEY not set".into()))?;
        Self::new(api_key)
    }

    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .ok_or_else(|| ChatError::Config("missing Groq API key in model config".into()))?;
        let mut client = Self::new(api_key)?.with_model(cfg.model.clone());
        if let Some(base_url) = &cfg.base_url {
            client = client.with_base_url(base_url.clone());
        }
        Ok(client)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for GroqClient {
    async fn complete_chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelCompletion> {
        let mut body = json!({
            "model": self.model,
            "messages": to_openai_messages(system_prompt, messages),
        });
        if !tools.is_empty() {
            body["tools"] = json!(to_openai_tools(tools));
            body["tool_choice"] = json!("auto");
        }

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::LanguageModel(format!("Groq request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(coalesce_error(status, &body, "Groq"));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::Protocol(format!("Groq parse error: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Protocol("Groq returned no choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments));
                ToolCallRequest {
                    id: call
                        .id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ModelCompletion {
            content: choice.message.content,
            tool_calls,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ChatFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Stub Model
// ─────────────────────────────────────────────────────────────────────────────

/// A deterministic model used for tests and demos.
///
/// Each scripted response is either plain text (a final answer) or a JSON
/// directive:
/// - `{"action":"respond","content":"..."}`
/// - `{"action":"call_tool","name":"...","arguments":{..},"id":"..."}`
/// - `{"action":"call_tools","calls":[{"name":"...","arguments":{..}}, ..]}`
/// - `{"action":"fail","reason":"..."}` to simulate a provider fault
pub struct StubModel {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Number of completion requests received so far.
    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Conversation sent with the most recent request.
    pub fn last_request(&self) -> Option<Vec<Message>> {
        lock(&self.requests).last().cloned()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.responses).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Deserialize)]
struct StubCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond { content: String },
    CallTool(StubCall),
    CallTools { calls: Vec<StubCall> },
    Fail { reason: String },
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        _system_prompt: Option<&str>,
        messages: &[Message],
        _tools: &[ToolDescription],
    ) -> Result<ModelCompletion> {
        let request_no = {
            let mut requests = lock(&self.requests);
            requests.push(messages.to_vec());
            requests.len()
        };
        let raw = lock(&self.responses).pop_front().ok_or_else(|| {
            ChatError::LanguageModel("StubModel ran out of scripted responses".into())
        })?;

        let to_request = |index: usize, call: StubCall| ToolCallRequest {
            id: call
                .id
                .unwrap_or_else(|| format!("call_{request_no}_{index}")),
            name: call.name,
            arguments: call.arguments,
        };

        match serde_json::from_str::<StubDirective>(&raw) {
            Ok(StubDirective::Respond { content }) => Ok(ModelCompletion {
                content: Some(content),
                tool_calls: Vec::new(),
            }),
            Ok(StubDirective::CallTool(call)) => Ok(ModelCompletion {
                content: None,
                tool_calls: vec![to_request(0, call)],
            }),
            Ok(StubDirective::CallTools { calls }) => Ok(ModelCompletion {
                content: None,
                tool_calls: calls
                    .into_iter()
                    .enumerate()
                    .map(|(index, call)| to_request(index, call))
                    .collect(),
            }),
            Ok(StubDirective::Fail { reason }) => Err(ChatError::LanguageModel(reason)),
            Err(_) => Ok(ModelCompletion {
                content: Some(raw),
                tool_calls: Vec::new(),
            }),
        }
    }
}

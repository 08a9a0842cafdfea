use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A model-issued request to run a named tool with JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One entry of a conversation. The sequence is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Human {
        content: String,
    },
    Ai {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        content: Value,
    },
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Message::Human {
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Message::Ai {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Message::Ai {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool_result(call: &ToolCallRequest, content: Value) -> Self {
        Message::ToolResult {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content,
        }
    }

    /// Text shown to a reader. Tool results render their JSON payload.
    pub fn text(&self) -> String {
        match self {
            Message::Human { content } | Message::Ai { content, .. } => content.clone(),
            Message::ToolResult { content, .. } => match content {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
        }
    }

    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match self {
            Message::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Message::Human { .. })
    }
}

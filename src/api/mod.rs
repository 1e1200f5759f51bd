//! Wire payloads shared by the OpenAI-compatible providers, the streamed
//! delta accumulator, and the structured API error every adapter reports.

pub mod anthropic;
pub mod cohere;
pub mod google;
pub mod ollama;
pub mod openai;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp::types::Tool;
use crate::proto::{self, Role};

/// A status-coded provider error. The coordinator's retry policy keys on
/// the status and, for 400s, on the code.
#[derive(Debug, Clone, Error)]
#[error("HTTP {status}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
    code: Option<Value>,
}

/// Parses the provider's error body; unparseable bodies become the raw
/// text.
pub fn parse_api_error(status: u16, body: &str) -> ApiError {
    let parsed: Option<ErrorEnvelope> = serde_json::from_str(body).ok();
    let (message, code) = match parsed {
        Some(envelope) => {
            let detail = envelope.error;
            let message = detail
                .as_ref()
                .and_then(|detail| detail.message.clone())
                .or(envelope.message)
                .unwrap_or_else(|| body.trim().to_string());
            let code = detail.and_then(|detail| detail.code).and_then(|code| match code {
                Value::String(code) => Some(code),
                Value::Number(code) => Some(code.to_string()),
                _ => None,
            });
            (message, code)
        }
        None => (body.trim().to_string(), None),
    };
    ApiError {
        status,
        code,
        message,
    }
}

pub async fn error_from_response(response: reqwest::Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    parse_api_error(status, &body)
}

#[derive(Serialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

#[derive(Serialize, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ChatResponseFormat>,
}

#[derive(Serialize, Clone)]
pub struct ChatResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ChatResponseFormat {
    pub fn json_object() -> Self {
        Self {
            kind: "json_object".to_string(),
        }
    }
}

#[derive(Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatResponseChoice>,
}

#[derive(Deserialize)]
pub struct ChatResponseChoice {
    pub delta: ChatResponseDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ChatResponseDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChatToolCallDelta>>,
}

#[derive(Deserialize)]
pub struct ChatToolCallDelta {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<ChatToolCallFunctionDelta>,
}

#[derive(Deserialize)]
pub struct ChatToolCallFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Serialize, Clone)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolCallFunction,
}

#[derive(Serialize, Clone)]
pub struct ChatToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Serialize, Clone)]
pub struct ChatToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolFunction,
}

#[derive(Serialize, Clone)]
pub struct ChatToolFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

/// A tool call assembled from streamed fragments.
#[derive(Debug, Clone, Default)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Sums partial deltas into the running assistant turn so the complete
/// message is available at end-of-turn.
#[derive(Default)]
pub struct ChatAccumulator {
    content: String,
    calls: Vec<PendingToolCall>,
}

impl ChatAccumulator {
    pub fn add_delta(&mut self, delta: &ChatResponseDelta) {
        if let Some(content) = &delta.content {
            self.content.push_str(content);
        }
        let Some(deltas) = &delta.tool_calls else {
            return;
        };
        for fragment in deltas {
            let index = fragment.index.unwrap_or(self.calls.len().saturating_sub(1));
            while self.calls.len() <= index {
                self.calls.push(PendingToolCall::default());
            }
            let call = &mut self.calls[index];
            if let Some(id) = &fragment.id {
                call.id.push_str(id);
            }
            if let Some(function) = &fragment.function {
                if let Some(name) = &function.name {
                    call.name.push_str(name);
                }
                if let Some(arguments) = &function.arguments {
                    call.arguments.push_str(arguments);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.calls.is_empty()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn calls(&self) -> &[PendingToolCall] {
        &self.calls
    }

    /// The completed turn as both the wire message (reused when the
    /// stream reopens) and the canonical message.
    pub fn assistant_message(&self) -> (ChatMessage, proto::Message) {
        let wire_calls: Vec<ChatToolCall> = self
            .calls
            .iter()
            .map(|call| ChatToolCall {
                id: call.id.clone(),
                kind: "function".to_string(),
                function: ChatToolCallFunction {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect();
        let wire = ChatMessage {
            role: "assistant".to_string(),
            content: self.content.clone(),
            tool_call_id: None,
            tool_calls: (!wire_calls.is_empty()).then_some(wire_calls),
        };
        let canonical = proto::Message {
            role: Role::Assistant,
            content: self.content.clone(),
            tool_calls: self
                .calls
                .iter()
                .map(|call| proto::ToolCall {
                    id: call.id.clone(),
                    is_error: false,
                    function: proto::Function {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
        };
        (wire, canonical)
    }
}

/// Translates the canonical thread into OpenAI chat messages.
pub fn from_proto_messages(input: &[proto::Message]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(input.len());
    for msg in input {
        match msg.role {
            Role::System => messages.push(ChatMessage::text("system", &msg.content)),
            Role::User => messages.push(ChatMessage::text("user", &msg.content)),
            Role::Tool => {
                if let Some(call) = msg.tool_calls.first() {
                    messages.push(ChatMessage::tool(&msg.content, &call.id));
                }
            }
            Role::Assistant => {
                let tool_calls: Vec<ChatToolCall> = msg
                    .tool_calls
                    .iter()
                    .map(|call| ChatToolCall {
                        id: call.id.clone(),
                        kind: "function".to_string(),
                        function: ChatToolCallFunction {
                            name: call.function.name.clone(),
                            arguments: call.function.arguments.clone(),
                        },
                    })
                    .collect();
                messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: msg.content.clone(),
                    tool_call_id: None,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                });
            }
        }
    }
    messages
}

/// Declares MCP tools as `"<server>_<tool>"` function definitions.
pub fn from_mcp_tools(tools: &BTreeMap<String, Vec<Tool>>) -> Option<Vec<ChatToolDefinition>> {
    let mut definitions = Vec::new();
    for (server, server_tools) in tools {
        for tool in server_tools {
            definitions.push(ChatToolDefinition {
                kind: "function".to_string(),
                function: ChatToolFunction {
                    name: format!("{server}_{}", tool.name),
                    description: tool.description.clone(),
                    parameters: tool_parameters(&tool.input_schema),
                },
            });
        }
    }
    (!definitions.is_empty()).then_some(definitions)
}

pub(crate) fn tool_parameters(schema: &Value) -> Value {
    if schema.is_object() {
        schema.clone()
    } else {
        json!({"type": "object", "properties": {}})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Message;

    #[test]
    fn accumulator_sums_content_and_call_fragments() {
        let mut acc = ChatAccumulator::default();
        let deltas: Vec<ChatResponseDelta> = [
            r#"{"content":"let me "}"#,
            r#"{"content":"check","tool_calls":[{"index":0,"id":"call_1","function":{"name":"fs_read"}}]}"#,
            r#"{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}"#,
            r#"{"tool_calls":[{"index":0,"function":{"arguments":"\"/etc/hosts\"}"}}]}"#,
        ]
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap())
        .collect();
        for delta in &deltas {
            acc.add_delta(delta);
        }

        assert_eq!(acc.content(), "let me check");
        assert_eq!(acc.calls().len(), 1);
        assert_eq!(acc.calls()[0].id, "call_1");
        assert_eq!(acc.calls()[0].name, "fs_read");
        assert_eq!(acc.calls()[0].arguments, r#"{"path":"/etc/hosts"}"#);

        let (wire, canonical) = acc.assistant_message();
        assert_eq!(wire.role, "assistant");
        assert_eq!(wire.tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(canonical.tool_calls[0].function.name, "fs_read");
    }

    #[test]
    fn proto_messages_map_roles_and_tool_ids() {
        let thread = vec![
            Message::system("be terse"),
            Message::user("hi"),
            proto::Message {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: vec![proto::ToolCall {
                    id: "call_1".into(),
                    is_error: false,
                    function: proto::Function {
                        name: "fs_read".into(),
                        arguments: "{}".into(),
                    },
                }],
            },
            proto::Message {
                role: Role::Tool,
                content: "contents".into(),
                tool_calls: vec![proto::ToolCall {
                    id: "call_1".into(),
                    ..Default::default()
                }],
            },
        ];
        let wire = from_proto_messages(&thread);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[2].tool_calls.as_ref().unwrap()[0].id, "call_1");
        assert_eq!(wire[3].role, "tool");
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn mcp_tools_become_prefixed_function_declarations() {
        let mut tools = BTreeMap::new();
        tools.insert(
            "fs".to_string(),
            vec![Tool {
                name: "read".into(),
                description: Some("read a file".into()),
                input_schema: json!({"type":"object","properties":{"path":{"type":"string"}}}),
            }],
        );
        let defs = from_mcp_tools(&tools).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, "fs_read");
        assert_eq!(defs[0].function.parameters["properties"]["path"]["type"], "string");
        assert!(from_mcp_tools(&BTreeMap::new()).is_none());
    }

    #[test]
    fn error_bodies_parse_status_and_code() {
        let err = parse_api_error(
            400,
            r#"{"error":{"message":"too long","code":"context_length_exceeded"}}"#,
        );
        assert_eq!(err.status, 400);
        assert_eq!(err.code.as_deref(), Some("context_length_exceeded"));
        assert_eq!(err.message, "too long");

        let raw = parse_api_error(502, "bad gateway");
        assert_eq!(raw.message, "bad gateway");
        assert!(raw.code.is_none());
    }
}

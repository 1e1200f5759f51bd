//! Shared protocol types: the message model every provider adapter, the
//! conversation store, and the session coordinator agree on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::mcp::types::Tool;

/// A message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("invalid role: {other}")),
        }
    }
}

/// The function half of a tool call. Arguments are raw JSON text that the
/// core never interprets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// A provider-issued tool call recorded on an assistant turn, or the
/// originating call echoed on a tool-result message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(default)]
    pub function: Function,
    #[serde(default)]
    pub is_error: bool,
}

/// One message of a conversation. Tool-role messages carry a single tool
/// result in `content` and the originating call in `tool_calls[0]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A delta of streamed content. May be empty when the provider event
/// carried no user-visible text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub content: String,
}

/// Outcome of a single tool invocation from an assistant turn.
#[derive(Debug, Clone)]
pub struct ToolCallStatus {
    pub name: String,
    pub err: Option<String>,
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\n> Running tool: `{}`\n", self.name)?;
        if let Some(err) = &self.err {
            write!(f, ">\n> *failed*:\n> ```\n")?;
            for line in err.lines() {
                write!(f, "> {line}")?;
            }
            write!(f, "\n> ```\n")?;
        }
        writeln!(f)
    }
}

/// Executes one named tool with raw JSON argument bytes.
pub type ToolCaller =
    Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Output shape requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
}

/// A chat request, assembled by the coordinator and translated by an
/// adapter into the provider's wire format.
#[derive(Clone, Default)]
pub struct Request {
    pub messages: Vec<Message>,
    pub api: String,
    pub model: String,
    pub user: Option<String>,
    /// Available tools keyed by server name; the map is ordered so tool
    /// declarations are deterministic across runs.
    pub tools: BTreeMap<String, Vec<Tool>>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub stop: Vec<String>,
    pub max_tokens: Option<i64>,
    pub response_format: Option<ResponseFormat>,
    pub tool_caller: Option<ToolCaller>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("api", &self.api)
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

/// Renders a stored conversation the way `--show` prints it.
pub fn render_conversation(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        if msg.content.is_empty() {
            continue;
        }
        match msg.role {
            Role::System => out.push_str("**System**: "),
            Role::User => out.push_str("**User**: "),
            Role::Assistant => out.push_str("**Assistant**: "),
            Role::Tool => {
                for call in &msg.tool_calls {
                    let status = ToolCallStatus {
                        name: call.function.name.clone(),
                        err: call.is_error.then(|| msg.content.clone()),
                    };
                    out.push_str(&status.to_string());
                }
                continue;
            }
        }
        out.push_str(&msg.content);
        out.push_str("\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_strings_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::try_from(role.as_str()), Ok(role));
        }
        assert!(Role::try_from("owner").is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn status_renders_failures_as_quoted_block() {
        let ok = ToolCallStatus {
            name: "fs_read".into(),
            err: None,
        };
        assert_eq!(ok.to_string(), "\n> Running tool: `fs_read`\n\n");

        let failed = ToolCallStatus {
            name: "fs_read".into(),
            err: Some("no such file".into()),
        };
        let rendered = failed.to_string();
        assert!(rendered.contains("*failed*"));
        assert!(rendered.contains("> no such file"));
    }

    #[test]
    fn conversation_render_skips_empty_messages() {
        let messages = vec![
            Message::system(""),
            Message::user("hello"),
            Message::assistant("hi"),
        ];
        let out = render_conversation(&messages);
        assert_eq!(out, "**User**: hello\n\n**Assistant**: hi\n\n");
    }

    #[test]
    fn legacy_message_without_tool_calls_decodes() {
        let msg: Message =
            serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert!(msg.tool_calls.is_empty());
    }
}

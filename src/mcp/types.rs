//! The JSON-RPC and MCP schema subset this client speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: &'static str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
}

impl JsonRpcNotification {
    pub fn new(method: &'static str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Whether this frame answers the request with the given id. Server
    /// notifications and counter-requests carry no matching id and are
    /// skipped by callers.
    pub fn answers(&self, id: i64) -> bool {
        (self.result.is_some() || self.error.is_some())
            && self.id.as_ref().and_then(Value::as_i64) == Some(id)
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MCP error {}: {}", self.code, self.message)
    }
}

/// A tool advertised by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

#[derive(Debug, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// A result content block. Anything that is not plain text is rendered as
/// a placeholder.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Text { text: String },
    Other(Value),
}

impl CallToolResult {
    /// Concatenates textual content; non-text blocks become the literal
    /// `[non-text content]` placeholder.
    pub fn concat_text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            match block {
                ContentBlock::Text { text } => out.push_str(text),
                ContentBlock::Other(_) => out.push_str("[non-text content]"),
            }
        }
        out
    }
}

pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mods",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_answer_only_their_own_id() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#).unwrap();
        assert!(resp.answers(3));
        assert!(!resp.answers(4));

        // A server-initiated request parses but answers nothing.
        let req: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#).unwrap();
        assert!(!req.answers(9));
    }

    #[test]
    fn tool_results_concatenate_text_blocks() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[
                {"type":"text","text":"hello "},
                {"type":"image","data":"...","mimeType":"image/png"},
                {"type":"text","text":"world"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(result.concat_text(), "hello [non-text content]world");
        assert!(!result.is_error);
    }

    #[test]
    fn tools_decode_camel_case_schemas() {
        let tool: Tool = serde_json::from_str(
            r#"{"name":"read","description":"read a file","inputSchema":{"type":"object"}}"#,
        )
        .unwrap();
        assert_eq!(tool.name, "read");
        assert_eq!(tool.input_schema["type"], "object");
    }
}

//! The Ollama local chat adapter. Responses stream as NDJSON, sampling
//! options travel in an open-ended map, and tool calls are keyed by an
//! integer index that fills the id slot as a decimal string.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{error_from_response, from_mcp_tools, ChatToolDefinition};
use crate::proto::{self, Chunk, Message, Request, Role, ToolCallStatus, ToolCaller};
use crate::stream::sse::LineStream;
use crate::stream::{call_tool, Stream, StreamError};

const DEFAULT_BASE_URL: &str = "http://localhost:11434/";

#[derive(Clone)]
pub struct Config {
    pub base_url: String,
    pub http_client: Option<reqwest::Client>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            http_client: None,
        }
    }
}

#[derive(Serialize, Clone)]
struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatToolDefinition>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    options: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Default)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Serialize, Deserialize, Clone)]
struct OllamaToolCall {
    function: OllamaToolCallFunction,
}

#[derive(Serialize, Deserialize, Clone)]
struct OllamaToolCallFunction {
    #[serde(default)]
    index: i64,
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct ChatResponseLine {
    #[serde(default)]
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

fn from_proto_message(msg: &Message) -> OllamaMessage {
    let tool_calls = msg
        .tool_calls
        .iter()
        .map(|call| OllamaToolCall {
            function: OllamaToolCallFunction {
                index: call.id.parse().unwrap_or_default(),
                name: call.function.name.clone(),
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::Null),
            },
        })
        .collect();
    OllamaMessage {
        role: msg.role.as_str().to_string(),
        content: msg.content.clone(),
        tool_calls,
    }
}

fn to_proto_message(content: String, calls: &[OllamaToolCall]) -> Message {
    Message {
        role: Role::Assistant,
        content,
        tool_calls: calls
            .iter()
            .map(|call| proto::ToolCall {
                id: call.function.index.to_string(),
                is_error: false,
                function: proto::Function {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.to_string(),
                },
            })
            .collect(),
    }
}

pub struct Client {
    http: reqwest::Client,
    config: Config,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let http = config.http_client.clone().unwrap_or_default();
        Self { http, config }
    }

    pub fn request(&self, cancel: CancellationToken, request: Request) -> OllamaStream {
        let mut options = Map::new();
        if let Some(stop) = request.stop.first() {
            options.insert("stop".to_string(), Value::String(stop.clone()));
        }
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_ctx".to_string(), max_tokens.into());
        }
        if let Some(temperature) = request.temperature {
            options.insert("temperature".to_string(), temperature.into());
        }
        if let Some(top_p) = request.top_p {
            options.insert("top_p".to_string(), top_p.into());
        }

        let body = ChatRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(from_proto_message).collect(),
            stream: true,
            tools: from_mcp_tools(&request.tools),
            options,
        };

        OllamaStream {
            http: self.http.clone(),
            url: format!(
                "{}/api/chat",
                self.config.base_url.trim_end_matches('/')
            ),
            body,
            cancel,
            lines: None,
            content: String::new(),
            calls: Vec::new(),
            messages: request.messages,
            tool_caller: request.tool_caller,
            turn_done: false,
            done: false,
            err: None,
        }
    }
}

pub struct OllamaStream {
    http: reqwest::Client,
    url: String,
    body: ChatRequest,
    cancel: CancellationToken,
    lines: Option<LineStream>,
    content: String,
    calls: Vec<OllamaToolCall>,
    messages: Vec<Message>,
    tool_caller: Option<ToolCaller>,
    /// The provider reported `done` for the current turn.
    turn_done: bool,
    /// The turn was finalized; the next `next()` reopens.
    done: bool,
    err: Option<StreamError>,
}

impl OllamaStream {
    async fn open(&self) -> Result<LineStream, StreamError> {
        debug!(url = %self.url, model = %self.body.model, "opening ollama chat stream");
        let builder = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json");
        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(StreamError::Transport("request cancelled".to_string()))
            }
            response = builder.json(&self.body).send() => {
                response.map_err(StreamError::transport)?
            }
        };
        if !response.status().is_success() {
            return Err(StreamError::Api(error_from_response(response).await));
        }
        Ok(LineStream::new(response, self.cancel.clone()))
    }

    fn finish_turn(&mut self) {
        self.done = true;
        self.turn_done = false;
        self.lines = None;
        if self.content.is_empty() && self.calls.is_empty() {
            return;
        }
        let canonical = to_proto_message(self.content.clone(), &self.calls);
        self.body.messages.push(from_proto_message(&canonical));
        self.messages.push(canonical);
    }
}

#[async_trait]
impl Stream for OllamaStream {
    async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.turn_done {
            self.finish_turn();
            return false;
        }
        if self.done {
            self.done = false;
            self.content.clear();
            self.calls.clear();
        }
        if self.lines.is_none() {
            match self.open().await {
                Ok(lines) => self.lines = Some(lines),
                Err(err) => {
                    self.err = Some(err);
                    return false;
                }
            }
        }
        true
    }

    async fn current(&mut self) -> Result<Chunk, StreamError> {
        let lines = match self.lines.as_mut() {
            Some(lines) => lines,
            None => return Err(StreamError::NoContent),
        };
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                self.turn_done = true;
                return Err(StreamError::NoContent);
            }
            Err(err) => return Err(err),
        };
        if line.is_empty() {
            return Err(StreamError::NoContent);
        }

        let response: ChatResponseLine =
            serde_json::from_str(&line).map_err(StreamError::transport)?;
        if let Some(error) = response.error {
            return Err(StreamError::Transport(format!("ollama: {error}")));
        }

        self.content.push_str(&response.message.content);
        self.calls.extend(response.message.tool_calls);
        if response.done {
            self.turn_done = true;
        }
        Ok(Chunk {
            content: response.message.content,
        })
    }

    async fn call_tools(&mut self) -> Vec<ToolCallStatus> {
        let Some(caller) = self.tool_caller.clone() else {
            return Vec::new();
        };
        let calls = self.calls.clone();
        let mut statuses = Vec::with_capacity(calls.len());
        for call in calls {
            let id = call.function.index.to_string();
            let arguments = call.function.arguments.to_string();
            let (msg, status) =
                call_tool(&id, &call.function.name, &arguments, &caller).await;
            self.body.messages.push(OllamaMessage {
                role: "tool".to_string(),
                content: msg.content.clone(),
                tool_calls: Vec::new(),
            });
            self.messages.push(msg);
            statuses.push(status);
        }
        statuses
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.cancel.cancel();
        self.lines = None;
        Ok(())
    }

    fn err(&self) -> Option<StreamError> {
        self.err.clone()
    }

    fn messages(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_map_carries_sampling_controls() {
        let client = Client::new(Config::default());
        let stream = client.request(
            CancellationToken::new(),
            Request {
                model: "llama3".into(),
                stop: vec!["END".into()],
                max_tokens: Some(2048),
                temperature: Some(0.2),
                top_p: Some(0.9),
                ..Request::default()
            },
        );
        assert_eq!(stream.body.options["stop"], "END");
        assert_eq!(stream.body.options["num_ctx"], 2048);
        assert_eq!(stream.body.options["temperature"], 0.2);
        assert_eq!(stream.body.options["top_p"], 0.9);
        assert_eq!(stream.url, "http://localhost:11434/api/chat");
    }

    #[test]
    fn tool_call_indices_become_decimal_ids() {
        let calls = vec![OllamaToolCall {
            function: OllamaToolCallFunction {
                index: 3,
                name: "fs_read".into(),
                arguments: serde_json::json!({"path": "/etc/hosts"}),
            },
        }];
        let msg = to_proto_message("checking".into(), &calls);
        assert_eq!(msg.tool_calls[0].id, "3");
        assert_eq!(msg.tool_calls[0].function.name, "fs_read");

        // And they parse back to the index on the way out.
        let wire = from_proto_message(&msg);
        assert_eq!(wire.tool_calls[0].function.index, 3);
    }

    #[test]
    fn response_lines_decode_tool_calls() {
        let line: ChatResponseLine = serde_json::from_str(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[
                {"function":{"index":0,"name":"fs_read","arguments":{"path":"x"}}}
            ]},"done":true}"#,
        )
        .unwrap();
        assert!(line.done);
        assert_eq!(line.message.tool_calls.len(), 1);
    }
}

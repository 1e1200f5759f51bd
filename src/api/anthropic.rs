//! The Anthropic messages adapter. System messages travel outside the
//! role stream, and tool results go back as user messages carrying
//! tool-result blocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error_from_response;
use crate::mcp::types::Tool;
use crate::proto::{self, Chunk, Message, Request, Role, ToolCallStatus, ToolCaller};
use crate::stream::sse::{data_payload, LineStream};
use crate::stream::{call_tool, Stream, StreamError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 4096;

#[derive(Clone, Default)]
pub struct Config {
    pub auth_token: String,
    pub base_url: String,
    pub http_client: Option<reqwest::Client>,
}

impl Config {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Clone)]
struct MessageNewParams {
    model: String,
    max_tokens: i64,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<TextBlock>,
    messages: Vec<MessageParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolParam>,
}

#[derive(Serialize, Clone)]
struct TextBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

fn text_block(text: impl Into<String>) -> TextBlock {
    TextBlock {
        kind: "text",
        text: text.into(),
    }
}

#[derive(Serialize, Clone)]
struct MessageParam {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<TextBlock>,
        is_error: bool,
    },
}

#[derive(Serialize, Clone)]
struct ToolParam {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
    },
    MessageStop {},
    Ping {},
    Error {
        error: StreamErrorDetail,
    },
}

#[derive(Deserialize)]
struct StreamErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

/// The assistant turn as accumulated from stream events, block by block.
#[derive(Default)]
struct Accumulated {
    blocks: Vec<AccBlock>,
}

enum AccBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: String,
    },
}

impl Accumulated {
    fn start_block(&mut self, index: usize, start: BlockStart) {
        while self.blocks.len() <= index {
            self.blocks.push(AccBlock::Text(String::new()));
        }
        match start {
            BlockStart::Text { text } => self.blocks[index] = AccBlock::Text(text),
            BlockStart::ToolUse { id, name } => {
                self.blocks[index] = AccBlock::ToolUse {
                    id,
                    name,
                    input: String::new(),
                }
            }
            BlockStart::Other => {}
        }
    }

    fn apply_delta(&mut self, index: usize, delta: BlockDelta) -> Option<String> {
        while self.blocks.len() <= index {
            self.blocks.push(AccBlock::Text(String::new()));
        }
        match delta {
            BlockDelta::TextDelta { text } => {
                if let AccBlock::Text(existing) = &mut self.blocks[index] {
                    existing.push_str(&text);
                }
                Some(text)
            }
            BlockDelta::InputJsonDelta { partial_json } => {
                if let AccBlock::ToolUse { input, .. } = &mut self.blocks[index] {
                    input.push_str(&partial_json);
                }
                None
            }
            BlockDelta::Other => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.blocks.iter().all(|block| match block {
            AccBlock::Text(text) => text.is_empty(),
            AccBlock::ToolUse { .. } => false,
        })
    }

    fn assistant_message(&self) -> (MessageParam, Message) {
        let mut content = Vec::new();
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &self.blocks {
            match block {
                AccBlock::Text(chunk) => {
                    text.push_str(chunk);
                    content.push(ContentBlock::Text {
                        text: chunk.clone(),
                    });
                }
                AccBlock::ToolUse { id, name, input } => {
                    content.push(ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::from_str(input)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    });
                    tool_calls.push(proto::ToolCall {
                        id: id.clone(),
                        is_error: false,
                        function: proto::Function {
                            name: name.clone(),
                            arguments: input.clone(),
                        },
                    });
                }
            }
        }
        (
            MessageParam {
                role: "assistant",
                content,
            },
            Message {
                role: Role::Assistant,
                content: text,
                tool_calls,
            },
        )
    }

    fn tool_uses(&self) -> Vec<(String, String, String)> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                AccBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                AccBlock::Text(_) => None,
            })
            .collect()
    }
}

fn from_proto_messages(input: &[Message]) -> (Vec<TextBlock>, Vec<MessageParam>) {
    let mut system = Vec::new();
    let mut messages = Vec::new();
    for msg in input {
        match msg.role {
            // System prompts are not a role here; they ride on the
            // request's system field.
            Role::System => system.push(text_block(&msg.content)),
            Role::Tool => {
                if let Some(call) = msg.tool_calls.first() {
                    messages.push(MessageParam {
                        role: "user",
                        content: vec![ContentBlock::ToolResult {
                            tool_use_id: call.id.clone(),
                            content: vec![text_block(&msg.content)],
                            is_error: call.is_error,
                        }],
                    });
                }
            }
            Role::User => messages.push(MessageParam {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: msg.content.clone(),
                }],
            }),
            Role::Assistant => {
                let mut content = vec![ContentBlock::Text {
                    text: msg.content.clone(),
                }];
                for call in &msg.tool_calls {
                    content.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    });
                }
                messages.push(MessageParam {
                    role: "assistant",
                    content,
                });
            }
        }
    }
    (system, messages)
}

fn from_mcp_tools(tools: &std::collections::BTreeMap<String, Vec<Tool>>) -> Vec<ToolParam> {
    let mut params = Vec::new();
    for (server, server_tools) in tools {
        for tool in server_tools {
            params.push(ToolParam {
                name: format!("{server}_{}", tool.name),
                description: tool.description.clone(),
                input_schema: super::tool_parameters(&tool.input_schema),
            });
        }
    }
    params
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

    pub fn request(&self, cancel: CancellationToken, request: Request) -> AnthropicStream {
        let (system, messages) = from_proto_messages(&request.messages);
        let body = MessageNewParams {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            stream: true,
            system,
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
            tools: from_mcp_tools(&request.tools),
        };

        let err = self
            .config
            .auth_token
            .is_empty()
            .then(|| StreamError::Transport("missing API credentials".to_string()));

        let base_url = if self.config.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            self.config.base_url.trim_end_matches("/v1").to_string()
        };

        AnthropicStream {
            http: self.http.clone(),
            url: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            auth_token: self.config.auth_token.clone(),
            body,
            cancel,
            lines: None,
            acc: Accumulated::default(),
            pending: None,
            messages: request.messages,
            tool_caller: request.tool_caller,
            done: false,
            err,
        }
    }
}

pub struct AnthropicStream {
    http: reqwest::Client,
    url: String,
    auth_token: String,
    body: MessageNewParams,
    cancel: CancellationToken,
    lines: Option<LineStream>,
    acc: Accumulated,
    pending: Option<String>,
    messages: Vec<Message>,
    tool_caller: Option<ToolCaller>,
    done: bool,
    err: Option<StreamError>,
}

impl AnthropicStream {
    async fn open(&self) -> Result<LineStream, StreamError> {
        debug!(url = %self.url, model = %self.body.model, "opening messages stream");
        let builder = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.auth_token)
            .header("anthropic-version", ANTHROPIC_VERSION);

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
        self.lines = None;
        if self.acc.is_empty() {
            return;
        }
        let (wire, canonical) = self.acc.assistant_message();
        self.body.messages.push(wire);
        self.messages.push(canonical);
    }
}

#[async_trait]
impl Stream for AnthropicStream {
    async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.done {
            self.done = false;
            self.acc = Accumulated::default();
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

        loop {
            let next = match self.lines.as_mut() {
                Some(lines) => lines.next_line().await,
                None => return false,
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.finish_turn();
                    return false;
                }
                Err(err) => {
                    self.err = Some(err);
                    return false;
                }
            };
            let Some(data) = data_payload(&line) else {
                continue;
            };
            let event = match serde_json::from_str::<StreamEvent>(data) {
                Ok(event) => event,
                Err(err) => {
                    debug!(%err, data, "skipping unparseable stream event");
                    continue;
                }
            };
            match event {
                StreamEvent::ContentBlockStart {
                    index,
                    content_block,
                } => {
                    self.acc.start_block(index, content_block);
                    self.pending = None;
                    return true;
                }
                StreamEvent::ContentBlockDelta { index, delta } => {
                    self.pending = self.acc.apply_delta(index, delta);
                    return true;
                }
                StreamEvent::MessageStop {} => {
                    self.finish_turn();
                    return false;
                }
                StreamEvent::Error { error } => {
                    self.err = Some(StreamError::Transport(format!(
                        "anthropic: {}",
                        error.message
                    )));
                    return false;
                }
                StreamEvent::MessageStart { .. }
                | StreamEvent::ContentBlockStop { .. }
                | StreamEvent::MessageDelta { .. }
                | StreamEvent::Ping {} => {
                    self.pending = None;
                    return true;
                }
            }
        }
    }

    async fn current(&mut self) -> Result<Chunk, StreamError> {
        match self.pending.take() {
            Some(content) => Ok(Chunk { content }),
            None => Err(StreamError::NoContent),
        }
    }

    async fn call_tools(&mut self) -> Vec<ToolCallStatus> {
        let Some(caller) = self.tool_caller.clone() else {
            return Vec::new();
        };
        let calls = self.acc.tool_uses();
        let mut statuses = Vec::with_capacity(calls.len());
        for (id, name, input) in calls {
            let (msg, status) = call_tool(&id, &name, &input, &caller).await;
            self.body.messages.push(MessageParam {
                role: "user",
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: vec![text_block(&msg.content)],
                    is_error: status.err.is_some(),
                }],
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

    fn stream_for(request: Request) -> AnthropicStream {
        Client::new(Config::new("sk-ant-test")).request(CancellationToken::new(), request)
    }

    #[test]
    fn system_messages_ride_outside_the_role_stream() {
        let stream = stream_for(Request {
            messages: vec![Message::system("be terse"), Message::user("hi")],
            ..Request::default()
        });
        assert_eq!(stream.body.system.len(), 1);
        assert_eq!(stream.body.messages.len(), 1);
    }

    #[test]
    fn max_tokens_defaults_when_unset() {
        let stream = stream_for(Request::default());
        assert_eq!(stream.body.max_tokens, DEFAULT_MAX_TOKENS);

        let stream = stream_for(Request {
            max_tokens: Some(512),
            ..Request::default()
        });
        assert_eq!(stream.body.max_tokens, 512);
    }

    #[test]
    fn base_url_drops_trailing_v1() {
        let client = Client::new(Config {
            auth_token: "key".into(),
            base_url: "https://proxy.example.com/v1".into(),
            ..Config::default()
        });
        let stream = client.request(CancellationToken::new(), Request::default());
        assert_eq!(stream.url, "https://proxy.example.com/v1/messages");
    }

    #[test]
    fn accumulates_text_and_tool_use_blocks() {
        let mut acc = Accumulated::default();
        acc.start_block(
            0,
            serde_json::from_str(r#"{"type":"text","text":""}"#).unwrap(),
        );
        let chunk = acc.apply_delta(
            0,
            serde_json::from_str(r#"{"type":"text_delta","text":"hello"}"#).unwrap(),
        );
        assert_eq!(chunk.as_deref(), Some("hello"));

        acc.start_block(
            1,
            serde_json::from_str(r#"{"type":"tool_use","id":"tu_1","name":"fs_read"}"#).unwrap(),
        );
        acc.apply_delta(
            1,
            serde_json::from_str(r#"{"type":"input_json_delta","partial_json":"{\"path\":\"x\"}"}"#)
                .unwrap(),
        );

        let (wire, canonical) = acc.assistant_message();
        assert_eq!(wire.content.len(), 2);
        assert_eq!(canonical.content, "hello");
        assert_eq!(canonical.tool_calls.len(), 1);
        assert_eq!(canonical.tool_calls[0].function.name, "fs_read");
        assert_eq!(acc.tool_uses().len(), 1);
    }

    #[test]
    fn tool_results_round_trip_as_user_messages() {
        let thread = vec![proto::Message {
            role: Role::Tool,
            content: "file contents".into(),
            tool_calls: vec![proto::ToolCall {
                id: "tu_1".into(),
                is_error: false,
                ..Default::default()
            }],
        }];
        let (_, messages) = from_proto_messages(&thread);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
        assert!(matches!(
            &messages[0].content[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tu_1"
        ));
    }
}

//! The Cohere chat-stream adapter. The thread is translated into a chat
//! history plus a trailing user message; only text-generation events
//! yield chunks, and tool calling is not supported.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error_from_response;
use crate::proto::{Chunk, Message, Request, Role, ToolCallStatus};
use crate::stream::sse::LineStream;
use crate::stream::{Stream, StreamError};

const DEFAULT_BASE_URL: &str = "https://api.cohere.com";

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
struct ChatStreamRequest {
    model: String,
    message: String,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    chat_history: Vec<HistoryMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
}

#[derive(Serialize, Clone)]
struct HistoryMessage {
    role: &'static str,
    message: String,
}

#[derive(Deserialize)]
struct StreamedChatResponse {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    text: String,
}

fn cohere_role(role: Role) -> &'static str {
    match role {
        Role::System => "SYSTEM",
        Role::Assistant => "CHATBOT",
        _ => "USER",
    }
}

/// Splits the thread into history plus the trailing user message.
fn from_proto_messages(input: &[Message]) -> (Vec<HistoryMessage>, String) {
    let mut history: Vec<HistoryMessage> = input
        .iter()
        .map(|msg| HistoryMessage {
            role: cohere_role(msg.role),
            message: msg.content.clone(),
        })
        .collect();
    let message = history.pop().map(|last| last.message).unwrap_or_default();
    (history, message)
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

    pub fn request(&self, cancel: CancellationToken, request: Request) -> CohereStream {
        let (chat_history, message) = from_proto_messages(&request.messages);
        let body = ChatStreamRequest {
            model: request.model.clone(),
            message,
            stream: true,
            chat_history,
            temperature: request.temperature,
            p: request.top_p,
            stop_sequences: request.stop.clone(),
            max_tokens: request.max_tokens,
        };

        let err = self
            .config
            .auth_token
            .is_empty()
            .then(|| StreamError::Transport("missing API credentials".to_string()));

        let base_url = if self.config.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            self.config.base_url.clone()
        };

        CohereStream {
            http: self.http.clone(),
            url: format!("{}/v1/chat", base_url.trim_end_matches('/')),
            auth_token: self.config.auth_token.clone(),
            body,
            cancel,
            lines: None,
            generated: String::new(),
            messages: request.messages,
            done: false,
            err,
        }
    }
}

pub struct CohereStream {
    http: reqwest::Client,
    url: String,
    auth_token: String,
    body: ChatStreamRequest,
    cancel: CancellationToken,
    lines: Option<LineStream>,
    generated: String,
    messages: Vec<Message>,
    done: bool,
    err: Option<StreamError>,
}

impl CohereStream {
    async fn open(&self) -> Result<LineStream, StreamError> {
        debug!(url = %self.url, model = %self.body.model, "opening chat stream");
        let builder = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.auth_token);
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
}

#[async_trait]
impl Stream for CohereStream {
    async fn next(&mut self) -> bool {
        if self.err.is_some() || self.done {
            return false;
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
                self.done = true;
                return Err(StreamError::NoContent);
            }
            Err(err) => return Err(StreamError::Transport(format!("cohere: {err}"))),
        };
        if line.is_empty() {
            return Err(StreamError::NoContent);
        }

        let event: StreamedChatResponse =
            serde_json::from_str(&line).map_err(|err| {
                StreamError::Transport(format!("cohere: {err}"))
            })?;
        match event.event_type.as_str() {
            "text-generation" => {
                self.generated.push_str(&event.text);
                Ok(Chunk {
                    content: event.text,
                })
            }
            "stream-end" => {
                self.done = true;
                Err(StreamError::NoContent)
            }
            _ => Err(StreamError::NoContent),
        }
    }

    // Cohere chat-stream has no tool-calling surface here.
    async fn call_tools(&mut self) -> Vec<ToolCallStatus> {
        Vec::new()
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.cancel.cancel();
        self.done = true;
        self.lines = None;
        Ok(())
    }

    fn err(&self) -> Option<StreamError> {
        self.err.clone()
    }

    fn messages(&self) -> Vec<Message> {
        let mut messages = self.messages.clone();
        if !self.generated.is_empty() {
            messages.push(Message::assistant(&self.generated));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_splits_into_history_and_message() {
        let (history, message) = from_proto_messages(&[
            Message::system("rules"),
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("last"),
        ]);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, "SYSTEM");
        assert_eq!(history[2].role, "CHATBOT");
        assert_eq!(message, "last");
    }

    #[test]
    fn generated_text_lands_in_messages() {
        let client = Client::new(Config::new("co-test"));
        let mut stream = client.request(
            CancellationToken::new(),
            Request {
                messages: vec![Message::user("hi")],
                ..Request::default()
            },
        );
        stream.generated = "hello there".to_string();
        let messages = stream.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "hello there");
    }

    #[test]
    fn stream_events_decode() {
        let event: StreamedChatResponse =
            serde_json::from_str(r#"{"event_type":"text-generation","text":"hi"}"#).unwrap();
        assert_eq!(event.event_type, "text-generation");
        assert_eq!(event.text, "hi");
    }
}

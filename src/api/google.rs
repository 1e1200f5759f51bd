//! The Google Gemini `generateContent` SSE adapter. The URL carries the
//! model and the API key; only system and user messages survive the
//! translation, and tool calling is not supported.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error_from_response;
use crate::proto::{Chunk, Message, Request, Role, ToolCallStatus};
use crate::stream::sse::{data_payload, event_name, LineStream};
use crate::stream::{Stream, StreamError};

/// Heartbeat lines tolerated before the stream is declared broken.
const EMPTY_MESSAGES_LIMIT: u32 = 300;

#[derive(Clone, Default)]
pub struct Config {
    pub base_url: String,
    pub http_client: Option<reqwest::Client>,
    pub thinking_budget: i64,
}

impl Config {
    pub fn new(model: &str, auth_token: &str) -> Self {
        Self {
            base_url: format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:streamGenerateContent?alt=sse&key={auth_token}"
            ),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Clone)]
struct Part {
    #[serde(skip_serializing_if = "String::is_empty")]
    text: String,
}

#[derive(Serialize, Clone)]
struct Content {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parts: Vec<Part>,
    #[serde(skip_serializing_if = "String::is_empty")]
    role: String,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i64,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    candidate_count: u32,
    max_output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
struct MessageCompletionRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct CompletionMessageResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Deserialize, Default)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

// Gemini knows no system role; system and user messages both flatten to
// user-role parts and everything else is dropped.
fn from_proto_messages(input: &[Message]) -> Vec<Content> {
    let mut contents = Vec::new();
    for msg in input {
        match msg.role {
            Role::System | Role::User => contents.push(Content {
                parts: vec![Part {
                    text: msg.content.clone(),
                }],
                role: "user".to_string(),
            }),
            Role::Assistant | Role::Tool => {}
        }
    }
    contents
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

    pub fn request(&self, cancel: CancellationToken, request: Request) -> GoogleStream {
        let mut generation_config = GenerationConfig {
            stop_sequences: request.stop.clone(),
            candidate_count: 1,
            max_output_tokens: 4096,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            thinking_config: None,
        };
        if let Some(max_tokens) = request.max_tokens {
            generation_config.max_output_tokens = max_tokens.max(0) as u64;
        }
        if self.config.thinking_budget != 0 {
            generation_config.thinking_config = Some(ThinkingConfig {
                thinking_budget: self.config.thinking_budget,
            });
        }

        GoogleStream {
            http: self.http.clone(),
            url: self.config.base_url.clone(),
            body: MessageCompletionRequest {
                contents: from_proto_messages(&request.messages),
                generation_config,
            },
            cancel,
            lines: None,
            finished: false,
            err: None,
        }
    }
}

pub struct GoogleStream {
    http: reqwest::Client,
    url: String,
    body: MessageCompletionRequest,
    cancel: CancellationToken,
    lines: Option<LineStream>,
    finished: bool,
    err: Option<StreamError>,
}

impl GoogleStream {
    async fn open(&self) -> Result<LineStream, StreamError> {
        debug!("opening generateContent stream");
        let builder = self
            .http
            .post(&self.url)
            .header("content-type", "application/json");
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
impl Stream for GoogleStream {
    async fn next(&mut self) -> bool {
        if self.err.is_some() || self.finished {
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
        let mut empty_messages: u32 = 0;
        let mut has_error = false;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    // End of stream, not an error.
                    self.finished = true;
                    return Err(StreamError::NoContent);
                }
                Err(err) => return Err(err),
            };

            // An `event: error` marker means the next data line carries
            // the error body.
            if event_name(&line) == Some("error") {
                has_error = true;
                continue;
            }

            let payload = data_payload(&line);
            if payload.is_none() || has_error {
                if has_error {
                    let body = payload.unwrap_or(line.as_str());
                    return Err(StreamError::Transport(format!(
                        "google stream error: {body}"
                    )));
                }
                empty_messages += 1;
                if empty_messages > EMPTY_MESSAGES_LIMIT {
                    return Err(StreamError::TooManyEmptyMessages);
                }
                continue;
            }

            let chunk: CompletionMessageResponse = serde_json::from_str(
                payload.expect("payload is a data line"),
            )
            .map_err(StreamError::transport)?;
            let Some(candidate) = chunk.candidates.first() else {
                return Err(StreamError::NoContent);
            };
            let Some(part) = candidate.content.parts.first() else {
                return Err(StreamError::NoContent);
            };
            return Ok(Chunk {
                content: part.text.clone(),
            });
        }
    }

    // Gemini does not support tool calling, and it cannot round-trip the
    // thread after the fact.
    async fn call_tools(&mut self) -> Vec<ToolCallStatus> {
        Vec::new()
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
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_embeds_model_and_key() {
        let config = Config::new("gemini-2.0-flash", "AIza-test");
        assert!(config.base_url.contains("models/gemini-2.0-flash:streamGenerateContent"));
        assert!(config.base_url.ends_with("key=AIza-test"));
    }

    #[test]
    fn only_system_and_user_roles_survive() {
        let contents = from_proto_messages(&[
            Message::system("rules"),
            Message::user("question"),
            Message::assistant("answer"),
        ]);
        assert_eq!(contents.len(), 2);
        assert!(contents.iter().all(|content| content.role == "user"));
    }

    #[test]
    fn frames_decode_candidate_text() {
        let frame: CompletionMessageResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"hi"}],"role":"model"}}]}"#,
        )
        .unwrap();
        assert_eq!(frame.candidates[0].content.parts[0].text, "hi");
    }

    #[tokio::test]
    async fn tool_calls_are_unsupported() {
        let client = Client::new(Config::new("gemini-2.0-flash", "key"));
        let mut stream = client.request(CancellationToken::new(), Request::default());
        assert!(stream.call_tools().await.is_empty());
        assert!(stream.messages().is_empty());
    }
}

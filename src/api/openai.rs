//! The OpenAI chat-completions adapter, also serving Azure OpenAI,
//! Azure-AD, LocalAI, Groq, and Perplexity endpoints.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    error_from_response, from_mcp_tools, from_proto_messages, ChatAccumulator, ChatMessage,
    ChatRequest, ChatResponse, ChatResponseFormat,
};
use crate::proto::{Chunk, Message, Request, ResponseFormat, ToolCallStatus, ToolCaller};
use crate::stream::sse::{data_payload, LineStream};
use crate::stream::{call_tool, Stream, StreamError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone, Default)]
pub struct Config {
    pub auth_token: String,
    pub base_url: String,
    /// "", "azure", or "azure-ad". The Azure flavors authenticate with an
    /// `api-key` header instead of a bearer token.
    pub api_type: String,
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

pub struct Client {
    http: reqwest::Client,
    config: Config,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let http = config.http_client.clone().unwrap_or_default();
        Self { http, config }
    }

    pub fn request(&self, cancel: CancellationToken, request: Request) -> OpenAiStream {
        let mut body = ChatRequest {
            model: request.model.clone(),
            messages: from_proto_messages(&request.messages),
            stream: true,
            user: request.user.clone(),
            tools: from_mcp_tools(&request.tools),
            ..ChatRequest::default()
        };

        // Perplexity "online" models reject sampling parameters.
        let suppress_sampling =
            request.api == "perplexity" && request.model.contains("online");
        if !suppress_sampling {
            body.temperature = request.temperature;
            body.top_p = request.top_p;
            if !request.stop.is_empty() {
                body.stop = Some(request.stop.clone());
            }
            body.max_tokens = request.max_tokens;
            if request.api == "openai"
                && request.response_format == Some(ResponseFormat::Json)
            {
                body.response_format = Some(ChatResponseFormat::json_object());
            }
        }

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

        OpenAiStream {
            http: self.http.clone(),
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            auth_token: self.config.auth_token.clone(),
            azure_auth: self.config.api_type.starts_with("azure"),
            body,
            cancel,
            lines: None,
            acc: ChatAccumulator::default(),
            pending: None,
            messages: request.messages,
            tool_caller: request.tool_caller,
            done: false,
            err,
        }
    }
}

pub struct OpenAiStream {
    http: reqwest::Client,
    url: String,
    auth_token: String,
    azure_auth: bool,
    /// The live request body; tool results are appended here so the
    /// reopened stream carries the full context.
    body: ChatRequest,
    cancel: CancellationToken,
    lines: Option<LineStream>,
    acc: ChatAccumulator,
    pending: Option<String>,
    messages: Vec<Message>,
    tool_caller: Option<ToolCaller>,
    done: bool,
    err: Option<StreamError>,
}

impl OpenAiStream {
    async fn open(&self) -> Result<LineStream, StreamError> {
        debug!(url = %self.url, model = %self.body.model, "opening chat completion stream");
        let mut builder = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json");
        builder = if self.azure_auth {
            builder.header("api-key", &self.auth_token)
        } else {
            builder.bearer_auth(&self.auth_token)
        };

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
impl Stream for OpenAiStream {
    async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.done {
            self.done = false;
            self.acc = ChatAccumulator::default();
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
            if data == "[DONE]" {
                self.finish_turn();
                return false;
            }
            match serde_json::from_str::<ChatResponse>(data) {
                Ok(response) => {
                    self.pending = response.choices.first().map(|choice| {
                        self.acc.add_delta(&choice.delta);
                        choice.delta.content.clone().unwrap_or_default()
                    });
                    return true;
                }
                Err(err) => {
                    debug!(%err, data, "skipping unparseable stream frame");
                    continue;
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
        let calls = self.acc.calls().to_vec();
        let mut statuses = Vec::with_capacity(calls.len());
        for call in calls {
            let (msg, status) = call_tool(&call.id, &call.name, &call.arguments, &caller).await;
            self.body
                .messages
                .push(ChatMessage::tool(&msg.content, &call.id));
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
    use crate::proto::Message as ProtoMessage;

    fn stream_for(request: Request) -> OpenAiStream {
        Client::new(Config::new("sk-test")).request(CancellationToken::new(), request)
    }

    #[test]
    fn blank_tokens_fail_cleanly() {
        let stream =
            Client::new(Config::default()).request(CancellationToken::new(), Request::default());
        assert!(stream.err().is_some());
    }

    #[test]
    fn perplexity_online_models_suppress_sampling() {
        let stream = stream_for(Request {
            api: "perplexity".into(),
            model: "sonar-online".into(),
            temperature: Some(0.7),
            max_tokens: Some(100),
            ..Request::default()
        });
        assert!(stream.body.temperature.is_none());
        assert!(stream.body.max_tokens.is_none());
    }

    #[test]
    fn json_format_only_applies_to_openai() {
        let openai = stream_for(Request {
            api: "openai".into(),
            model: "gpt-4o".into(),
            response_format: Some(ResponseFormat::Json),
            ..Request::default()
        });
        assert!(openai.body.response_format.is_some());

        let groq = stream_for(Request {
            api: "groq".into(),
            model: "llama3".into(),
            response_format: Some(ResponseFormat::Json),
            ..Request::default()
        });
        assert!(groq.body.response_format.is_none());
    }

    #[test]
    fn base_url_defaults_and_joins() {
        let stream = stream_for(Request::default());
        assert_eq!(stream.url, "https://api.openai.com/v1/chat/completions");

        let client = Client::new(Config {
            auth_token: "key".into(),
            base_url: "http://localhost:8080/v1/".into(),
            ..Config::default()
        });
        let stream = client.request(CancellationToken::new(), Request::default());
        assert_eq!(stream.url, "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn request_carries_prior_messages() {
        let stream = stream_for(Request {
            messages: vec![ProtoMessage::user("hello")],
            ..Request::default()
        });
        assert_eq!(stream.body.messages.len(), 1);
        assert_eq!(stream.messages().len(), 1);
    }
}

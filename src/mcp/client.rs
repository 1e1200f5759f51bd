//! An ephemeral MCP client: started fresh for every enumeration or tool
//! invocation, closed right after. Three transports, selected by the
//! server's configured type.

use std::process::Stdio;
use std::time::Duration;

use reqwest::Url;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{
    initialize_params, CallToolResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, Tool,
};
use crate::core::config::McpServerConfig;
use crate::stream::sse::{data_payload, event_name, LineStream};

const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;

pub struct McpClient {
    transport: Transport,
    next_id: i64,
}

enum Transport {
    Stdio(StdioTransport),
    Sse(SseTransport),
    Http(HttpTransport),
}

impl McpClient {
    /// Spawns or connects the configured transport. The caller owns the
    /// lifecycle and must [`McpClient::close`] even on error paths.
    pub async fn start(config: &McpServerConfig) -> Result<Self, String> {
        let transport = match config.kind.as_str() {
            "" | "stdio" => Transport::Stdio(StdioTransport::spawn(config)?),
            "sse" => Transport::Sse(SseTransport::connect(config).await?),
            "http" => Transport::Http(HttpTransport::new(config)?),
            other => {
                return Err(format!(
                    "unsupported MCP server type: {other:?}, supported types are: stdio, sse, http"
                ))
            }
        };
        Ok(Self {
            transport,
            next_id: 0,
        })
    }

    pub async fn initialize(&mut self) -> Result<(), String> {
        let id = self.next_id();
        self.request(JsonRpcRequest::new(id, "initialize", initialize_params()))
            .await?;
        self.notify(JsonRpcNotification::new("notifications/initialized"))
            .await
    }

    pub async fn list_tools(&mut self) -> Result<Vec<Tool>, String> {
        let id = self.next_id();
        let result = self
            .request(JsonRpcRequest::new(id, "tools/list", Value::Null))
            .await?;
        serde_json::from_value::<ListToolsResult>(result)
            .map(|list| list.tools)
            .map_err(|err| err.to_string())
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, String> {
        let id = self.next_id();
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        let result = self
            .request(JsonRpcRequest::new(id, "tools/call", params))
            .await?;
        serde_json::from_value(result).map_err(|err| err.to_string())
    }

    pub async fn close(&mut self) {
        if let Transport::Stdio(stdio) = &mut self.transport {
            let _ = stdio.child.start_kill();
        }
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn request(&mut self, request: JsonRpcRequest) -> Result<Value, String> {
        debug!(method = request.method, id = request.id, "sending MCP request");
        match &mut self.transport {
            Transport::Stdio(stdio) => stdio.request(&request).await,
            Transport::Sse(sse) => sse.request(&request).await,
            Transport::Http(http) => http.request(&request).await,
        }
    }

    async fn notify(&mut self, notification: JsonRpcNotification) -> Result<(), String> {
        match &mut self.transport {
            Transport::Stdio(stdio) => stdio.notify(&notification).await,
            Transport::Sse(sse) => sse.notify(&notification).await,
            Transport::Http(http) => http.notify(&notification).await,
        }
    }
}

fn finish(response: JsonRpcResponse) -> Result<Value, String> {
    if let Some(error) = response.error {
        return Err(error.to_string());
    }
    Ok(response.result.unwrap_or(Value::Null))
}

fn build_http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
        .build()
        .map_err(|err| format!("failed to build HTTP client: {err}"))
}

/// Child process speaking line-delimited JSON-RPC over its stdio.
struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl StdioTransport {
    fn spawn(config: &McpServerConfig) -> Result<Self, String> {
        if config.command.is_empty() {
            return Err("MCP command is required for the stdio transport.".to_string());
        }
        debug!(command = %config.command, args = ?config.args, "starting MCP stdio server");
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| err.to_string())?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "unable to retrieve stdin".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "unable to retrieve stdout".to_string())?;
        Ok(Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        })
    }

    async fn write_line(&mut self, payload: &str) -> Result<(), String> {
        self.stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| err.to_string())?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|err| err.to_string())?;
        self.stdin.flush().await.map_err(|err| err.to_string())
    }

    async fn request(&mut self, request: &JsonRpcRequest) -> Result<Value, String> {
        let payload = serde_json::to_string(request).map_err(|err| err.to_string())?;
        self.write_line(&payload).await?;
        while let Some(line) = self
            .lines
            .next_line()
            .await
            .map_err(|err| err.to_string())?
        {
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
                continue;
            };
            if response.answers(request.id) {
                return finish(response);
            }
        }
        Err("MCP server closed the stream before responding.".to_string())
    }

    async fn notify(&mut self, notification: &JsonRpcNotification) -> Result<(), String> {
        let payload = serde_json::to_string(notification).map_err(|err| err.to_string())?;
        self.write_line(&payload).await
    }
}

/// Server-sent events: one long-lived GET stream carries responses, while
/// requests are POSTed to the endpoint the server announces on connect.
struct SseTransport {
    http: reqwest::Client,
    events: LineStream,
    endpoint: Url,
}

impl SseTransport {
    async fn connect(config: &McpServerConfig) -> Result<Self, String> {
        if config.url.is_empty() {
            return Err("MCP url is required for the sse transport.".to_string());
        }
        let http = build_http_client()?;
        let base = Url::parse(&config.url).map_err(|err| err.to_string())?;
        let response = http
            .get(base.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|err| err.to_string())?
            .error_for_status()
            .map_err(|err| err.to_string())?;

        let mut events = LineStream::new(response, CancellationToken::new());
        let mut in_endpoint_event = false;
        while let Some(line) = events.next_line().await.map_err(|err| err.to_string())? {
            if let Some(name) = event_name(&line) {
                in_endpoint_event = name == "endpoint";
                continue;
            }
            if let Some(data) = data_payload(&line) {
                if in_endpoint_event {
                    let endpoint = base.join(data).map_err(|err| err.to_string())?;
                    return Ok(Self {
                        http,
                        events,
                        endpoint,
                    });
                }
            }
        }
        Err("MCP SSE server never announced its message endpoint.".to_string())
    }

    async fn request(&mut self, request: &JsonRpcRequest) -> Result<Value, String> {
        self.post(request).await?;
        while let Some(line) = self
            .events
            .next_line()
            .await
            .map_err(|err| err.to_string())?
        {
            let Some(data) = data_payload(&line) else {
                continue;
            };
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(data) else {
                continue;
            };
            if response.answers(request.id) {
                return finish(response);
            }
        }
        Err("MCP SSE stream ended before responding.".to_string())
    }

    async fn notify(&mut self, notification: &JsonRpcNotification) -> Result<(), String> {
        self.post(notification).await
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<(), String> {
        self.http
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|err| err.to_string())?
            .error_for_status()
            .map_err(|err| err.to_string())?;
        Ok(())
    }
}

/// Streamable HTTP: every request is a POST; the response body is either
/// plain JSON or a short SSE stream. The server's session id header is
/// echoed back on subsequent requests.
struct HttpTransport {
    http: reqwest::Client,
    url: String,
    session_id: Option<String>,
}

impl HttpTransport {
    fn new(config: &McpServerConfig) -> Result<Self, String> {
        if config.url.is_empty() {
            return Err("MCP url is required for the http transport.".to_string());
        }
        Ok(Self {
            http: build_http_client()?,
            url: config.url.clone(),
            session_id: None,
        })
    }

    fn builder(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = &self.session_id {
            builder = builder.header("mcp-session-id", session_id);
        }
        builder
    }

    async fn request(&mut self, request: &JsonRpcRequest) -> Result<Value, String> {
        let response = self
            .builder(request)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        if let Some(session_id) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|value| value.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let mut events = LineStream::new(response, CancellationToken::new());
            while let Some(line) = events.next_line().await.map_err(|err| err.to_string())? {
                let Some(data) = data_payload(&line) else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(data) else {
                    continue;
                };
                if parsed.answers(request.id) {
                    return finish(parsed);
                }
            }
            return Err("MCP HTTP stream ended before responding.".to_string());
        }

        let body = response.bytes().await.map_err(|err| err.to_string())?;
        let parsed =
            serde_json::from_slice::<JsonRpcResponse>(&body).map_err(|err| err.to_string())?;
        finish(parsed)
    }

    async fn notify(&mut self, notification: &JsonRpcNotification) -> Result<(), String> {
        let response = self
            .builder(notification)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        Ok(())
    }
}

//! The session coordinator: a small state machine that resolves cache
//! operations, assembles the request, drives the provider stream through
//! tool rounds, applies the retry-and-fallback policy, and persists the
//! finished conversation.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{anthropic, cohere, google, ollama, openai, ApiError};
use crate::core::config::{Api, Config, Model};
use crate::error::{user_error, ModsError};
use crate::load::load_msg;
use crate::mcp;
use crate::proto::{render_conversation, Message, Request, ResponseFormat, Role, ToolCaller};
use crate::sha::{looks_like_sha1, new_conversation_id, SHA1_SHORT};
use crate::store::cache::Conversations;
use crate::store::db::{ConvoDb, DbError};
use crate::stream::{Stream, StreamError};
use crate::term::is_input_tty;

const TAB_WIDTH: usize = 1;

/// Coordinator states, advanced in order by [`Mods::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    ConfigLoaded,
    Request,
    Response,
    Done,
    Error,
}

/// What a finished run amounts to, which decides whether to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A completion ran; the conversation may be saved.
    Completed,
    /// A stored conversation was printed.
    Shown,
    /// Nothing to do: no input and no prompt arguments.
    NoInput,
}

enum CompletionError {
    Fatal(anyhow::Error),
    Retry {
        content: String,
        reason: anyhow::Error,
    },
}

pub struct Mods {
    pub output: String,
    pub input: String,
    pub state: State,
    pub messages: Vec<Message>,
    pub config: Config,
    retries: u32,
    db: ConvoDb,
    cache: Conversations,
    cancel: CancellationToken,
}

impl Mods {
    pub fn new(
        config: Config,
        db: ConvoDb,
        cache: Conversations,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            output: String::new(),
            input: String::new(),
            state: State::Start,
            messages: Vec::new(),
            config,
            retries: 0,
            db,
            cache,
            cancel,
        }
    }

    pub async fn run(&mut self) -> Result<RunOutcome, anyhow::Error> {
        let result = self.run_inner().await;
        if result.is_err() {
            self.state = State::Error;
        }
        result
    }

    async fn run_inner(&mut self) -> Result<RunOutcome, anyhow::Error> {
        self.resolve_cache_ops()?;
        self.read_stdin()?;

        if self.input.is_empty()
            && self.config.prefix.is_empty()
            && self.config.show.is_empty()
            && !self.config.show_last
        {
            self.state = State::Done;
            return Ok(RunOutcome::NoInput);
        }

        if !self.config.show.is_empty() || self.config.show_last {
            let messages = self
                .cache
                .read(&self.config.cache_read_from_id)
                .map_err(|err| ModsError::new("There was an error loading the conversation.", err))?;
            let rendered = render_conversation(&messages);
            self.append_output(&rendered);
            self.state = State::Done;
            return Ok(RunOutcome::Shown);
        }

        if self.config.include_prompt_args && !self.config.prefix.is_empty() {
            let preamble = format!("{}\n\n", self.config.prefix);
            self.append_output(&preamble);
        }
        if self.config.include_prompt != 0 && !self.input.is_empty() {
            let mut lines: Vec<&str> = self.input.split('\n').collect();
            if self.config.include_prompt > 0 && lines.len() > self.config.include_prompt as usize {
                lines.truncate(self.config.include_prompt as usize);
            }
            let preamble = format!("{}\n", lines.join("\n"));
            self.append_output(&preamble);
        }

        self.state = State::Request;
        let content = self.input.clone();
        self.start_completion(content).await?;
        self.state = State::Done;
        Ok(RunOutcome::Completed)
    }

    /// Determines which conversation to read from and write to: explicit
    /// ids or titles first, HEAD when continuing the last conversation,
    /// a freshly minted id otherwise. A resolved row also donates its
    /// API and model.
    fn resolve_cache_ops(&mut self) -> Result<(), anyhow::Error> {
        let cfg = &self.config;
        let continue_last =
            cfg.continue_last || (!cfg.continue_from.is_empty() && cfg.title.is_empty());
        let mut read_id = first_non_empty(&cfg.continue_from, &cfg.show);
        let mut write_id = first_non_empty(&cfg.title, &cfg.continue_from);
        let title = write_id.clone();
        let mut api = cfg.api.clone();
        let mut model = cfg.model.clone();

        if !read_id.is_empty() || continue_last || cfg.show_last {
            let found = self
                .find_read_id(&read_id)
                .map_err(|err| ModsError::new("Could not find the conversation.", err))?;
            if let Some(found) = found {
                read_id = found.id;
                if let (Some(found_api), Some(found_model)) = (found.api, found.model) {
                    api = found_api;
                    model = found_model;
                }
            }
        }

        if continue_last {
            write_id = read_id.clone();
        }
        if write_id.is_empty() {
            write_id = new_conversation_id();
        }
        if !looks_like_sha1(&write_id) {
            // A title was given: continue that conversation if it
            // exists, otherwise this is a new one.
            write_id = match self.db.find(&write_id) {
                Ok(convo) => convo.id,
                Err(_) => new_conversation_id(),
            };
        }

        let cfg = &mut self.config;
        cfg.cache_write_to_id = write_id;
        cfg.cache_write_to_title = title;
        cfg.cache_read_from_id = read_id;
        cfg.api = api;
        cfg.model = model;
        self.state = State::ConfigLoaded;
        Ok(())
    }

    fn find_read_id(&self, input: &str) -> Result<Option<crate::store::db::Conversation>, DbError> {
        match self.db.find(input) {
            Ok(convo) => Ok(Some(convo)),
            Err(DbError::NoMatches(_)) if self.config.show.is_empty() => {
                self.db.find_head().map(Some)
            }
            Err(err) => Err(err),
        }
    }

    /// Piped stdin becomes prompt content, indented by one tab.
    fn read_stdin(&mut self) -> Result<(), anyhow::Error> {
        if is_input_tty() {
            return Ok(());
        }
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .map_err(|err| ModsError::new("Could not read stdin.", err))?;
        let content = increase_indent(&content);
        if !content.trim().is_empty() {
            self.input = content;
        }
        Ok(())
    }

    async fn start_completion(&mut self, content: String) -> Result<(), anyhow::Error> {
        let mut content = content;
        loop {
            match self.complete_once(&content).await {
                Ok(()) => return Ok(()),
                Err(CompletionError::Fatal(err)) => return Err(err),
                Err(CompletionError::Retry {
                    content: next_content,
                    reason,
                }) => {
                    self.retries += 1;
                    if self.retries >= self.config.max_retries {
                        return Err(reason);
                    }
                    let wait = Duration::from_millis(100 * 2u64.pow(self.retries));
                    debug!(retries = self.retries, ?wait, "retrying after API error");
                    tokio::time::sleep(wait).await;
                    content = next_content;
                }
            }
        }
    }

    async fn complete_once(&mut self, content: &str) -> Result<(), CompletionError> {
        let (api, mut model) = self.resolve_model().map_err(CompletionError::Fatal)?;
        self.config.api = model.api.clone();

        if model.max_chars == 0 {
            model.max_chars = self.config.max_input_chars;
        }
        // o1 models reject max_tokens.
        if model.name.starts_with("o1") {
            self.config.max_tokens = 0;
        }

        let http_client = self.proxy_client().map_err(CompletionError::Fatal)?;

        let tools = mcp::mcp_tools(&self.config)
            .await
            .map_err(|err| CompletionError::Fatal(err.into()))?;

        self.setup_stream_context(content, &model)
            .await
            .map_err(CompletionError::Fatal)?;

        let mut request = Request {
            messages: self.messages.clone(),
            api: model.api.clone(),
            model: model.name.clone(),
            user: (!self.config.user.is_empty()).then(|| self.config.user.clone()),
            tools,
            temperature: opt_f64(self.config.temp),
            top_p: opt_f64(self.config.topp),
            top_k: opt_i64(self.config.topk),
            stop: self.config.stop.clone(),
            max_tokens: (self.config.max_tokens > 0).then_some(self.config.max_tokens),
            response_format: (self.config.format && self.config.format_as == "json")
                .then_some(ResponseFormat::Json),
            tool_caller: Some(self.tool_caller()),
        };

        let stream = self
            .open_stream(&api, &model, &mut request, http_client)
            .map_err(CompletionError::Fatal)?;

        self.receive_completion_stream(stream, &model, content).await
    }

    fn open_stream(
        &mut self,
        api: &Api,
        model: &Model,
        request: &mut Request,
        http_client: Option<reqwest::Client>,
    ) -> Result<Box<dyn Stream>, anyhow::Error> {
        let cancel = self.cancel.child_token();
        let stream: Box<dyn Stream> = match model.api.as_str() {
            "ollama" => {
                let mut config = ollama::Config::default();
                if !api.base_url.is_empty() {
                    config.base_url = api.base_url.clone();
                }
                config.http_client = http_client;
                Box::new(ollama::Client::new(config).request(cancel, request.clone()))
            }
            "anthropic" => {
                let key = self
                    .ensure_key(api, "ANTHROPIC_API_KEY", "https://console.anthropic.com/settings/keys")
                    .map_err(|err| ModsError::new("Anthropic authentication failed.", err))?;
                let mut config = anthropic::Config::new(key);
                config.base_url = api.base_url.clone();
                config.http_client = http_client;
                Box::new(anthropic::Client::new(config).request(cancel, request.clone()))
            }
            "google" => {
                let key = self
                    .ensure_key(api, "GOOGLE_API_KEY", "https://aistudio.google.com/app/apikey")
                    .map_err(|err| ModsError::new("Google authentication failed.", err))?;
                let mut config = google::Config::new(&model.name, &key);
                config.thinking_budget = model.thinking_budget;
                config.http_client = http_client;
                Box::new(google::Client::new(config).request(cancel, request.clone()))
            }
            "cohere" => {
                let key = self
                    .ensure_key(api, "COHERE_API_KEY", "https://dashboard.cohere.com/api-keys")
                    .map_err(|err| ModsError::new("Cohere authentication failed.", err))?;
                let mut config = cohere::Config::new(key);
                config.base_url = api.base_url.clone();
                config.http_client = http_client;
                Box::new(cohere::Client::new(config).request(cancel, request.clone()))
            }
            "azure" | "azure-ad" => {
                let key = self
                    .ensure_key(api, "AZURE_OPENAI_KEY", "https://aka.ms/oai/access")
                    .map_err(|err| ModsError::new("Azure authentication failed.", err))?;
                if !api.user.is_empty() {
                    self.config.user = api.user.clone();
                    request.user = Some(api.user.clone());
                }
                let config = openai::Config {
                    auth_token: key,
                    base_url: api.base_url.clone(),
                    api_type: model.api.clone(),
                    http_client,
                };
                Box::new(openai::Client::new(config).request(cancel, request.clone()))
            }
            _ => {
                let key = self
                    .ensure_key(api, "OPENAI_API_KEY", "https://platform.openai.com/account/api-keys")
                    .map_err(|err| ModsError::new("OpenAI authentication failed.", err))?;
                let config = openai::Config {
                    auth_token: key,
                    base_url: api.base_url.clone(),
                    api_type: String::new(),
                    http_client,
                };
                Box::new(openai::Client::new(config).request(cancel, request.clone()))
            }
        };
        Ok(stream)
    }

    /// Pulls chunks, and at end-of-turn runs tools and resumes until the
    /// model stops calling them.
    async fn receive_completion_stream(
        &mut self,
        mut stream: Box<dyn Stream>,
        model: &Model,
        content: &str,
    ) -> Result<(), CompletionError> {
        loop {
            if stream.next().await {
                match stream.current().await {
                    Ok(chunk) => {
                        if !chunk.content.is_empty() {
                            self.state = State::Response;
                        }
                        self.append_output(&chunk.content);
                    }
                    Err(err) if err.is_no_content() => {}
                    Err(err) => {
                        let _ = stream.close().await;
                        return Err(self.handle_request_error(err, model, content));
                    }
                }
                continue;
            }

            if let Some(err) = stream.err() {
                let _ = stream.close().await;
                return Err(self.handle_request_error(err, model, content));
            }

            let statuses = stream.call_tools().await;
            if statuses.is_empty() {
                self.messages = stream.messages();
                let _ = stream.close().await;
                return Ok(());
            }
            for status in &statuses {
                let rendered = status.to_string();
                self.append_output(&rendered);
            }
        }
    }

    fn handle_request_error(
        &mut self,
        err: StreamError,
        model: &Model,
        content: &str,
    ) -> CompletionError {
        match err {
            StreamError::Api(api_err) => self.handle_api_error(api_err, model, content),
            other => CompletionError::Fatal(
                ModsError::new(
                    format!("There was a problem with the {} API request.", model.api),
                    other,
                )
                .into(),
            ),
        }
    }

    fn handle_api_error(
        &mut self,
        err: ApiError,
        model: &Model,
        content: &str,
    ) -> CompletionError {
        let api = &model.api;
        match err.status {
            404 => {
                if !model.fallback.is_empty() {
                    self.config.model = model.fallback.clone();
                    return CompletionError::Retry {
                        content: content.to_string(),
                        reason: ModsError::new(format!("{api} API server error."), err).into(),
                    };
                }
                CompletionError::Fatal(
                    ModsError::new(
                        format!(
                            "API '{}' is missing the model '{}'.",
                            self.config.api, self.config.model
                        ),
                        err,
                    )
                    .into(),
                )
            }
            400 if err.code.as_deref() == Some("context_length_exceeded") => {
                let reason: anyhow::Error =
                    ModsError::new("Maximum prompt size exceeded.", err.clone()).into();
                if self.config.no_limit {
                    return CompletionError::Fatal(reason);
                }
                CompletionError::Retry {
                    content: cut_prompt(&err.message, content),
                    reason,
                }
            }
            400 => CompletionError::Fatal(
                ModsError::new(format!("{api} API request error."), err).into(),
            ),
            401 => CompletionError::Fatal(
                ModsError::new(format!("Invalid {api} API key."), err).into(),
            ),
            429 => CompletionError::Retry {
                content: content.to_string(),
                reason: ModsError::new(
                    format!("You've hit your {api} API rate limit."),
                    err,
                )
                .into(),
            },
            500 if api == "openai" => CompletionError::Retry {
                content: content.to_string(),
                reason: ModsError::new("OpenAI API server error.", err).into(),
            },
            500 => CompletionError::Fatal(
                ModsError::new(
                    format!("Error loading model '{}' for API '{}'.", model.name, api),
                    err,
                )
                .into(),
            ),
            _ => CompletionError::Retry {
                content: content.to_string(),
                reason: ModsError::new("Unknown API error.", err).into(),
            },
        }
    }

    /// Builds the message thread for one request: format and role system
    /// messages, then prior history, then the (prefixed, truncated) user
    /// content.
    async fn setup_stream_context(
        &mut self,
        content: &str,
        model: &Model,
    ) -> Result<(), anyhow::Error> {
        let cfg = &self.config;
        self.messages = Vec::new();

        if cfg.format {
            if let Some(text) = cfg.format_text.get(&cfg.format_as) {
                if !text.is_empty() {
                    self.messages.push(Message::system(text));
                }
            }
        }

        if !cfg.role.is_empty() {
            let Some(role_setup) = cfg.roles.get(&cfg.role).cloned() else {
                return Err(ModsError::new(
                    "Could not use role.",
                    user_error(format!("Role {:?} does not exist.", cfg.role)),
                )
                .into());
            };
            for entry in role_setup {
                let loaded = load_msg(&entry)
                    .await
                    .map_err(|err| ModsError::new("Could not use role.", err))?;
                self.messages.push(Message::system(loaded));
            }
        }

        let mut content = content.to_string();
        if !self.config.prefix.is_empty() {
            content = format!("{}\n\n{}", self.config.prefix, content)
                .trim()
                .to_string();
        }
        if !self.config.no_limit && content.len() as i64 > model.max_chars {
            content = truncate_at_boundary(&content, model.max_chars.max(0) as usize);
        }

        if !self.config.no_cache && !self.config.cache_read_from_id.is_empty() {
            self.messages = self
                .cache
                .read(&self.config.cache_read_from_id)
                .map_err(|err| {
                    ModsError::new(
                        "There was a problem reading the cache. Use --no-cache / NO_CACHE to disable it.",
                        err,
                    )
                })?;
        }

        self.messages.push(Message::user(content));
        Ok(())
    }

    /// Resolves the configured model against the API list, promoting
    /// aliases to canonical names.
    fn resolve_model(&mut self) -> Result<(Api, Model), anyhow::Error> {
        let apis = self.config.apis.0.clone();
        for api in apis {
            if !self.config.api.is_empty() && api.name != self.config.api {
                continue;
            }
            for (name, model) in &api.models {
                if *name == self.config.model || model.aliases.contains(&self.config.model) {
                    self.config.model = name.clone();
                    break;
                }
            }
            if let Some(model) = api.models.get(&self.config.model) {
                let mut model = model.clone();
                model.name = self.config.model.clone();
                model.api = api.name.clone();
                return Ok((api, model));
            }
            if !self.config.api.is_empty() {
                let available: Vec<String> = api.models.keys().cloned().collect();
                return Err(ModsError::new(
                    format!(
                        "The API endpoint '{}' does not contain the model '{}'.",
                        self.config.api, self.config.model
                    ),
                    user_error(format!("Available models are: {}", available.join(", "))),
                )
                .into());
            }
        }

        Err(ModsError::new(
            format!("Model '{}' is not in the settings file.", self.config.model),
            user_error(
                "Specify an API endpoint with --api or configure the model in the settings: mods --settings",
            ),
        )
        .into())
    }

    /// Resolves a key through the cascade: explicit config, key command,
    /// configured environment variable, well-known environment variable.
    fn ensure_key(
        &self,
        api: &Api,
        default_env: &str,
        docs_url: &str,
    ) -> Result<String, anyhow::Error> {
        let mut key = api.api_key.clone();
        if key.is_empty() && !api.api_key_env.is_empty() && api.api_key_cmd.is_empty() {
            key = std::env::var(&api.api_key_env).unwrap_or_default();
        }
        if key.is_empty() && !api.api_key_cmd.is_empty() {
            let args = shell_words::split(&api.api_key_cmd)
                .map_err(|err| ModsError::new("Failed to parse api-key-cmd.", err))?;
            let Some((program, rest)) = args.split_first() else {
                return Err(ModsError::new(
                    "Failed to parse api-key-cmd.",
                    user_error("api-key-cmd is empty"),
                )
                .into());
            };
            let output = std::process::Command::new(program)
                .args(rest)
                .output()
                .map_err(|err| ModsError::new("Cannot exec api-key-cmd.", err))?;
            key = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        if key.is_empty() {
            key = std::env::var(default_env).unwrap_or_default();
        }
        if !key.is_empty() {
            return Ok(key);
        }
        Err(ModsError::new(
            format!(
                "{default_env} is required; set the {default_env} environment variable \
                 or update mods.yml through mods --settings."
            ),
            user_error(format!("You can grab one at {docs_url}")),
        )
        .into())
    }

    fn proxy_client(&self) -> Result<Option<reqwest::Client>, anyhow::Error> {
        if self.config.http_proxy.is_empty() {
            return Ok(None);
        }
        let proxy = reqwest::Proxy::all(&self.config.http_proxy)
            .map_err(|err| ModsError::new("There was an error parsing the proxy URL.", err))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|err| ModsError::new("There was an error parsing the proxy URL.", err))?;
        Ok(Some(client))
    }

    /// The closure every adapter uses to dispatch tool calls, bounded by
    /// the MCP timeout.
    fn tool_caller(&self) -> ToolCaller {
        let config = self.config.clone();
        Arc::new(move |name, data| {
            let config = config.clone();
            Box::pin(async move {
                match tokio::time::timeout(
                    config.mcp_timeout(),
                    mcp::tool_call(&config, &name, &data),
                )
                .await
                {
                    Err(_) => Err(format!("mcp: timed out calling tool {name:?}")),
                    Ok(result) => result,
                }
            })
        })
    }

    fn append_output(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.output.push_str(s);
        print!("{s}");
        let _ = std::io::stdout().flush();
    }

    /// Persists the finished thread: blob first, then the index row; a
    /// failed row write removes the blob again so no orphan remains.
    pub fn save_conversation(&self) -> Result<(), anyhow::Error> {
        let cfg = &self.config;
        if cfg.no_cache {
            if !cfg.quiet {
                eprintln!(
                    "\nConversation was not saved because --no-cache / NO_CACHE is set."
                );
            }
            return Ok(());
        }

        let id = &cfg.cache_write_to_id;
        let mut title = cfg.cache_write_to_title.trim().to_string();
        if looks_like_sha1(&title) || title.is_empty() {
            title = first_line(last_prompt(&self.messages)).to_string();
        }

        let err_reason = format!(
            "There was a problem writing {id} to the cache. Use --no-cache / NO_CACHE to disable it."
        );
        self.cache
            .write(id, &self.messages)
            .map_err(|err| ModsError::new(err_reason.clone(), err))?;
        if let Err(err) = self.db.save(id, &title, &cfg.api, &cfg.model) {
            // Leave no orphaned blob behind.
            let _ = self.cache.delete(id);
            return Err(ModsError::new(err_reason, err).into());
        }

        if !cfg.quiet {
            eprintln!("\nConversation saved: {} {}", &id[..SHA1_SHORT], title);
        }
        Ok(())
    }
}

fn first_non_empty(a: &str, b: &str) -> String {
    if !a.is_empty() {
        a.to_string()
    } else {
        b.to_string()
    }
}

fn opt_f64(value: f64) -> Option<f64> {
    (value >= 0.0).then_some(value)
}

fn opt_i64(value: i64) -> Option<i64> {
    (value >= 0).then_some(value)
}

/// The content of the last non-empty user message, or "".
pub fn last_prompt(messages: &[Message]) -> &str {
    let mut result = "";
    for msg in messages {
        if msg.role != Role::User || msg.content.is_empty() {
            continue;
        }
        result = &msg.content;
    }
    result
}

pub fn first_line(s: &str) -> &str {
    s.split('\n').next().unwrap_or_default()
}

/// Indents piped stdin by one tab per line.
pub fn increase_indent(s: &str) -> String {
    s.split('\n')
        .map(|line| format!("{}{line}", "\t".repeat(TAB_WIDTH)))
        .collect::<Vec<_>>()
        .join("\n")
}

static TOKEN_ERR_RE: OnceLock<Regex> = OnceLock::new();

fn token_err_re() -> &'static Regex {
    TOKEN_ERR_RE.get_or_init(|| {
        Regex::new(
            r"This model's maximum context length is (\d+) tokens. However, your messages resulted in (\d+) tokens",
        )
        .expect("token error regex")
    })
}

/// Trims the prompt after a context-length overflow: one token is about
/// four characters, plus a ten character margin.
pub fn cut_prompt(message: &str, prompt: &str) -> String {
    let Some(captures) = token_err_re().captures(message) else {
        return prompt.to_string();
    };
    let max_tokens: i64 = captures[1].parse().unwrap_or_default();
    let current_tokens: i64 = captures[2].parse().unwrap_or_default();
    if max_tokens > current_tokens {
        return prompt.to_string();
    }

    let reduce_by = (10 + (current_tokens - max_tokens) * 4) as usize;
    if prompt.len() > reduce_by {
        return truncate_at_boundary(prompt, prompt.len() - reduce_by);
    }
    prompt.to_string()
}

fn truncate_at_boundary(s: &str, mut at: usize) -> String {
    if at >= s.len() {
        return s.to_string();
    }
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    s[..at].to_string()
}

/// Renders a conversation listing row.
pub fn format_conversation_row(convo: &crate::store::db::Conversation) -> String {
    format!(
        "{}\t{}\t{}",
        &convo.id[..SHA1_SHORT.min(convo.id.len())],
        convo.title,
        convo.updated_at.format("%Y-%m-%d %H:%M"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_prompt_of_empty_thread_is_empty() {
        assert_eq!(last_prompt(&[]), "");
    }

    #[test]
    fn last_prompt_picks_final_user_message() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("hi"),
            Message::user("middle 1"),
            Message::user("middle 2"),
            Message::user("last"),
        ];
        assert_eq!(last_prompt(&messages), "last");
    }

    #[test]
    fn last_prompt_skips_empty_user_messages() {
        let messages = vec![Message::user("real"), Message::user("")];
        assert_eq!(last_prompt(&messages), "real");
    }

    #[test]
    fn first_line_stops_at_newline() {
        assert_eq!(first_line("line\nsomething else\nmore"), "line");
        assert_eq!(first_line("single"), "single");
        assert_eq!(first_line(""), "");
    }

    #[test]
    fn indent_prefixes_every_line() {
        assert_eq!(increase_indent("a\nb"), "\ta\n\tb");
    }

    #[test]
    fn cut_prompt_reduces_by_token_overflow() {
        let prompt = "x".repeat(1000);
        let message = "This model's maximum context length is 100 tokens. \
                       However, your messages resulted in 150 tokens";
        let cut = cut_prompt(message, &prompt);
        // (150-100)*4 + 10 = 210 characters removed.
        assert_eq!(cut.len(), 790);
    }

    #[test]
    fn cut_prompt_never_underflows() {
        let message = "This model's maximum context length is 100 tokens. \
                       However, your messages resulted in 150 tokens";
        assert_eq!(cut_prompt(message, "short"), "short");
    }

    #[test]
    fn cut_prompt_ignores_unrelated_errors() {
        assert_eq!(cut_prompt("rate limited", "prompt"), "prompt");
    }

    #[test]
    fn cut_prompt_respects_char_boundaries() {
        let prompt = "é".repeat(200);
        let message = "This model's maximum context length is 100 tokens. \
                       However, your messages resulted in 110 tokens";
        let cut = cut_prompt(message, &prompt);
        assert!(cut.len() < prompt.len());
        assert!(std::str::from_utf8(cut.as_bytes()).is_ok());
    }

    #[test]
    fn opt_helpers_treat_negatives_as_unset() {
        assert_eq!(opt_f64(-1.0), None);
        assert_eq!(opt_f64(0.0), Some(0.0));
        assert_eq!(opt_i64(-1), None);
        assert_eq!(opt_i64(40), Some(40));
    }
}

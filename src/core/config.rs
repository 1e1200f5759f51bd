//! Settings: the YAML file under the platform config directory, the
//! `MODS_*` environment overlay, and the runtime knobs the CLI layers on
//! top.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ModsError;

pub const DEFAULT_MARKDOWN_FORMAT_TEXT: &str =
    "Format the response as markdown without enclosing backticks.";
pub const DEFAULT_JSON_FORMAT_TEXT: &str =
    "Format the response as json without enclosing backticks.";

const DEFAULT_MCP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_WORD_WRAP: u32 = 80;

/// A model entry under an API endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub api: String,
    #[serde(rename = "max-input-chars", default)]
    pub max_chars: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fallback: String,
    #[serde(rename = "thinking-budget", default, skip_serializing_if = "is_zero")]
    pub thinking_budget: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// An API endpoint with its credential sources and models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Api {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "api-key", default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(rename = "api-key-env", default, skip_serializing_if = "String::is_empty")]
    pub api_key_env: String,
    #[serde(rename = "api-key-cmd", default, skip_serializing_if = "String::is_empty")]
    pub api_key_cmd: String,
    #[serde(rename = "base-url", default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default)]
    pub models: BTreeMap<String, Model>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
}

/// The `apis` mapping, decoded in file order with names injected.
#[derive(Debug, Clone, Default)]
pub struct Apis(pub Vec<Api>);

impl<'de> Deserialize<'de> for Apis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ApisVisitor;

        impl<'de> Visitor<'de> for ApisVisitor {
            type Value = Apis;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of API name to endpoint configuration")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Apis, A::Error> {
                let mut apis = Vec::new();
                while let Some((name, mut api)) = map.next_entry::<String, Api>()? {
                    api.name = name;
                    apis.push(api);
                }
                Ok(Apis(apis))
            }
        }

        deserializer.deserialize_map(ApisVisitor)
    }
}

impl Serialize for Apis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for api in &self.0 {
            map.serialize_entry(&api.name, api)?;
        }
        map.end()
    }
}

/// `format-text` accepts either a bare string (a markdown template) or a
/// mapping of format name to template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FormatText(pub BTreeMap<String, String>);

impl FormatText {
    pub fn get(&self, format: &str) -> Option<&String> {
        self.0.get(format)
    }
}

impl<'de> Deserialize<'de> for FormatText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(text) => {
                let mut map = BTreeMap::new();
                map.insert("markdown".to_string(), text);
                Ok(FormatText(map))
            }
            other => serde_yaml::from_value(other)
                .map(FormatText)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// One MCP server entry. The type selects the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// The main configuration, mapped onto the YAML settings file. Fields
/// marked `skip` exist only at runtime and come from flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "default-api")]
    pub api: String,
    #[serde(rename = "default-model")]
    pub model: String,
    pub format: bool,
    #[serde(rename = "format-text")]
    pub format_text: FormatText,
    #[serde(rename = "format-as")]
    pub format_as: String,
    pub raw: bool,
    pub quiet: bool,
    #[serde(rename = "max-tokens")]
    pub max_tokens: i64,
    #[serde(rename = "max-input-chars")]
    pub max_input_chars: i64,
    pub temp: f64,
    pub stop: Vec<String>,
    pub topp: f64,
    pub topk: i64,
    #[serde(rename = "no-limit")]
    pub no_limit: bool,
    #[serde(rename = "cache-path")]
    pub cache_path: PathBuf,
    #[serde(rename = "no-cache")]
    pub no_cache: bool,
    #[serde(rename = "include-prompt-args")]
    pub include_prompt_args: bool,
    #[serde(rename = "include-prompt")]
    pub include_prompt: i64,
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
    #[serde(rename = "word-wrap")]
    pub word_wrap: u32,
    pub fanciness: u32,
    #[serde(rename = "status-text")]
    pub status_text: String,
    #[serde(rename = "http-proxy")]
    pub http_proxy: String,
    pub apis: Apis,
    pub role: String,
    pub roles: BTreeMap<String, Vec<String>>,
    #[serde(rename = "mcp-servers")]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    #[serde(rename = "mcp-timeout")]
    pub mcp_timeout: String,

    #[serde(skip)]
    pub user: String,
    #[serde(skip)]
    pub prefix: String,
    #[serde(skip)]
    pub ask_model: bool,
    #[serde(skip)]
    pub settings_path: PathBuf,
    #[serde(skip)]
    pub continue_last: bool,
    #[serde(skip)]
    pub continue_from: String,
    #[serde(skip)]
    pub title: String,
    #[serde(skip)]
    pub show_last: bool,
    #[serde(skip)]
    pub show: String,
    #[serde(skip)]
    pub list: bool,
    #[serde(skip)]
    pub list_roles: bool,
    #[serde(skip)]
    pub delete: Vec<String>,
    #[serde(skip)]
    pub delete_older_than: Option<Duration>,
    #[serde(skip)]
    pub dirs: bool,
    #[serde(skip)]
    pub settings: bool,
    #[serde(skip)]
    pub reset_settings: bool,
    #[serde(skip)]
    pub theme: String,
    #[serde(skip)]
    pub open_editor: bool,
    #[serde(skip)]
    pub mcp_list: bool,
    #[serde(skip)]
    pub mcp_list_tools: bool,
    #[serde(skip)]
    pub mcp_disable: Vec<String>,
    #[serde(skip)]
    pub cache_read_from_id: String,
    #[serde(skip)]
    pub cache_write_to_id: String,
    #[serde(skip)]
    pub cache_write_to_title: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut format_text = BTreeMap::new();
        format_text.insert("markdown".to_string(), DEFAULT_MARKDOWN_FORMAT_TEXT.to_string());
        format_text.insert("json".to_string(), DEFAULT_JSON_FORMAT_TEXT.to_string());
        Self {
            api: String::new(),
            model: String::new(),
            format: false,
            format_text: FormatText(format_text),
            format_as: "markdown".to_string(),
            raw: false,
            quiet: false,
            max_tokens: 0,
            max_input_chars: 12250,
            temp: -1.0,
            stop: Vec::new(),
            topp: -1.0,
            topk: -1,
            no_limit: false,
            cache_path: PathBuf::new(),
            no_cache: false,
            include_prompt_args: false,
            include_prompt: 0,
            max_retries: 5,
            word_wrap: DEFAULT_WORD_WRAP,
            fanciness: 10,
            status_text: "Generating".to_string(),
            http_proxy: String::new(),
            apis: Apis::default(),
            role: String::new(),
            roles: BTreeMap::new(),
            mcp_servers: BTreeMap::new(),
            mcp_timeout: String::new(),
            user: String::new(),
            prefix: String::new(),
            ask_model: false,
            settings_path: PathBuf::new(),
            continue_last: false,
            continue_from: String::new(),
            title: String::new(),
            show_last: false,
            show: String::new(),
            list: false,
            list_roles: false,
            delete: Vec::new(),
            delete_older_than: None,
            dirs: false,
            settings: false,
            reset_settings: false,
            theme: "charm".to_string(),
            open_editor: false,
            mcp_list: false,
            mcp_list_tools: false,
            mcp_disable: Vec::new(),
            cache_read_from_id: String::new(),
            cache_write_to_id: String::new(),
            cache_write_to_title: String::new(),
        }
    }
}

impl Config {
    /// The timeout applied to MCP enumeration and each tool invocation.
    pub fn mcp_timeout(&self) -> Duration {
        if self.mcp_timeout.is_empty() {
            return DEFAULT_MCP_TIMEOUT;
        }
        parse_duration(&self.mcp_timeout).unwrap_or(DEFAULT_MCP_TIMEOUT)
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache_path.join("conversations").join("mods.db")
    }
}

/// Loads settings, creating the default file on first run, then layers
/// the `MODS_*` environment on top and fills derived paths.
pub fn ensure_config() -> Result<Config, ModsError> {
    let project = ProjectDirs::from("", "", "mods").ok_or_else(|| {
        ModsError::new(
            "Could not find the settings path.",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory"),
        )
    })?;
    let settings_path = project.config_dir().join("mods.yml");

    fs::create_dir_all(project.config_dir())
        .map_err(|err| ModsError::new("Could not create the settings directory.", err))?;
    if !settings_path.exists() {
        fs::write(&settings_path, default_config_file())
            .map_err(|err| ModsError::new("Could not create the settings file.", err))?;
    }

    let contents = fs::read_to_string(&settings_path)
        .map_err(|err| ModsError::new("Could not read the settings file.", err))?;
    let mut config: Config = serde_yaml::from_str(&contents)
        .map_err(|err| ModsError::new("Could not parse the settings file.", err))?;
    config.settings_path = settings_path;

    apply_env_overlay(&mut config);

    if config.cache_path.as_os_str().is_empty() {
        config.cache_path = project.data_dir().to_path_buf();
    }
    fs::create_dir_all(config.cache_path.join("conversations"))
        .map_err(|err| ModsError::new("Could not create the cache directory.", err))?;

    if config.word_wrap == 0 {
        config.word_wrap = DEFAULT_WORD_WRAP;
    }
    Ok(config)
}

fn env(name: &str) -> Option<String> {
    std::env::var(format!("MODS_{name}")).ok()
}

fn env_bool(name: &str, into: &mut bool) {
    if let Some(value) = env(name) {
        *into = matches!(value.as_str(), "1" | "true" | "yes" | "on");
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, into: &mut T) {
    if let Some(value) = env(name) {
        if let Ok(parsed) = value.parse() {
            *into = parsed;
        }
    }
}

/// Applies the `MODS_*` overlay over the file-derived settings.
fn apply_env_overlay(config: &mut Config) {
    env_parse("API", &mut config.api);
    env_parse("MODEL", &mut config.model);
    env_bool("FORMAT", &mut config.format);
    env_parse("FORMAT_AS", &mut config.format_as);
    env_bool("RAW", &mut config.raw);
    env_bool("QUIET", &mut config.quiet);
    env_parse("MAX_TOKENS", &mut config.max_tokens);
    env_parse("MAX_INPUT_CHARS", &mut config.max_input_chars);
    env_parse("TEMP", &mut config.temp);
    env_parse("TOPP", &mut config.topp);
    env_parse("TOPK", &mut config.topk);
    env_bool("NO_LIMIT", &mut config.no_limit);
    if let Some(path) = env("CACHE_PATH") {
        config.cache_path = PathBuf::from(path);
    }
    env_bool("NO_CACHE", &mut config.no_cache);
    env_bool("INCLUDE_PROMPT_ARGS", &mut config.include_prompt_args);
    env_parse("INCLUDE_PROMPT", &mut config.include_prompt);
    env_parse("MAX_RETRIES", &mut config.max_retries);
    env_parse("WORD_WRAP", &mut config.word_wrap);
    env_parse("FANCINESS", &mut config.fanciness);
    env_parse("STATUS_TEXT", &mut config.status_text);
    env_parse("HTTP_PROXY", &mut config.http_proxy);
    env_parse("ROLE", &mut config.role);
    env_parse("MCP_TIMEOUT", &mut config.mcp_timeout);
    if let Some(stop) = env("STOP") {
        config.stop = stop.split(',').map(str::to_string).collect();
    }
}

/// Parses human durations: `90s`, `10m`, `2h`, `7d`, `2w`, `1mo`, `1y`,
/// and compounds like `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut unit = String::new();
    let mut flush = |digits: &mut String, unit: &mut String| -> Result<(), String> {
        if digits.is_empty() {
            return Err(format!("invalid duration: {input:?}"));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {input:?}"))?;
        let seconds = match unit.as_str() {
            "s" | "" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            "w" => 604800,
            "mo" => 2592000,
            "y" => 31536000,
            _ => return Err(format!("unknown duration unit: {unit:?}")),
        };
        *digits = String::new();
        *unit = String::new();
        total += Duration::from_secs(value * seconds);
        Ok(())
    };

    for c in input.chars() {
        if c.is_ascii_digit() {
            if !unit.is_empty() {
                flush(&mut digits, &mut unit)?;
            }
            digits.push(c);
        } else if c.is_ascii_alphabetic() {
            unit.push(c);
        } else {
            return Err(format!("invalid duration: {input:?}"));
        }
    }
    flush(&mut digits, &mut unit)?;
    Ok(total)
}

/// The settings file written on first run.
pub fn default_config_file() -> String {
    format!(
        r#"# mods settings file
# Default API endpoint and model to use.
default-api: openai
default-model: gpt-4o
# Ask for the response to be formatted as markdown unless otherwise set.
format: false
format-text:
  markdown: {markdown:?}
  json: {json:?}
# System role to use.
role: ""
# List of predefined system messages that can be used as roles.
roles:
  shell:
    - you are a shell expert
    - you do not explain anything
    - you simply output one liners to solve the problems you're asked
# Render output as raw text when connected to a TTY.
raw: false
# Quiet mode (hide the spinner while loading and stderr messages for success).
quiet: false
# Temperature (randomness) of results, from 0.0 to 2.0, -1.0 to disable.
temp: -1.0
# TopP, an alternative to temperature that narrows response, from 0.0 to 1.0, -1.0 to disable.
topp: -1.0
# TopK, only sample from the top K options for each subsequent token, -1 to disable.
topk: -1
# Turn off the client-side limit on the size of the input into the model.
no-limit: false
# Default character limit on input to the model.
max-input-chars: 12250
# Maximum number of times to retry API calls.
max-retries: 5
# Wrap formatted output at specific width (default is 80).
word-wrap: 80
# Aliases and endpoints for OpenAI-compatible REST APIs.
apis:
  openai:
    base-url: https://api.openai.com/v1
    api-key-env: OPENAI_API_KEY
    models:
      gpt-4o:
        aliases: ["4o"]
        max-input-chars: 392000
        fallback: gpt-4
      gpt-4:
        aliases: ["4"]
        max-input-chars: 24500
        fallback: gpt-3.5-turbo
      gpt-3.5-turbo:
        aliases: ["35t"]
        max-input-chars: 12250
  anthropic:
    base-url: https://api.anthropic.com/v1
    api-key-env: ANTHROPIC_API_KEY
    models:
      claude-3-5-sonnet-latest:
        aliases: ["claude3.5-sonnet", "sonnet-3.5"]
        max-input-chars: 680000
  google:
    models:
      gemini-2.0-flash:
        aliases: ["flash"]
        max-input-chars: 4000000
  cohere:
    models:
      command-r-plus:
        max-input-chars: 512000
  ollama:
    base-url: http://localhost:11434
    models:
      "llama3.2":
        aliases: ["llama"]
        max-input-chars: 650000
# Timeout for MCP server calls.
mcp-timeout: 15s
# MCP server configurations.
mcp-servers: {{}}
"#,
        markdown = DEFAULT_MARKDOWN_FORMAT_TEXT,
        json = DEFAULT_JSON_FORMAT_TEXT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_file_parses() {
        let config: Config = serde_yaml::from_str(&default_config_file()).unwrap();
        assert_eq!(config.api, "openai");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.apis.0.len(), 5);
        assert_eq!(config.apis.0[0].name, "openai");
        assert_eq!(config.roles["shell"].len(), 3);
        assert_eq!(config.mcp_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn apis_preserve_file_order() {
        let config: Config = serde_yaml::from_str(
            "apis:\n  localai:\n    base-url: http://localhost:8080\n  openai:\n    base-url: https://api.openai.com/v1\n",
        )
        .unwrap();
        let names: Vec<_> = config.apis.0.iter().map(|api| api.name.as_str()).collect();
        assert_eq!(names, vec!["localai", "openai"]);
    }

    #[test]
    fn format_text_accepts_bare_string() {
        let config: Config =
            serde_yaml::from_str("format-text: as markdown please\n").unwrap();
        assert_eq!(
            config.format_text.get("markdown").map(String::as_str),
            Some("as markdown please")
        );
    }

    #[test]
    fn format_text_accepts_mapping() {
        let config: Config =
            serde_yaml::from_str("format-text:\n  json: as json\n  markdown: as md\n").unwrap();
        assert_eq!(config.format_text.get("json").map(String::as_str), Some("as json"));
        assert_eq!(config.format_text.get("markdown").map(String::as_str), Some("as md"));
    }

    #[test]
    fn model_entries_parse_aliases_and_fallbacks() {
        let api: Api = serde_yaml::from_str(
            "models:\n  gpt-4o:\n    aliases: [\"4o\"]\n    fallback: gpt-4\n    max-input-chars: 392000\n",
        )
        .unwrap();
        let model = &api.models["gpt-4o"];
        assert_eq!(model.aliases, vec!["4o"]);
        assert_eq!(model.fallback, "gpt-4");
        assert_eq!(model.max_chars, 392000);
    }

    #[test]
    fn durations_parse_all_units() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1mo").unwrap(), Duration::from_secs(2592000));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn mcp_server_entries_parse() {
        let config: Config = serde_yaml::from_str(
            "mcp-servers:\n  github:\n    type: stdio\n    command: docker\n    args: [\"run\", \"-i\", \"ghcr.io/github/github-mcp-server\"]\n    env:\n      GITHUB_TOKEN: abc\n  web:\n    type: sse\n    url: https://example.com/sse\n",
        )
        .unwrap();
        assert_eq!(config.mcp_servers["github"].kind, "stdio");
        assert_eq!(config.mcp_servers["github"].args.len(), 3);
        assert_eq!(config.mcp_servers["web"].url, "https://example.com/sse");
    }
}

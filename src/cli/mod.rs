//! The command-line surface: flag parsing, dispatch of the non-session
//! commands, and the hand-off into the session coordinator.

use std::process::ExitCode;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{ArgGroup, Parser};
use tokio_util::sync::CancellationToken;

use crate::core::config::{ensure_config, parse_duration, Config};
use crate::core::session::{format_conversation_row, Mods, RunOutcome};
use crate::error::{flag_parse_error, handle_error, user_error, ModsError};
use crate::mcp;
use crate::sha::SHA1_MIN_LEN;
use crate::store::cache::Conversations;
use crate::store::db::ConvoDb;
use crate::term::{is_input_tty, is_output_tty};

fn duration_value_parser(s: &str) -> Result<Duration, String> {
    parse_duration(s)
}

#[derive(Parser)]
#[command(
    name = "mods",
    about = "GPT on the command line. Built for pipelines.",
    disable_version_flag = true,
    group(ArgGroup::new("exclusive").multiple(false).args([
        "settings",
        "show",
        "show_last",
        "delete",
        "delete_older_than",
        "list",
        "continue_from",
        "continue_last",
        "reset_settings",
        "mcp_list",
        "mcp_list_tools",
    ]))
)]
pub struct Args {
    /// The prompt prefix, concatenated from all positional arguments
    #[arg(value_name = "PREFIX TERMS")]
    pub prefix: Vec<String>,

    /// Default model (gpt-4o, claude-3-5-sonnet-latest, ...)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Ask which model to use via an interactive prompt
    #[arg(short = 'M', long)]
    pub ask_model: bool,

    /// OpenAI compatible REST API (openai, localai, anthropic, ...)
    #[arg(short, long)]
    pub api: Option<String>,

    /// HTTP proxy to use for API requests
    #[arg(short = 'x', long)]
    pub http_proxy: Option<String>,

    /// Ask for the response to be formatted as markdown unless otherwise set
    #[arg(short, long)]
    pub format: bool,

    /// Format the response as markdown or json
    #[arg(long, value_name = "FORMAT")]
    pub format_as: Option<String>,

    /// Render output as raw text when connected to a TTY
    #[arg(short, long)]
    pub raw: bool,

    /// Include the prompt from arguments and stdin, truncate stdin to
    /// specified number of lines
    #[arg(short = 'P', long, num_args = 0..=1, default_missing_value = "-1", value_name = "LINES")]
    pub prompt: Option<i64>,

    /// Include the prompt from the arguments in the response
    #[arg(short = 'p', long)]
    pub prompt_args: bool,

    /// Continue from the last response or a given saved title or id
    #[arg(short = 'c', long = "continue", value_name = "ID-OR-TITLE")]
    pub continue_from: Option<String>,

    /// Continue from the last response
    #[arg(short = 'C', long)]
    pub continue_last: bool,

    /// List saved conversations
    #[arg(short, long)]
    pub list: bool,

    /// Save the current conversation with the given title
    #[arg(short, long)]
    pub title: Option<String>,

    /// Delete one or more saved conversations with the given titles or ids
    #[arg(short, long, value_name = "ID-OR-TITLE")]
    pub delete: Vec<String>,

    /// Delete all saved conversations older than the given duration
    /// (10m, 2h, 7d, 1w, 1mo, 1y)
    #[arg(long, value_parser = duration_value_parser, value_name = "DURATION")]
    pub delete_older_than: Option<Duration>,

    /// Show a saved conversation with the given title or id
    #[arg(short, long, value_name = "ID-OR-TITLE")]
    pub show: Option<String>,

    /// Show the last saved conversation
    #[arg(short = 'S', long)]
    pub show_last: bool,

    /// Quiet mode (hide the spinner while loading and stderr messages
    /// for success)
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the version
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Maximum number of times to retry API calls
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Turn off the client-side limit on the size of the input into the model
    #[arg(long)]
    pub no_limit: bool,

    /// Maximum number of tokens in the response
    #[arg(long)]
    pub max_tokens: Option<i64>,

    /// Wrap formatted output at specific width
    #[arg(long, value_name = "WIDTH")]
    pub word_wrap: Option<u32>,

    /// Temperature (randomness) of results, from 0.0 to 2.0, -1.0 to disable
    #[arg(long = "temp")]
    pub temp: Option<f64>,

    /// Up to 4 sequences where the API will stop generating further tokens
    #[arg(long)]
    pub stop: Vec<String>,

    /// TopP, an alternative to temperature that narrows response, from
    /// 0.0 to 1.0, -1.0 to disable
    #[arg(long = "topp")]
    pub topp: Option<f64>,

    /// TopK, only sample from the top K options for each subsequent
    /// token, -1 to disable
    #[arg(long = "topk")]
    pub topk: Option<i64>,

    /// Your desired level of fanciness
    #[arg(long)]
    pub fanciness: Option<u32>,

    /// Text to show while generating
    #[arg(long)]
    pub status_text: Option<String>,

    /// Disables caching of the prompt/response
    #[arg(long)]
    pub no_cache: bool,

    /// Backup your old settings file and reset everything to the defaults
    #[arg(long)]
    pub reset_settings: bool,

    /// Open settings in your $EDITOR
    #[arg(long)]
    pub settings: bool,

    /// Print the directories in which mods stores its data
    #[arg(long)]
    pub dirs: bool,

    /// System role to use
    #[arg(short = 'R', long)]
    pub role: Option<String>,

    /// List the roles defined in your settings file
    #[arg(long)]
    pub list_roles: bool,

    /// Theme to use in the forms (charm, catppuccin, dracula, base16)
    #[arg(long, value_name = "THEME")]
    pub theme: Option<String>,

    /// Edit the prompt in your $EDITOR; only has an effect when there
    /// are no other arguments and stdin is a TTY
    #[arg(short = 'e', long)]
    pub editor: bool,

    /// List all the available MCP servers
    #[arg(long)]
    pub mcp_list: bool,

    /// List all the available tools from enabled MCP servers
    #[arg(long)]
    pub mcp_list_tools: bool,

    /// Disable specific MCP servers ("*" disables all)
    #[arg(long, value_name = "SERVER")]
    pub mcp_disable: Vec<String>,
}

fn remove_whitespace(s: String) -> String {
    if s.trim().is_empty() {
        String::new()
    } else {
        s
    }
}

fn apply_args(config: &mut Config, args: Args) {
    config.prefix = remove_whitespace(args.prefix.join(" "));
    if let Some(model) = args.model {
        config.model = model;
    }
    config.ask_model = args.ask_model;
    if let Some(api) = args.api {
        config.api = api;
    }
    if let Some(http_proxy) = args.http_proxy {
        config.http_proxy = http_proxy;
    }
    if args.format {
        config.format = true;
    }
    if let Some(format_as) = args.format_as {
        config.format_as = format_as;
    }
    if args.raw {
        config.raw = true;
    }
    if let Some(prompt) = args.prompt {
        config.include_prompt = prompt;
    }
    if args.prompt_args {
        config.include_prompt_args = true;
    }
    if let Some(continue_from) = args.continue_from {
        config.continue_from = continue_from;
    }
    config.continue_last = args.continue_last;
    config.list = args.list;
    if let Some(title) = args.title {
        config.title = title;
    }
    config.delete = args.delete;
    config.delete_older_than = args.delete_older_than;
    if let Some(show) = args.show {
        config.show = show;
    }
    config.show_last = args.show_last;
    if args.quiet {
        config.quiet = true;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if args.no_limit {
        config.no_limit = true;
    }
    if let Some(max_tokens) = args.max_tokens {
        config.max_tokens = max_tokens;
    }
    if let Some(word_wrap) = args.word_wrap {
        config.word_wrap = word_wrap;
    }
    if let Some(temp) = args.temp {
        config.temp = temp;
    }
    if !args.stop.is_empty() {
        config.stop = args.stop;
    }
    if let Some(topp) = args.topp {
        config.topp = topp;
    }
    if let Some(topk) = args.topk {
        config.topk = topk;
    }
    if let Some(fanciness) = args.fanciness {
        config.fanciness = fanciness;
    }
    if let Some(status_text) = args.status_text {
        config.status_text = status_text;
    }
    if args.no_cache {
        config.no_cache = true;
    }
    config.reset_settings = args.reset_settings;
    config.settings = args.settings;
    config.dirs = args.dirs;
    if let Some(role) = args.role {
        config.role = role;
    }
    config.list_roles = args.list_roles;
    if let Some(theme) = args.theme {
        config.theme = theme;
    }
    config.open_editor = args.editor;
    config.mcp_list = args.mcp_list;
    config.mcp_list_tools = args.mcp_list_tools;
    config.mcp_disable = args.mcp_disable;
}

fn is_no_args(config: &Config) -> bool {
    config.prefix.is_empty()
        && config.show.is_empty()
        && !config.show_last
        && config.delete.is_empty()
        && config.delete_older_than.is_none()
        && !config.list
        && !config.list_roles
        && !config.mcp_list
        && !config.mcp_list_tools
        && !config.dirs
        && !config.settings
        && !config.reset_settings
}

pub async fn run() -> ExitCode {
    let config = match ensure_config() {
        Ok(config) => config,
        Err(err) => {
            let err: anyhow::Error = err.into();
            handle_error(&err);
            return ExitCode::from(1);
        }
    };

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = err.print();
                    ExitCode::SUCCESS
                }
                _ => {
                    let err = anyhow::Error::new(flag_parse_error(err));
                    handle_error(&err);
                    ExitCode::from(1)
                }
            }
        }
    };

    if args.version {
        println!("mods {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let mut config = config;
    apply_args(&mut config, args);
    if std::env::var("VIMRUNTIME").map(|v| !v.is_empty()).unwrap_or(false) {
        config.quiet = true;
    }

    match dispatch(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            handle_error(&err);
            ExitCode::from(1)
        }
    }
}

async fn dispatch(mut config: Config) -> Result<(), anyhow::Error> {
    if config.dirs {
        print_dirs(&config);
        return Ok(());
    }
    if config.settings {
        return open_settings(&config);
    }
    if config.reset_settings {
        return reset_settings(&config);
    }
    if config.list_roles {
        list_roles(&config);
        return Ok(());
    }
    if config.mcp_list {
        mcp::mcp_list(&config);
        return Ok(());
    }
    if config.mcp_list_tools {
        return mcp::mcp_list_tools(&config).await.map_err(Into::into);
    }

    let db = ConvoDb::open(&config.db_path().to_string_lossy())
        .map_err(|err| ModsError::new("Could not open the database.", err))?;

    if config.list {
        return list_conversations(&db);
    }
    if !config.delete.is_empty() {
        return delete_conversations(&config, &db);
    }
    if let Some(age) = config.delete_older_than {
        return delete_older_than(&config, &db, age);
    }

    if is_no_args(&config) && is_input_tty() && config.open_editor {
        config.prefix = prefix_from_editor()?;
    }
    if config.ask_model && is_input_tty() {
        return Err(ModsError::new(
            "Interactive model selection is not available.",
            user_error("Specify the model with --model and the API with --api."),
        )
        .into());
    }

    let cache = Conversations::new(&config.cache_path)
        .map_err(|err| ModsError::new("Could not open the cache.", err))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let mut mods = Mods::new(config, db, cache, cancel);
    match mods.run().await? {
        RunOutcome::NoInput => Err(ModsError::new(
            "You didn't provide any prompt input.",
            user_error(
                "You can provide a prompt via arguments and/or pipe it through STDIN. \
                 Example: mods [prompt]",
            ),
        )
        .into()),
        RunOutcome::Shown => Ok(()),
        RunOutcome::Completed => {
            if !mods.output.ends_with('\n') && !is_output_tty() {
                println!();
            }
            if !mods.config.cache_write_to_id.is_empty() {
                mods.save_conversation()?;
            }
            Ok(())
        }
    }
}

fn print_dirs(config: &Config) {
    let settings_dir = config
        .settings_path
        .parent()
        .unwrap_or(config.settings_path.as_path());
    match config.prefix.split_whitespace().next() {
        Some("config") => println!("{}", settings_dir.display()),
        Some("cache") => println!("{}", config.cache_path.display()),
        _ => {
            println!("Configuration: {}", settings_dir.display());
            println!("        Cache: {}", config.cache_path.display());
        }
    }
}

fn editor_command() -> Result<String, anyhow::Error> {
    std::env::var("EDITOR").map_err(|err| {
        ModsError::new("Missing $EDITOR.", err).into()
    })
}

fn open_settings(config: &Config) -> Result<(), anyhow::Error> {
    let editor = editor_command()?;
    let status = std::process::Command::new(&editor)
        .arg(&config.settings_path)
        .status()
        .map_err(|err| ModsError::new("Could not edit your settings file.", err))?;
    if !status.success() {
        return Err(ModsError::new(
            "Could not edit your settings file.",
            user_error(format!("{editor} exited with {status}")),
        )
        .into());
    }
    if !config.quiet {
        eprintln!("Wrote config file to: {}", config.settings_path.display());
    }
    Ok(())
}

fn reset_settings(config: &Config) -> Result<(), anyhow::Error> {
    let path = &config.settings_path;
    let backup = path.with_extension("yml.bak");
    std::fs::metadata(path)
        .map_err(|err| ModsError::new("Could not read your settings file.", err))?;
    std::fs::copy(path, &backup)
        .map_err(|err| ModsError::new("Could not backup your settings file.", err))?;
    std::fs::remove_file(path)
        .map_err(|err| ModsError::new("Could not delete your settings file.", err))?;
    std::fs::write(path, crate::core::config::default_config_file())
        .map_err(|err| ModsError::new("Could not write new settings file.", err))?;
    if !config.quiet {
        eprintln!("\nSettings restored to defaults!");
        eprintln!(
            "\n  Your old settings have been saved to: {}\n",
            backup.display()
        );
    }
    Ok(())
}

fn list_roles(config: &Config) {
    for role in config.roles.keys() {
        if *role == config.role {
            println!("{role} (default)");
        } else {
            println!("{role}");
        }
    }
}

fn list_conversations(db: &ConvoDb) -> Result<(), anyhow::Error> {
    let conversations = db
        .list()
        .map_err(|err| ModsError::new("Could not list saved conversations.", err))?;
    if conversations.is_empty() {
        eprintln!("No conversations found.");
        return Ok(());
    }
    for convo in conversations {
        println!("{}", format_conversation_row(&convo));
    }
    Ok(())
}

fn delete_conversations(config: &Config, db: &ConvoDb) -> Result<(), anyhow::Error> {
    let cache = Conversations::new(&config.cache_path)
        .map_err(|err| ModsError::new("Couldn't delete conversation.", err))?;
    for input in &config.delete {
        let convo = db
            .find(input)
            .map_err(|err| ModsError::new("Couldn't find conversation to delete.", err))?;
        db.delete(&convo.id)
            .map_err(|err| ModsError::new("Couldn't delete conversation.", err))?;
        // The row delete is authoritative; the blob delete best-effort.
        let _ = cache.delete(&convo.id);
        if !config.quiet {
            eprintln!("Conversation deleted: {}", &convo.id[..SHA1_MIN_LEN]);
        }
    }
    Ok(())
}

fn delete_older_than(
    config: &Config,
    db: &ConvoDb,
    age: Duration,
) -> Result<(), anyhow::Error> {
    let conversations = db
        .list_older_than(age)
        .map_err(|err| ModsError::new("Couldn't find conversations to delete.", err))?;
    if conversations.is_empty() {
        if !config.quiet {
            eprintln!("No conversations found.");
        }
        return Ok(());
    }

    if !config.quiet {
        for convo in &conversations {
            println!("{}", format_conversation_row(convo));
        }
        eprintln!();
        let rerun: Vec<String> = std::env::args().collect();
        return Err(user_error(format!(
            "To delete the conversations above, run: {} --quiet",
            rerun.join(" ")
        )));
    }

    let cache = Conversations::new(&config.cache_path)
        .map_err(|err| ModsError::new("Couldn't delete conversation.", err))?;
    for convo in conversations {
        db.delete(&convo.id)
            .map_err(|err| ModsError::new("Couldn't delete conversation.", err))?;
        let _ = cache.delete(&convo.id);
    }
    Ok(())
}

/// Creates a temp file, opens it in the user's editor, and returns its
/// contents as the prompt prefix.
fn prefix_from_editor() -> Result<String, anyhow::Error> {
    let editor = editor_command()?;
    let file = tempfile::NamedTempFile::new()
        .map_err(|err| ModsError::new("Could not create a temporary file.", err))?;
    let status = std::process::Command::new(&editor)
        .arg(file.path())
        .status()
        .map_err(|err| ModsError::new("Could not open your editor.", err))?;
    if !status.success() {
        return Err(ModsError::new(
            "Could not open your editor.",
            user_error(format!("{editor} exited with {status}")),
        )
        .into());
    }
    let prompt = std::fs::read_to_string(file.path())
        .map_err(|err| ModsError::new("Could not read the prompt file.", err))?;
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_and_apply() {
        let args = Args::try_parse_from([
            "mods",
            "-m",
            "gpt-4o",
            "-a",
            "openai",
            "--temp",
            "0.5",
            "--stop",
            "END",
            "--max-retries",
            "3",
            "-q",
            "hello",
            "world",
        ])
        .unwrap();
        let mut config = Config::default();
        apply_args(&mut config, args);
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.api, "openai");
        assert_eq!(config.temp, 0.5);
        assert_eq!(config.stop, vec!["END"]);
        assert_eq!(config.max_retries, 3);
        assert!(config.quiet);
        assert_eq!(config.prefix, "hello world");
    }

    #[test]
    fn exclusive_flags_conflict() {
        assert!(Args::try_parse_from(["mods", "--list", "--show", "x"]).is_err());
        assert!(Args::try_parse_from(["mods", "--continue", "x", "--show", "x"]).is_err());
        assert!(Args::try_parse_from(["mods", "--settings", "--reset-settings"]).is_err());
        assert!(Args::try_parse_from(["mods", "--mcp-list", "--mcp-list-tools"]).is_err());
    }

    #[test]
    fn prompt_flag_defaults_to_all_lines() {
        let args = Args::try_parse_from(["mods", "-P"]).unwrap();
        assert_eq!(args.prompt, Some(-1));
        let args = Args::try_parse_from(["mods", "--prompt", "3"]).unwrap();
        assert_eq!(args.prompt, Some(3));
    }

    #[test]
    fn delete_flag_repeats() {
        let args = Args::try_parse_from(["mods", "-d", "one", "-d", "two"]).unwrap();
        assert_eq!(args.delete, vec!["one", "two"]);
    }

    #[test]
    fn delete_older_than_parses_durations() {
        let args = Args::try_parse_from(["mods", "--delete-older-than", "2w"]).unwrap();
        assert_eq!(args.delete_older_than, Some(Duration::from_secs(1209600)));
        assert!(Args::try_parse_from(["mods", "--delete-older-than", "nope"]).is_err());
    }

    #[test]
    fn whitespace_only_prefix_is_dropped() {
        let args = Args::try_parse_from(["mods", " ", "\t"]).unwrap();
        let mut config = Config::default();
        apply_args(&mut config, args);
        assert_eq!(config.prefix, "");
    }

    #[test]
    fn no_args_detection() {
        let config = Config::default();
        assert!(is_no_args(&config));
        let mut config = Config::default();
        config.show = "abc".into();
        assert!(!is_no_args(&config));
    }
}

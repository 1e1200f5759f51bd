//! The MCP fabric: discovers tools across the configured servers and
//! dispatches tool calls the model makes. Tool names on the wire are
//! `"<server>_<tool>"`; the first underscore demultiplexes back to the
//! owning server.

pub mod client;
pub mod types;

use std::collections::BTreeMap;

use futures_util::stream::{self, StreamExt};
use serde_json::Value;

use self::client::McpClient;
use self::types::Tool;
use crate::core::config::{Config, McpServerConfig};
use crate::error::{user_error, ModsError};

pub fn is_mcp_enabled(config: &Config, name: &str) -> bool {
    !config.mcp_disable.iter().any(|entry| entry == "*")
        && !config.mcp_disable.iter().any(|entry| entry == name)
}

/// Enabled servers, sorted by name so tool ordering is deterministic.
pub fn enabled_mcps(config: &Config) -> Vec<(String, McpServerConfig)> {
    config
        .mcp_servers
        .iter()
        .filter(|(name, _)| is_mcp_enabled(config, name))
        .map(|(name, server)| (name.clone(), server.clone()))
        .collect()
}

/// Enumerates tools across all enabled servers, one fresh client per
/// server in parallel, each bounded by the MCP timeout.
pub async fn mcp_tools(config: &Config) -> Result<BTreeMap<String, Vec<Tool>>, ModsError> {
    let servers = enabled_mcps(config);
    let parallelism = servers.len().max(1);
    let timeout = config.mcp_timeout();

    let results: Vec<Result<(String, Vec<Tool>), ModsError>> = stream::iter(servers)
        .map(|(name, server)| async move {
            match tokio::time::timeout(timeout, tools_for(&server)).await {
                Err(_) => Err(ModsError::new(
                    "Could not list tools.",
                    user_error(format!(
                        "listing tools for {name:?} timed out - make sure the configuration \
                         is correct. If your server requires a docker container, make sure \
                         it is running"
                    )),
                )),
                Ok(Err(err)) => Err(ModsError::new(
                    "Could not list tools.",
                    user_error(format!("could not set up {name}: {err}")),
                )),
                Ok(Ok(tools)) => Ok((name, tools)),
            }
        })
        .buffer_unordered(parallelism)
        .collect()
        .await;

    let mut map = BTreeMap::new();
    for result in results {
        let (name, tools) = result?;
        map.insert(name, tools);
    }
    Ok(map)
}

async fn tools_for(server: &McpServerConfig) -> Result<Vec<Tool>, String> {
    let mut client = McpClient::start(server).await?;
    let result = async {
        client.initialize().await?;
        client.list_tools().await
    }
    .await;
    client.close().await;
    result
}

/// Invokes `"<server>_<tool>"` with raw JSON argument bytes and returns
/// the concatenated textual result. A result flagged as an error comes
/// back as the error message.
pub async fn tool_call(config: &Config, name: &str, data: &[u8]) -> Result<String, String> {
    let Some((server_name, tool)) = name.split_once('_') else {
        return Err(format!("mcp: invalid tool name: {name:?}"));
    };
    let Some(server) = config.mcp_servers.get(server_name) else {
        return Err(format!("mcp: invalid server name: {server_name:?}"));
    };
    if !is_mcp_enabled(config, server_name) {
        return Err(format!("mcp: server is disabled: {server_name:?}"));
    }

    let mut client = McpClient::start(server)
        .await
        .map_err(|err| format!("mcp: {err}"))?;
    let result = invoke(&mut client, tool, data).await;
    client.close().await;
    result
}

async fn invoke(client: &mut McpClient, tool: &str, data: &[u8]) -> Result<String, String> {
    let arguments = if data.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<Value>(data).map_err(|err| {
            format!("mcp: {err}: {}", String::from_utf8_lossy(data))
        })?)
    };

    client
        .initialize()
        .await
        .map_err(|err| format!("mcp: {err}"))?;
    let result = client
        .call_tool(tool, arguments)
        .await
        .map_err(|err| format!("mcp: {err}"))?;

    let text = result.concat_text();
    if result.is_error {
        return Err(text);
    }
    Ok(text)
}

/// Prints the configured servers, marking the enabled ones.
pub fn mcp_list(config: &Config) {
    for name in config.mcp_servers.keys() {
        if is_mcp_enabled(config, name) {
            println!("{name} (enabled)");
        } else {
            println!("{name}");
        }
    }
}

/// Prints every tool of every enabled server as `server > tool`.
pub async fn mcp_list_tools(config: &Config) -> Result<(), ModsError> {
    let servers = mcp_tools(config).await?;
    for (server, tools) in servers {
        for tool in tools {
            println!("{server} > {}", tool.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_server(name: &str) -> Config {
        let mut config = Config::default();
        config.mcp_servers.insert(
            name.to_string(),
            McpServerConfig {
                kind: "stdio".into(),
                command: "true".into(),
                ..McpServerConfig::default()
            },
        );
        config
    }

    #[test]
    fn disable_list_controls_enablement() {
        let mut config = config_with_server("files");
        assert!(is_mcp_enabled(&config, "files"));

        config.mcp_disable = vec!["files".into()];
        assert!(!is_mcp_enabled(&config, "files"));

        config.mcp_disable = vec!["*".into()];
        assert!(!is_mcp_enabled(&config, "files"));
        assert!(enabled_mcps(&config).is_empty());
    }

    #[tokio::test]
    async fn tool_names_without_separator_are_rejected() {
        let config = config_with_server("files");
        let err = tool_call(&config, "nounderscore", b"{}").await.unwrap_err();
        assert!(err.contains("invalid tool name"));
    }

    #[tokio::test]
    async fn unknown_servers_are_rejected() {
        let config = config_with_server("files");
        let err = tool_call(&config, "web_search", b"{}").await.unwrap_err();
        assert!(err.contains("invalid server name"));
    }

    #[tokio::test]
    async fn disabled_servers_are_rejected() {
        let mut config = config_with_server("files");
        config.mcp_disable = vec!["files".into()];
        let err = tool_call(&config, "files_read", b"{}").await.unwrap_err();
        assert!(err.contains("server is disabled"));
    }

    #[test]
    fn demux_splits_on_first_underscore() {
        // "fs_read_file" belongs to server "fs", tool "read_file".
        assert_eq!("fs_read_file".split_once('_'), Some(("fs", "read_file")));
    }
}

//! # Client Config Normalizer
//!
//! Turns the JSON config files of MCP clients into [`ScanTarget`]s.
//!
//! ## Dialects
//!
//! | Client | Shape |
//! |--------|-------|
//! | Claude Desktop, Cursor, Windsurf | `{"mcpServers": {name: entry}}` |
//! | VS Code `settings.json` | `{"mcp": {"servers": {name: entry}}}` |
//! | VS Code `mcp.json` | `{"servers": {name: entry}}` |
//!
//! An entry with `command` is a stdio server. An entry with `url` is an SSE
//! server unless its `type` says `http`.
//!
//! ## Security Notes
//!
//! - Entries keep their raw JSON so the proxy can write them back exactly.
//! - Map order follows the file (`serde_json` `preserve_order`), so reports
//!   list servers the way the user wrote them.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::target::{LoadedTarget, ScanTarget, ServerEntry, TargetLoadError, Transport};

/// Client shorthands and their config paths on this OS, relative to home.
fn relative_client_paths() -> Vec<(&'static str, Vec<&'static str>)> {
    let mut clients = vec![
        ("windsurf", vec![".codeium/windsurf/mcp_config.json"]),
        ("cursor", vec![".cursor/mcp.json"]),
    ];
    if cfg!(target_os = "macos") {
        clients.push((
            "claude",
            vec!["Library/Application Support/Claude/claude_desktop_config.json"],
        ));
        clients.push((
            "vscode",
            vec![
                ".vscode/mcp.json",
                "Library/Application Support/Code/User/settings.json",
            ],
        ));
    } else if cfg!(target_os = "windows") {
        clients.push((
            "claude",
            vec!["AppData/Roaming/Claude/claude_desktop_config.json"],
        ));
        clients.push((
            "vscode",
            vec![".vscode/mcp.json", "AppData/Roaming/Code/User/settings.json"],
        ));
    } else {
        clients.push((
            "vscode",
            vec![".vscode/mcp.json", ".config/Code/User/settings.json"],
        ));
    }
    clients
}

/// Known clients and their absolute config paths.
pub fn client_paths() -> Vec<(&'static str, Vec<PathBuf>)> {
    let home = dirs::home_dir().unwrap_or_default();
    relative_client_paths()
        .into_iter()
        .map(|(client, paths)| (client, paths.into_iter().map(|p| home.join(p)).collect()))
        .collect()
}

/// Every well-known config path, in client order.
pub fn well_known_paths() -> Vec<(PathBuf, Option<String>)> {
    client_paths()
        .into_iter()
        .flat_map(|(client, paths)| {
            paths
                .into_iter()
                .map(move |path| (path, Some(client.to_string())))
        })
        .collect()
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => {
            let rest = rest.trim_start_matches(['/', '\\']);
            if rest.is_empty() {
                home
            } else {
                home.join(rest)
            }
        }
        _ => PathBuf::from(path),
    }
}

/// Guesses the client of a config path.
pub fn client_from_path(path: &Path) -> Option<String> {
    client_paths()
        .into_iter()
        .find(|(_, paths)| paths.iter().any(|p| p == path))
        .map(|(client, _)| client.to_string())
}

fn looks_like_shorthand(arg: &str) -> bool {
    !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Resolves command-line arguments into config paths.
///
/// No arguments means every well-known path. When every argument looks like
/// a client shorthand, each must name a known client and expands to its
/// paths. Otherwise arguments are paths.
pub fn resolve_targets(args: &[String]) -> Result<Vec<(PathBuf, Option<String>)>> {
    if args.is_empty() {
        return Ok(well_known_paths());
    }

    if args.iter().all(|a| looks_like_shorthand(a)) {
        let known = client_paths();
        let mut resolved = Vec::new();
        for arg in args {
            let (client, paths) = known
                .iter()
                .find(|(client, _)| *client == arg.as_str())
                .ok_or_else(|| CoreError::UnknownClient(arg.clone()))?;
            resolved.extend(paths.iter().map(|p| (p.clone(), Some(client.to_string()))));
        }
        return Ok(resolved);
    }

    Ok(args
        .iter()
        .map(|arg| {
            let path = expand_home(arg);
            let client = client_from_path(&path);
            (path, client)
        })
        .collect())
}

/// Loads one config file.
pub fn load_target(path: &Path, client: Option<String>) -> LoadedTarget {
    match read_servers(path) {
        Ok(servers) => {
            debug!(path = %path.display(), servers = servers.len(), "config loaded");
            Ok(ScanTarget::new(path, client, servers))
        }
        Err(error) => Err(TargetLoadError {
            path: path.to_path_buf(),
            client,
            error,
        }),
    }
}

fn read_servers(path: &Path) -> Result<Vec<ServerEntry>> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => CoreError::ConfigNotFound(path.to_path_buf()),
        _ => CoreError::Io(e),
    })?;
    parse_servers(path, &text)
}

/// Parses config text into server entries, in file order.
pub fn parse_servers(path: &Path, text: &str) -> Result<Vec<ServerEntry>> {
    let parse_error = |reason: String| CoreError::ConfigParse {
        path: path.to_path_buf(),
        reason,
    };

    let doc = parse_document(text).map_err(parse_error)?;
    let servers = servers_map(&doc).ok_or_else(|| {
        parse_error("no mcpServers, mcp.servers or servers section".to_string())
    })?;

    servers
        .iter()
        .map(|(name, raw)| parse_entry(name, raw).map_err(parse_error))
        .collect()
}

/// Parses a config document. Comments and trailing commas are accepted,
/// as VS Code settings files carry them.
pub fn parse_document(text: &str) -> std::result::Result<Value, String> {
    json5::from_str(text).map_err(|e| e.to_string())
}

/// Returns the servers object of a config document.
pub fn servers_map(doc: &Value) -> Option<&Map<String, Value>> {
    doc.get("mcpServers")
        .or_else(|| doc.get("mcp").and_then(|mcp| mcp.get("servers")))
        .or_else(|| doc.get("servers"))
        .and_then(Value::as_object)
}

/// Mutable form of [`servers_map`].
pub fn servers_map_mut(doc: &mut Value) -> Option<&mut Map<String, Value>> {
    let key = if doc.get("mcpServers").is_some() {
        Some("mcpServers")
    } else if doc.get("mcp").and_then(|m| m.get("servers")).is_some() {
        None
    } else {
        Some("servers")
    };
    match key {
        Some(key) => doc.get_mut(key).and_then(Value::as_object_mut),
        None => doc
            .get_mut("mcp")
            .and_then(|mcp| mcp.get_mut("servers"))
            .and_then(Value::as_object_mut),
    }
}

/// Parses one server entry.
pub fn parse_entry(name: &str, raw: &Value) -> std::result::Result<ServerEntry, String> {
    let obj = raw
        .as_object()
        .ok_or_else(|| format!("server '{name}' is not an object"))?;
    let declared = obj.get("type").and_then(Value::as_str);

    let transport = if let Some(command) = obj.get("command").and_then(Value::as_str) {
        let args = string_list(obj.get("args"));
        let (command, args) = rebalance_command(command, args);
        Transport::Stdio {
            command,
            args,
            env: string_map(obj.get("env")),
        }
    } else if let Some(url) = obj.get("url").and_then(Value::as_str) {
        let headers = string_map(obj.get("headers"));
        match declared {
            Some("http") | Some("streamable-http") | Some("streamableHttp") => Transport::Http {
                url: url.to_string(),
                headers,
            },
            _ => Transport::Sse {
                url: url.to_string(),
                headers,
            },
        }
    } else {
        return Err(format!("server '{name}' has neither command nor url"));
    };

    Ok(ServerEntry {
        name: name.to_string(),
        transport,
        trust_origin: obj
            .get("origin")
            .and_then(Value::as_str)
            .map(str::to_string),
        raw: raw.clone(),
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Splits a command string containing arguments and prepends the tail to
/// `args`.
pub fn rebalance_command(command: &str, args: Vec<String>) -> (String, Vec<String>) {
    let mut words = shell_split(command);
    if words.len() <= 1 {
        let command = words.pop().unwrap_or_else(|| command.to_string());
        return (command, args);
    }
    let head = words.remove(0);
    words.extend(args);
    (head, words)
}

/// Splits on whitespace, honoring single and double quotes and backslash
/// escapes outside single quotes.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

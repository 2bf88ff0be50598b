//! Client config rewriting for interception.
//!
//! Installing replaces the launch command of each stdio server with
//!
//! ```text
//! <tripwire> bridge --connect 127.0.0.1:<port> --client <c> --server <s> --exec <command> <args>...
//! ```
//!
//! keeping every other field of the entry. The whole original file is
//! snapshotted first and every write goes through a temp file in the same
//! directory plus a rename, so a config is never left half-written.
//!
//! Uninstalling writes the snapshot back byte for byte when the file is
//! still exactly what install wrote. If something else edited it since,
//! only the rewritten entries are put back. [`InstallGuard`] restores on
//! drop, so early returns and panics restore too.

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::error::{CoreError, Result};
use crate::normalize::{parse_document, servers_map_mut};
use crate::target::Transport;

/// Subcommand the rewritten entries run.
pub const BRIDGE_SUBCOMMAND: &str = "bridge";

/// Separates bridge options from the original command line.
pub const EXEC_FLAG: &str = "--exec";

/// One rewritten server entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySession {
    /// Client of the server.
    pub client: String,
    /// Server name in the config.
    pub server: String,
    /// Entry as it was before install.
    pub original: Value,
    /// Entry as install wrote it.
    pub injected: Value,
    /// Interception endpoint the bridge connects to.
    pub endpoint: SocketAddr,
}

/// Launch parameters of the real server behind a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    /// Executable.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: std::collections::BTreeMap<String, String>,
}

impl Upstream {
    /// Reads the launch parameters of a stdio transport.
    pub fn from_transport(transport: &Transport) -> Option<Self> {
        match transport {
            Transport::Stdio { command, args, env } => Some(Self {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
            }),
            _ => None,
        }
    }
}

/// A config file as install left it.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledConfig {
    /// Config file.
    pub path: PathBuf,
    /// Exact contents before install.
    pub original: String,
    /// Exact contents install wrote.
    pub written: String,
    /// Rewritten entries.
    pub sessions: Vec<ProxySession>,
}

/// What to route where, for one config file.
#[derive(Debug, Clone)]
pub struct InstallPlan<'a> {
    /// Config file.
    pub path: &'a Path,
    /// Client name passed to the bridge.
    pub client: &'a str,
    /// `(server name, endpoint)` pairs to rewrite.
    pub routes: Vec<(String, SocketAddr)>,
    /// Binary providing the `bridge` subcommand.
    pub bridge: &'a Path,
}

/// Whether an entry already routes through a bridge.
pub fn is_installed(entry: &Value) -> bool {
    let args = string_args(entry);
    match args.iter().position(|a| a == BRIDGE_SUBCOMMAND) {
        Some(i) => args[i..].iter().any(|a| a == EXEC_FLAG),
        None => false,
    }
}

/// Builds the bridge entry for `original`.
pub fn inject_entry(original: &Value, bridge: &Path, endpoint: SocketAddr, client: &str, server: &str) -> Result<Value> {
    let obj = original
        .as_object()
        .ok_or_else(|| CoreError::Install(format!("server '{server}' is not an object")))?;
    let command = obj
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Install(format!("server '{server}' has no command")))?;

    let mut args = vec![
        Value::from(BRIDGE_SUBCOMMAND),
        Value::from("--connect"),
        Value::from(endpoint.to_string()),
        Value::from("--client"),
        Value::from(client),
        Value::from("--server"),
        Value::from(server),
        Value::from(EXEC_FLAG),
        Value::from(command),
    ];
    args.extend(string_args(original).into_iter().map(Value::from));

    let mut injected = obj.clone();
    injected.insert("command".into(), Value::from(bridge.to_string_lossy().into_owned()));
    injected.insert("args".into(), Value::Array(args));
    Ok(Value::Object(injected))
}

/// Rebuilds the original entry from a bridge entry alone.
pub fn extract_original(entry: &Value) -> Option<Value> {
    let args = string_args(entry);
    let bridge = args.iter().position(|a| a == BRIDGE_SUBCOMMAND)?;
    let exec = bridge + args[bridge..].iter().position(|a| a == EXEC_FLAG)?;
    let mut tail = args[exec + 1..].iter().cloned();
    let command = tail.next()?;

    let mut restored = entry.as_object()?.clone();
    restored.insert("command".into(), Value::from(command));
    let rest: Vec<Value> = tail.map(Value::from).collect();
    if rest.is_empty() {
        restored.remove("args");
    } else {
        restored.insert("args".into(), Value::Array(rest));
    }
    Some(Value::Object(restored))
}

/// Rewrites the entries named in `plan`.
///
/// Nothing is written if any entry cannot be rewritten.
pub fn install(plan: &InstallPlan<'_>) -> Result<InstalledConfig> {
    let original = std::fs::read_to_string(plan.path)?;
    let mut doc = parse_document(&original).map_err(|reason| CoreError::ConfigParse {
        path: plan.path.to_path_buf(),
        reason,
    })?;
    let servers = servers_map_mut(&mut doc).ok_or_else(|| CoreError::ConfigParse {
        path: plan.path.to_path_buf(),
        reason: "no servers section".into(),
    })?;

    let mut sessions = Vec::with_capacity(plan.routes.len());
    for (name, endpoint) in &plan.routes {
        let entry = servers
            .get(name)
            .ok_or_else(|| CoreError::Install(format!("server '{name}' not found in {}", plan.path.display())))?;
        if is_installed(entry) {
            return Err(CoreError::Install(format!(
                "server '{name}' is already intercepted; run `tripwire uninstall` first"
            )));
        }
        let injected = inject_entry(entry, plan.bridge, *endpoint, plan.client, name)?;
        sessions.push(ProxySession {
            client: plan.client.to_string(),
            server: name.clone(),
            original: entry.clone(),
            injected,
            endpoint: *endpoint,
        });
    }
    for session in &sessions {
        servers.insert(session.server.clone(), session.injected.clone());
    }

    let written = render(&doc)?;
    write_atomic(plan.path, &written)?;
    info!(path = %plan.path.display(), servers = sessions.len(), "interception installed");

    Ok(InstalledConfig {
        path: plan.path.to_path_buf(),
        original,
        written,
        sessions,
    })
}

/// Restores one installed config.
///
/// # Errors
///
/// [`CoreError::ConfigRestore`] with the original file contents when the
/// file cannot be written back.
pub fn uninstall(installed: &InstalledConfig) -> Result<()> {
    let restore_failed = |reason: String| CoreError::ConfigRestore {
        path: installed.path.clone(),
        reason,
        original: installed.original.clone(),
    };

    let current = match std::fs::read_to_string(&installed.path) {
        Ok(current) => current,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(restore_failed(e.to_string())),
    };

    let contents = if current == installed.written || current.is_empty() {
        installed.original.clone()
    } else {
        warn!(path = %installed.path.display(), "config changed while intercepted; restoring entries only");
        let mut doc = parse_document(&current).map_err(restore_failed)?;
        let servers = servers_map_mut(&mut doc)
            .ok_or_else(|| restore_failed("servers section disappeared".into()))?;
        for session in &installed.sessions {
            if servers.get(&session.server) == Some(&session.injected) {
                servers.insert(session.server.clone(), session.original.clone());
            }
        }
        render(&doc).map_err(|e| restore_failed(e.to_string()))?
    };

    write_atomic(&installed.path, &contents).map_err(|e| restore_failed(e.to_string()))?;
    info!(path = %installed.path.display(), "interception removed");
    Ok(())
}

/// Restores every bridge entry of a config from the entry alone.
///
/// Used after a crash left entries rewritten. Returns the restored server
/// names.
pub fn uninstall_from_config(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CoreError::ConfigNotFound(path.to_path_buf()),
        _ => CoreError::Io(e),
    })?;
    let mut doc = parse_document(&text).map_err(|reason| CoreError::ConfigParse {
        path: path.to_path_buf(),
        reason,
    })?;
    let Some(servers) = servers_map_mut(&mut doc) else {
        return Ok(Vec::new());
    };

    let restored = restore_entries(servers);
    if restored.is_empty() {
        return Ok(restored);
    }
    let contents = render(&doc)?;
    write_atomic(path, &contents).map_err(|e| CoreError::ConfigRestore {
        path: path.to_path_buf(),
        reason: e.to_string(),
        original: text.clone(),
    })?;
    info!(path = %path.display(), servers = ?restored, "bridge entries restored");
    Ok(restored)
}

fn restore_entries(servers: &mut Map<String, Value>) -> Vec<String> {
    let mut restored = Vec::new();
    for (name, entry) in servers.iter_mut() {
        if !is_installed(entry) {
            continue;
        }
        if let Some(original) = extract_original(entry) {
            *entry = original;
            restored.push(name.clone());
        }
    }
    restored
}

/// Restores configs exactly once, on [`InstallGuard::restore`] or on drop.
#[derive(Debug, Default)]
pub struct InstallGuard {
    installed: Vec<InstalledConfig>,
}

impl InstallGuard {
    /// Creates an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes responsibility for restoring `config`.
    pub fn push(&mut self, config: InstalledConfig) {
        self.installed.push(config);
    }

    /// Installed configs not yet restored.
    pub fn installed(&self) -> &[InstalledConfig] {
        &self.installed
    }

    /// Restores every config. Later calls do nothing.
    ///
    /// Every config is attempted; the failures are returned together.
    pub fn restore(&mut self) -> Vec<CoreError> {
        let mut failures = Vec::new();
        for config in self.installed.drain(..) {
            if let Err(e) = uninstall(&config) {
                error!(path = %config.path.display(), error = %e, "config restore failed");
                failures.push(e);
            }
        }
        failures
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        for failure in self.restore() {
            // Last chance to surface the original payload.
            eprintln!("{failure}");
        }
    }
}

fn string_args(entry: &Value) -> Vec<String> {
    entry
        .get("args")
        .and_then(Value::as_array)
        .map(|args| args.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn render(doc: &Value) -> Result<String> {
    let mut text = serde_json::to_string_pretty(doc)?;
    text.push('\n');
    Ok(text)
}

/// Writes via a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONFIG: &str = r#"{
  "mcpServers": {
    "notes":   { "command": "npx", "args": ["-y", "notes-server"], "env": {"TOKEN": "x"} },
    "weather": { "url": "https://weather.example/sse" }
  },
  "theme": "dark"
}
"#;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:40123".parse().unwrap()
    }

    #[test]
    fn test_inject_and_extract_are_inverse() {
        let original = json!({"command": "npx", "args": ["-y", "notes-server"], "env": {"TOKEN": "x"}});
        let injected = inject_entry(&original, Path::new("/usr/bin/tripwire"), endpoint(), "cursor", "notes").unwrap();

        assert!(is_installed(&injected));
        assert!(!is_installed(&original));
        assert_eq!(injected["command"], "/usr/bin/tripwire");
        assert_eq!(injected["env"], json!({"TOKEN": "x"}));
        assert_eq!(extract_original(&injected).unwrap(), original);
    }

    #[test]
    fn test_install_then_uninstall_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, CONFIG).unwrap();

        let plan = InstallPlan {
            path: &path,
            client: "cursor",
            routes: vec![("notes".into(), endpoint())],
            bridge: Path::new("/usr/bin/tripwire"),
        };
        let installed = install(&plan).unwrap();
        let during: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(is_installed(&during["mcpServers"]["notes"]));
        assert_eq!(during["mcpServers"]["weather"]["url"], "https://weather.example/sse");

        uninstall(&installed).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CONFIG);
    }

    #[test]
    fn test_commented_config_is_restored_with_comments() {
        let commented = "{\n  // managed by hand\n  \"mcp\": {\"servers\": {\"notes\": {\"command\": \"npx\",},},},\n}\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, commented).unwrap();

        let plan = InstallPlan {
            path: &path,
            client: "vscode",
            routes: vec![("notes".into(), endpoint())],
            bridge: Path::new("/usr/bin/tripwire"),
        };
        let installed = install(&plan).unwrap();
        let during: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(is_installed(&during["mcp"]["servers"]["notes"]));

        uninstall(&installed).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), commented);
    }

    #[test]
    fn test_guard_restores_on_drop_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, CONFIG).unwrap();

        let plan = InstallPlan {
            path: &path,
            client: "cursor",
            routes: vec![("notes".into(), endpoint())],
            bridge: Path::new("/usr/bin/tripwire"),
        };
        let mut guard = InstallGuard::new();
        guard.push(install(&plan).unwrap());
        assert!(guard.restore().is_empty());
        assert!(guard.installed().is_empty());
        assert!(guard.restore().is_empty());
        drop(guard);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CONFIG);
    }

    #[test]
    fn test_install_refuses_remote_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, CONFIG).unwrap();

        let plan = InstallPlan {
            path: &path,
            client: "cursor",
            routes: vec![("weather".into(), endpoint())],
            bridge: Path::new("/usr/bin/tripwire"),
        };
        assert!(matches!(install(&plan), Err(CoreError::Install(_))));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CONFIG);
    }

    #[test]
    fn test_recovery_from_config_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, CONFIG).unwrap();

        let plan = InstallPlan {
            path: &path,
            client: "cursor",
            routes: vec![("notes".into(), endpoint())],
            bridge: Path::new("/usr/bin/tripwire"),
        };
        let _ = install(&plan).unwrap();
        let restored = uninstall_from_config(&path).unwrap();
        assert_eq!(restored, vec!["notes".to_string()]);

        let after: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let before: Value = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn test_edited_config_restores_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, CONFIG).unwrap();

        let plan = InstallPlan {
            path: &path,
            client: "cursor",
            routes: vec![("notes".into(), endpoint())],
            bridge: Path::new("/usr/bin/tripwire"),
        };
        let installed = install(&plan).unwrap();
        let mut doc: Value = serde_json::from_str(&installed.written).unwrap();
        doc["theme"] = json!("light");
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        uninstall(&installed).unwrap();
        let after: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(after["theme"], "light");
        assert_eq!(after["mcpServers"]["notes"]["command"], "npx");
    }
}

//! Scan targets and the server entries they declare.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a server is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    /// A child process speaking newline-delimited JSON-RPC over stdio.
    Stdio {
        /// Executable.
        command: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// A server-sent-events endpoint.
    Sse {
        /// Stream URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// A streamable HTTP endpoint.
    Http {
        /// Endpoint URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl Transport {
    /// Short name used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Stdio { .. } => "stdio",
            Transport::Sse { .. } => "sse",
            Transport::Http { .. } => "http",
        }
    }

    /// Returns true for [`Transport::Stdio`].
    pub fn is_stdio(&self) -> bool {
        matches!(self, Transport::Stdio { .. })
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stdio { command, args, .. } => {
                write!(f, "{command}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            Transport::Sse { url, .. } | Transport::Http { url, .. } => f.write_str(url),
        }
    }
}

/// One server declared in a client config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Name, unique within its target.
    pub name: String,
    /// How to reach the server.
    pub transport: Transport,
    /// Declared trust origin, if the config names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_origin: Option<String>,
    /// The entry exactly as it appears in the file.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

impl ServerEntry {
    /// Creates an entry with no raw payload.
    pub fn new(name: impl Into<String>, transport: Transport) -> Self {
        Self {
            name: name.into(),
            transport,
            trust_origin: None,
            raw: serde_json::Value::Null,
        }
    }
}

/// A client configuration file and the servers it declares.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanTarget {
    /// Config file.
    pub path: PathBuf,
    /// Client kind (`cursor`, `claude`, ...), when known.
    pub client: Option<String>,
    /// Servers in file order.
    pub servers: Vec<ServerEntry>,
}

impl ScanTarget {
    /// Creates a target.
    pub fn new(path: impl Into<PathBuf>, client: Option<String>, servers: Vec<ServerEntry>) -> Self {
        Self {
            path: path.into(),
            client,
            servers,
        }
    }

    /// Client name used for guardrail lookup. Falls back to the file stem.
    pub fn client_name(&self) -> String {
        self.client.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string())
        })
    }
}

/// A target whose config could not be loaded.
#[derive(Debug)]
pub struct TargetLoadError {
    /// Config file.
    pub path: PathBuf,
    /// Client kind, when known.
    pub client: Option<String>,
    /// Why loading failed.
    pub error: crate::CoreError,
}

/// Outcome of loading one target.
pub type LoadedTarget = std::result::Result<ScanTarget, TargetLoadError>;

//! Error types for Tripwire Core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Core error type for scan and proxy operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The server did not finish the handshake in time.
    #[error("server '{server}' did not respond within {}s", timeout.as_secs_f64())]
    ConnectTimeout {
        /// Server name.
        server: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The transport could not be established.
    #[error("could not connect to server '{server}': {reason}")]
    Connect {
        /// Server name.
        server: String,
        /// What went wrong.
        reason: String,
    },

    /// The server answered with something that is not a valid session.
    #[error("protocol error from server '{server}': {reason}")]
    Protocol {
        /// Server name.
        server: String,
        /// What went wrong.
        reason: String,
    },

    /// The remote classification service failed.
    #[error("could not reach verification server {0}")]
    ClassificationUnavailable(String),

    /// A client config could not be put back after proxying.
    ///
    /// The original payload is part of the message so it can be restored
    /// by hand.
    #[error(
        "could not restore {}: {reason}\n--- original contents ---\n{original}\n--- end ---",
        path.display()
    )]
    ConfigRestore {
        /// Config file that was left modified.
        path: PathBuf,
        /// Why the write failed.
        reason: String,
        /// Exact contents before installation.
        original: String,
    },

    /// The client config file is missing.
    #[error("file does not exist: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The client config file is not in a known dialect.
    #[error("could not parse file {}: {reason}", path.display())]
    ConfigParse {
        /// Config file.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A client shorthand that names no known client.
    #[error("{0} is not a valid client shorthand")]
    UnknownClient(String),

    /// Interception could not be installed.
    #[error("proxy install failed: {0}")]
    Install(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Registry error passthrough.
    #[error("Registry error: {0}")]
    Registry(#[from] tripwire_registry::RegistryError),

    /// Guardrail error passthrough.
    #[error("Guardrail error: {0}")]
    Guard(#[from] tripwire_guard::GuardError),
}

impl CoreError {
    /// Returns true for [`CoreError::ConnectTimeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::ConnectTimeout { .. })
    }

    /// A [`CoreError::Protocol`] for `server`.
    pub fn protocol(server: &str, reason: impl Into<String>) -> Self {
        CoreError::Protocol {
            server: server.to_string(),
            reason: reason.into(),
        }
    }

    /// A [`CoreError::Connect`] for `server`.
    pub fn connect(server: &str, reason: impl Into<String>) -> Self {
        CoreError::Connect {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

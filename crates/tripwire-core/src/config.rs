//! Configuration types for Tripwire.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default verification service.
pub const DEFAULT_BASE_URL: &str = "https://mcp.invariantlabs.ai/";

/// How toxic flows are ordered before the display cut-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRanking {
    /// Highest severity first, then shorter paths, then discovery order.
    #[default]
    SeverityThenLength,
    /// Shorter paths first, then discovery order.
    ShortestFirst,
    /// Order in which the paths were enumerated.
    Discovery,
}

/// Scanner settings.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tripwire_core::ScannerConfig;
///
/// let config = ScannerConfig::default()
///     .with_checks_per_server(3)
///     .with_server_timeout(Duration::from_secs(5));
/// assert_eq!(config.checks_per_server, 3);
/// assert_eq!(config.toxic_flow_top_k, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Base URL of the verification service.
    pub base_url: String,

    /// How many times each server is listed. More than one enables the
    /// stability check.
    pub checks_per_server: u32,

    /// Wall-clock limit for connecting to a server, and for each listing.
    pub server_timeout: Duration,

    /// Capture server stderr instead of passing it through.
    pub suppress_io: bool,

    /// Servers scanned at the same time.
    pub max_concurrency: usize,

    /// Where the registry, guardrail config and audit log live.
    pub storage_dir: PathBuf,

    /// Show every toxic flow in rendered output.
    pub full_toxic_flows: bool,

    /// Toxic flows shown when `full_toxic_flows` is off.
    pub toxic_flow_top_k: usize,

    /// Ordering applied before the cut-off.
    pub flow_ranking: FlowRanking,

    /// Submit descriptors to the verification service.
    pub classify_remote: bool,

    /// Limit for one verification request.
    pub classifier_timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            checks_per_server: 1,
            server_timeout: Duration::from_secs(10),
            suppress_io: true,
            max_concurrency: 8,
            storage_dir: default_storage_dir(),
            full_toxic_flows: false,
            toxic_flow_top_k: 3,
            flow_ranking: FlowRanking::default(),
            classify_remote: true,
            classifier_timeout: Duration::from_secs(30),
        }
    }
}

impl ScannerConfig {
    /// Set the verification service URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the number of listings per server. Zero is treated as one.
    #[must_use]
    pub const fn with_checks_per_server(mut self, checks: u32) -> Self {
        self.checks_per_server = if checks == 0 { 1 } else { checks };
        self
    }

    /// Set the per-server timeout.
    #[must_use]
    pub const fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    /// Capture or pass through server stderr.
    #[must_use]
    pub const fn with_suppress_io(mut self, suppress: bool) -> Self {
        self.suppress_io = suppress;
        self
    }

    /// Set the concurrency cap. Zero is treated as one.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = if max == 0 { 1 } else { max };
        self
    }

    /// Set the storage directory.
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Show all toxic flows.
    #[must_use]
    pub const fn with_full_toxic_flows(mut self, full: bool) -> Self {
        self.full_toxic_flows = full;
        self
    }

    /// Set the flow ranking policy.
    #[must_use]
    pub const fn with_flow_ranking(mut self, ranking: FlowRanking) -> Self {
        self.flow_ranking = ranking;
        self
    }

    /// Enable or disable the verification service.
    #[must_use]
    pub const fn with_classify_remote(mut self, enabled: bool) -> Self {
        self.classify_remote = enabled;
        self
    }

    /// Path of the sled registry.
    pub fn registry_path(&self) -> PathBuf {
        self.storage_dir.join("registry")
    }

    /// Path of the guardrail YAML file.
    pub fn guardrails_path(&self) -> PathBuf {
        self.storage_dir.join("guardrails_config.yml")
    }

    /// Path of the audit log.
    pub fn audit_path(&self) -> PathBuf {
        self.storage_dir.join("audit.jsonl")
    }

    /// Path of the anonymous identifier sent with uploads.
    pub fn identity_path(&self) -> PathBuf {
        self.storage_dir.join("identity")
    }
}

/// Proxy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Guardrail YAML file.
    pub guardrails_path: PathBuf,

    /// JSON-lines audit log.
    pub audit_path: PathBuf,

    /// Executable written into client configs as the bridge.
    pub bridge_executable: PathBuf,

    /// Capture server stderr instead of passing it through.
    pub suppress_io: bool,
}

impl ProxyConfig {
    /// Derives proxy paths from a scanner config.
    ///
    /// The bridge defaults to the running executable, falling back to
    /// `tripwire` on `PATH`.
    pub fn from_scanner(config: &ScannerConfig) -> Self {
        Self {
            guardrails_path: config.guardrails_path(),
            audit_path: config.audit_path(),
            bridge_executable: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from("tripwire")),
            suppress_io: config.suppress_io,
        }
    }

    /// Set the bridge executable.
    #[must_use]
    pub fn with_bridge_executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.bridge_executable = exe.into();
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::from_scanner(&ScannerConfig::default())
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tripwire"))
        .unwrap_or_else(|| PathBuf::from(".tripwire"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScannerConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.checks_per_server, 1);
        assert_eq!(config.server_timeout, Duration::from_secs(10));
        assert!(config.suppress_io);
        assert_eq!(config.max_concurrency, 8);
        assert!(!config.full_toxic_flows);
        assert_eq!(config.flow_ranking, FlowRanking::SeverityThenLength);
        assert!(config.storage_dir.ends_with(".tripwire"));
    }

    #[test]
    fn test_zero_values_clamped() {
        let config = ScannerConfig::default()
            .with_checks_per_server(0)
            .with_max_concurrency(0);
        assert_eq!(config.checks_per_server, 1);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_storage_layout() {
        let config = ScannerConfig::default().with_storage_dir("/data/tw");
        assert_eq!(config.registry_path(), PathBuf::from("/data/tw/registry"));
        assert_eq!(
            config.guardrails_path(),
            PathBuf::from("/data/tw/guardrails_config.yml")
        );

        assert_eq!(config.identity_path(), PathBuf::from("/data/tw/identity"));

        let proxy = ProxyConfig::from_scanner(&config);
        assert_eq!(proxy.audit_path, PathBuf::from("/data/tw/audit.jsonl"));
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: ScannerConfig =
            serde_json::from_str(r#"{"checks_per_server": 2, "flow_ranking": "shortest_first"}"#)
                .unwrap();
        assert_eq!(config.checks_per_server, 2);
        assert_eq!(config.flow_ranking, FlowRanking::ShortestFirst);
        assert_eq!(config.toxic_flow_top_k, 3);
    }
}

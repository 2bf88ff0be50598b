//! # Result Upload
//!
//! Pushes scan results to a control server, one request per target.
//!
//! ## Wire Contract
//!
//! ```text
//! POST {control_server}/api/scans/push
//!   { ...TargetResult, push_key, client, scan_user_info }
//! 200
//! ```
//!
//! `scan_user_info` always carries an anonymous identifier, kept in the
//! storage directory between runs. With opt-out the identifier is
//! regenerated and then forgotten, and every other field is null.
//!
//! Upload failures are logged and counted. They never fail the scan.

use std::net::{IpAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ScannerConfig;
use crate::error::Result;
use crate::report::{ScanReport, TargetResult};

const USER_AGENT: &str = concat!("tripwire/", env!("CARGO_PKG_VERSION"));

/// Where and how results are pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Base URL of the control server.
    pub control_server: String,
    /// Authenticates the push.
    pub push_key: String,
    /// Contact address sent with the results.
    pub email: Option<String>,
    /// Send only a fresh anonymous identifier.
    pub opt_out: bool,
    /// File holding the anonymous identifier.
    pub identity_path: PathBuf,
    /// Limit for one push.
    pub timeout: Duration,
}

impl UploadConfig {
    /// Pushes to `control_server`, keeping the identity in the scanner's
    /// storage directory.
    pub fn new(
        control_server: impl Into<String>,
        push_key: impl Into<String>,
        scanner: &ScannerConfig,
    ) -> Self {
        Self {
            control_server: control_server.into(),
            push_key: push_key.into(),
            email: None,
            opt_out: false,
            identity_path: scanner.identity_path(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the contact address.
    #[must_use]
    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    /// Withhold everything but a fresh identifier.
    #[must_use]
    pub const fn with_opt_out(mut self, opt_out: bool) -> Self {
        self.opt_out = opt_out;
        self
    }

    /// Set the per-push limit.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/api/scans/push", self.control_server.trim_end_matches('/'))
    }
}

/// Anonymous identifier persisted as plain text.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the stored identifier, creating one if none is stored or
    /// `regenerate` is set.
    pub fn get(&self, regenerate: bool) -> Result<String> {
        if !regenerate {
            if let Some(existing) = self.read() {
                return Ok(existing);
            }
        }
        let fresh = Uuid::new_v4().to_string();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &fresh)?;
        Ok(fresh)
    }

    /// Forgets the identifier. A missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Path of the identity file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Option<String> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Who ran the scan, as sent to the control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanUserInfo {
    /// Machine name.
    pub hostname: Option<String>,
    /// Login name.
    pub username: Option<String>,
    /// Contact address given on the command line.
    pub email: Option<String>,
    /// First non-loopback IPv4 address.
    pub ip_address: Option<String>,
    /// Stable across runs unless opted out.
    pub anonymous_identifier: String,
}

impl ScanUserInfo {
    /// Collects the user info for `config`.
    ///
    /// With opt-out a new identifier is generated and the stored one is
    /// cleared, so the next run starts from yet another identifier.
    pub fn collect(config: &UploadConfig) -> Self {
        let store = IdentityStore::new(&config.identity_path);
        let anonymous_identifier = store.get(config.opt_out).unwrap_or_else(|e| {
            warn!(path = %store.path().display(), error = %e, "identity not persisted");
            Uuid::new_v4().to_string()
        });

        if config.opt_out {
            if let Err(e) = store.clear() {
                warn!(path = %store.path().display(), error = %e, "identity not cleared");
            }
            return Self {
                hostname: None,
                username: None,
                email: None,
                ip_address: None,
                anonymous_identifier,
            };
        }

        Self {
            hostname: Some(local_hostname()),
            username: Some(local_username()),
            email: config.email.clone(),
            ip_address: Some(local_ip_address()),
            anonymous_identifier,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

// Connecting a UDP socket sends nothing; it only selects the outbound
// interface.
fn local_ip_address() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("192.0.2.1:80")?;
            socket.local_addr()
        })
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| matches!(ip, IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified()))
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

/// Outcome of one upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    /// Targets the control server accepted.
    pub pushed: usize,
    /// Targets that could not be pushed.
    pub failed: usize,
}

/// Pushes scan reports to a control server.
#[derive(Debug, Clone)]
pub struct Uploader {
    http: Client,
    config: UploadConfig,
}

impl Uploader {
    /// Creates an uploader for `config`.
    pub fn new(config: UploadConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    /// Pushes every target of `report`. Failures are logged and counted.
    pub async fn push(&self, report: &ScanReport) -> UploadSummary {
        let mut summary = UploadSummary::default();
        if report.targets.is_empty() {
            info!("no scan results to upload");
            return summary;
        }

        let user = ScanUserInfo::collect(&self.config);
        let url = self.config.endpoint();
        for target in &report.targets {
            let payload = match push_payload(target, &self.config.push_key, &user) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(path = %target.path.display(), error = %e, "result not serializable");
                    summary.failed += 1;
                    continue;
                }
            };
            match self.post(&url, &payload).await {
                Ok(()) => {
                    debug!(path = %target.path.display(), "result uploaded");
                    summary.pushed += 1;
                }
                Err(reason) => {
                    warn!(url = %url, path = %target.path.display(), error = %reason, "upload failed");
                    summary.failed += 1;
                }
            }
        }
        info!(pushed = summary.pushed, failed = summary.failed, "upload finished");
        summary
    }

    async fn post(&self, url: &str, body: &Value) -> std::result::Result<(), String> {
        let response = self
            .http
            .post(url)
            .timeout(self.config.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(format!("status {status}: {}", text.trim()))
    }
}

/// One target's result with the push key, client and user info merged in.
pub fn push_payload(
    target: &TargetResult,
    push_key: &str,
    user: &ScanUserInfo,
) -> serde_json::Result<Value> {
    let mut payload = serde_json::to_value(target)?;
    if let Value::Object(map) = &mut payload {
        let client = target
            .client
            .clone()
            .unwrap_or_else(|| target.path.display().to_string());
        map.insert("push_key".to_string(), Value::String(push_key.to_string()));
        map.insert("client".to_string(), Value::String(client));
        map.insert("scan_user_info".to_string(), serde_json::to_value(user)?);
    }
    Ok(payload)
}

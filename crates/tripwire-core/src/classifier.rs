//! # Remote Classification
//!
//! Submits a server's descriptors to the verification service and reads
//! back one judgement per entity.
//!
//! ## Wire Contract
//!
//! ```text
//! POST {base}/api/v1/public/mcp-scan
//!   [ {metadata, prompts, resources, tools} ]          one signature
//! 200
//!   [ [ {verified: true|false|null, status}, ... ] ]   one list per signature,
//!                                                      prompts, resources, tools
//!
//! POST {base}/api/v1/public/mcp-scan/whitelist
//!   {name, hash}                                       contributed entries only
//! ```
//!
//! Any transport or status failure is [`CoreError::ClassificationUnavailable`]
//! and every entity of that server fails. Nothing is ever upgraded to
//! verified on error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tripwire_registry::{WhitelistEntry, WhitelistScope};

use crate::error::{CoreError, Result};
use crate::session::ServerListing;

/// What the verification service said about one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteVerdict {
    /// Judged safe.
    Verified,
    /// Judged unsafe, with the service's explanation.
    Flagged(String),
    /// Not judged.
    Skipped(String),
}

/// A remote judge of descriptor text.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classifies every entity of one server, in listing order (prompts,
    /// resources, tools).
    async fn classify(&self, server: &str, listing: &ServerListing) -> Result<Vec<RemoteVerdict>>;

    /// Shares an approved definition. Only called for contributed entries.
    async fn contribute(&self, entry: &WhitelistEntry) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct EntityJudgement {
    verified: Option<bool>,
    #[serde(default)]
    status: Option<String>,
}

impl From<EntityJudgement> for RemoteVerdict {
    fn from(j: EntityJudgement) -> Self {
        match j.verified {
            Some(true) => RemoteVerdict::Verified,
            Some(false) => RemoteVerdict::Flagged(
                j.status
                    .unwrap_or_else(|| "flagged by verification server".to_string()),
            ),
            None => RemoteVerdict::Skipped(j.status.unwrap_or_else(|| "not verified".to_string())),
        }
    }
}

/// Classifier backed by the HTTP verification service.
#[derive(Debug, Clone)]
pub struct RemoteClassifier {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl RemoteClassifier {
    /// Creates a classifier for `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}/api/v1/public/mcp-scan{suffix}", self.base_url)
    }

    async fn post(&self, url: &str, body: &Value) -> std::result::Result<Response, String> {
        self.http
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|e| e.to_string())
    }
}

/// Builds the signature of one server as sent to the service.
pub fn server_signature(listing: &ServerListing) -> Value {
    json!({
        "metadata": {
            "protocolVersion": listing.info.protocol_version,
            "capabilities": listing.info.capabilities,
            "serverInfo": {
                "name": listing.info.name,
                "version": listing.info.version,
            },
            "instructions": listing.info.instructions,
        },
        "prompts": listing.prompts,
        "resources": listing.resources,
        "tools": listing.tools,
    })
}

fn unavailable(message: &str) -> CoreError {
    let first = message.lines().next().unwrap_or_default();
    CoreError::ClassificationUnavailable(first.to_string())
}

#[async_trait]
impl Classifier for RemoteClassifier {
    async fn classify(&self, server: &str, listing: &ServerListing) -> Result<Vec<RemoteVerdict>> {
        let expected = listing.prompts.len() + listing.resources.len() + listing.tools.len();
        if expected == 0 {
            return Ok(Vec::new());
        }

        let payload = json!([server_signature(listing)]);
        let response = self
            .post(&self.endpoint(""), &payload)
            .await
            .map_err(|e| unavailable(&e))?;
        let mut per_server: Vec<Vec<EntityJudgement>> = response
            .json()
            .await
            .map_err(|e| unavailable(&e.to_string()))?;

        let judgements = match per_server.pop() {
            Some(j) if per_server.is_empty() && j.len() == expected => j,
            _ => return Err(unavailable("response does not match the submitted entities")),
        };

        debug!(server, entities = expected, "classified");
        Ok(judgements.into_iter().map(RemoteVerdict::from).collect())
    }

    async fn contribute(&self, entry: &WhitelistEntry) -> Result<()> {
        if entry.scope != WhitelistScope::Contributed {
            return Ok(());
        }
        let body = json!({"name": entry.name, "hash": entry.hash.to_hex()});
        match self.post(&self.endpoint("/whitelist"), &body).await {
            Ok(_) => {
                info!(name = %entry.name, "contributed to shared whitelist");
                Ok(())
            }
            Err(e) => {
                warn!(name = %entry.name, error = %e, "whitelist contribution failed");
                Err(unavailable(&e))
            }
        }
    }
}

//! Scan and inspect result trees, and their renderers.
//!
//! The trees are the stable, serializable output of the engine. JSON output
//! is the full tree; text output truncates toxic flows to the configured
//! top-K.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tripwire_guard::CapabilityLabel;
use tripwire_registry::{CapabilityDescriptor, EntityHash, EntityRef};

use crate::config::{FlowRanking, ScannerConfig};
use crate::error::CoreError;
use crate::session::{ServerInfo, ServerListing};
use crate::verdict::{Flag, Verdict};
use crate::verify::shadowing::ShadowingFinding;
use crate::verify::toxic::{displayed_flows, ToxicFlowFinding};

/// Verification outcome of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResult {
    /// Which entity.
    pub entity: EntityRef,
    /// The definition that was verified.
    pub descriptor: CapabilityDescriptor,
    /// Its content hash.
    pub hash: EntityHash,
    /// The verdict.
    pub verdict: Verdict,
    /// Supporting findings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<Flag>,
    /// Capability labels used for toxic-flow analysis.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<CapabilityLabel>,
    /// What the user can do about a non-verified verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Outcome for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResult {
    /// Name in the client config.
    pub name: String,
    /// `stdio`, `sse` or `http`.
    pub transport: String,
    /// What the server reported about itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ServerInfo>,
    /// Why the server could not be scanned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure was a timeout.
    #[serde(default)]
    pub timed_out: bool,
    /// Captured server output, when the server failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    /// Per-entity outcomes, in listing order.
    pub entities: Vec<EntityResult>,
}

impl ServerResult {
    /// A server that could not be scanned.
    pub fn failed(name: &str, transport: &str, error: &CoreError, diagnostics: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            transport: transport.to_string(),
            info: None,
            error: Some(error.to_string()),
            timed_out: error.is_timeout(),
            diagnostics,
            entities: Vec::new(),
        }
    }

    /// Server-level verdict: failed when the server failed, otherwise the
    /// worst entity verdict.
    pub fn verdict(&self) -> Verdict {
        if let Some(error) = &self.error {
            return Verdict::failed(error.clone());
        }
        let worst = self
            .entities
            .iter()
            .map(|e| &e.verdict)
            .max_by_key(|v| match v {
                Verdict::Verified => 0,
                Verdict::Skipped(_) => 1,
                Verdict::Failed(_) => 2,
                Verdict::Flagged(_) => 3,
            });
        worst.cloned().unwrap_or(Verdict::Verified)
    }
}

/// Outcome for one client config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    /// Config file.
    pub path: PathBuf,
    /// Client kind, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Why the file could not be loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-server outcomes, in config order.
    pub servers: Vec<ServerResult>,
    /// Entities referring to other servers' entities.
    #[serde(default)]
    pub cross_origin: Vec<ShadowingFinding>,
    /// Every toxic flow found, up to the enumeration limit.
    #[serde(default)]
    pub toxic_flows: Vec<ToxicFlowFinding>,
    /// Flows found past the enumeration limit and not listed.
    #[serde(default)]
    pub toxic_flows_omitted: usize,
}

impl TargetResult {
    /// A target whose config could not be loaded.
    pub fn failed(path: PathBuf, client: Option<String>, error: &CoreError) -> Self {
        Self {
            path,
            client,
            error: Some(error.to_string()),
            servers: Vec::new(),
            cross_origin: Vec::new(),
            toxic_flows: Vec::new(),
            toxic_flows_omitted: 0,
        }
    }

    /// All entity results across servers.
    pub fn entities(&self) -> impl Iterator<Item = &EntityResult> {
        self.servers.iter().flat_map(|s| s.entities.iter())
    }
}

/// Result of one scan invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// When the scan finished.
    pub generated_at: DateTime<Utc>,
    /// Per-target outcomes, in input order.
    pub targets: Vec<TargetResult>,
}

impl ScanReport {
    /// True if any entity or server is not verified.
    pub fn has_issues(&self) -> bool {
        self.targets.iter().any(|t| {
            t.error.is_some()
                || !t.cross_origin.is_empty()
                || !t.toxic_flows.is_empty()
                || t.servers.iter().any(|s| !s.verdict().is_verified())
        })
    }

    /// Serializes the full tree.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// One server's descriptors, without verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectServer {
    /// Name in the client config.
    pub name: String,
    /// `stdio`, `sse` or `http`.
    pub transport: String,
    /// Why the server could not be listed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// What the server exposes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<ServerListing>,
}

/// One config file's servers, without verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectTarget {
    /// Config file.
    pub path: PathBuf,
    /// Client kind, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Why the file could not be loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-server listings, in config order.
    pub servers: Vec<InspectServer>,
}

/// Result of one inspect invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectReport {
    /// Per-target listings, in input order.
    pub targets: Vec<InspectTarget>,
}

impl InspectReport {
    /// Serializes the full tree.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Text rendering settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Show every toxic flow.
    pub full_toxic_flows: bool,
    /// Flows shown otherwise.
    pub top_k: usize,
    /// Order applied before the cut-off.
    pub ranking: FlowRanking,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from(&ScannerConfig::default())
    }
}

impl From<&ScannerConfig> for RenderOptions {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            full_toxic_flows: config.full_toxic_flows,
            top_k: config.toxic_flow_top_k,
            ranking: config.flow_ranking,
        }
    }
}

/// Renders a scan report for a terminal.
pub fn render_scan(report: &ScanReport, options: &RenderOptions) -> String {
    let mut out = String::new();
    for target in &report.targets {
        let _ = writeln!(out, "{}", target_header(&target.path, target.client.as_deref()));
        if let Some(error) = &target.error {
            let _ = writeln!(out, "  error: {error}");
            continue;
        }
        if target.servers.is_empty() {
            let _ = writeln!(out, "  no servers configured");
        }

        for server in &target.servers {
            let _ = writeln!(out, "  {} ({}): {}", server.name, server.transport, server.verdict());
            if let Some(diagnostics) = &server.diagnostics {
                for line in diagnostics.lines().take(5) {
                    let _ = writeln!(out, "    | {line}");
                }
            }
            for entity in &server.entities {
                let _ = writeln!(
                    out,
                    "    {:<8} {:<32} {}  {}",
                    entity.entity.kind.as_str(),
                    entity.entity.name,
                    entity.hash.short(),
                    entity.verdict
                );
                for flag in &entity.flags {
                    let _ = writeln!(out, "             - {flag}");
                }
                if let Some(hint) = &entity.remediation {
                    let _ = writeln!(out, "             > {hint}");
                }
            }
        }

        if !target.cross_origin.is_empty() {
            let _ = writeln!(out, "  cross-origin references:");
            for finding in &target.cross_origin {
                let _ = writeln!(out, "    {}", finding.explanation());
            }
        }

        if !target.toxic_flows.is_empty() {
            let shown = displayed_flows(
                &target.toxic_flows,
                options.ranking,
                options.top_k,
                options.full_toxic_flows,
            );
            let _ = writeln!(out, "  toxic flows:");
            for flow in &shown {
                let path: Vec<String> = flow.entities().iter().map(|e| e.to_string()).collect();
                let _ = writeln!(
                    out,
                    "    [{}] {}: {}",
                    flow.severity,
                    path.join(" -> "),
                    flow.explanation
                );
            }
            let hidden = target.toxic_flows.len() - shown.len();
            if hidden > 0 {
                let _ = writeln!(
                    out,
                    "    ... {hidden} more (use --full-toxic-flows to show all)"
                );
            }
            if target.toxic_flows_omitted > 0 {
                let _ = writeln!(
                    out,
                    "    ... {} further flows past the enumeration limit",
                    target.toxic_flows_omitted
                );
            }
        }
    }
    out
}

/// Renders an inspect report for a terminal.
pub fn render_inspect(report: &InspectReport) -> String {
    let mut out = String::new();
    for target in &report.targets {
        let _ = writeln!(out, "{}", target_header(&target.path, target.client.as_deref()));
        if let Some(error) = &target.error {
            let _ = writeln!(out, "  error: {error}");
            continue;
        }
        for server in &target.servers {
            let _ = writeln!(out, "  {} ({})", server.name, server.transport);
            if let Some(error) = &server.error {
                let _ = writeln!(out, "    error: {error}");
            }
            let Some(listing) = &server.listing else {
                continue;
            };
            for descriptor in listing.descriptors() {
                let _ = writeln!(
                    out,
                    "    {:<8} {:<32} {}",
                    descriptor.kind().as_str(),
                    descriptor.name(),
                    first_line(descriptor.description())
                );
            }
        }
    }
    out
}

fn target_header(path: &std::path::Path, client: Option<&str>) -> String {
    match client {
        Some(client) => format!("{} [{}]", path.display(), client),
        None => path.display().to_string(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tripwire_registry::{hash_descriptor, EntityKind, ToolDescriptor};

    fn entity(name: &str, verdict: Verdict) -> EntityResult {
        let descriptor = CapabilityDescriptor::Tool(ToolDescriptor {
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: serde_json::json!({}),
            annotations: None,
        });
        EntityResult {
            entity: EntityRef::new("srv", EntityKind::Tool, name),
            hash: hash_descriptor(&descriptor),
            descriptor,
            verdict,
            flags: Vec::new(),
            labels: BTreeSet::new(),
            remediation: None,
        }
    }

    fn server(entities: Vec<EntityResult>) -> ServerResult {
        ServerResult {
            name: "srv".into(),
            transport: "stdio".into(),
            info: None,
            error: None,
            timed_out: false,
            diagnostics: None,
            entities,
        }
    }

    #[test]
    fn test_server_verdict_is_worst_entity() {
        let s = server(vec![
            entity("a", Verdict::Verified),
            entity("b", Verdict::flagged("bad")),
            entity("c", Verdict::failed("down")),
        ]);
        assert_eq!(s.verdict(), Verdict::flagged("bad"));
        assert!(server(Vec::new()).verdict().is_verified());
    }

    #[test]
    fn test_failed_server_records_timeout() {
        let err = CoreError::ConnectTimeout {
            server: "slow".into(),
            timeout: Duration::from_secs(10),
        };
        let s = ServerResult::failed("slow", "stdio", &err, None);
        assert!(s.timed_out);
        assert!(s.verdict().is_failed());
    }

    #[test]
    fn test_render_lists_entities() {
        let report = ScanReport {
            generated_at: Utc::now(),
            targets: vec![TargetResult {
                path: PathBuf::from("/tmp/mcp.json"),
                client: Some("cursor".into()),
                error: None,
                servers: vec![server(vec![entity("add", Verdict::Verified)])],
                cross_origin: Vec::new(),
                toxic_flows: Vec::new(),
                toxic_flows_omitted: 0,
            }],
        };
        let text = render_scan(&report, &RenderOptions::default());
        assert!(text.contains("/tmp/mcp.json [cursor]"));
        assert!(text.contains("add"));
        assert!(text.contains("verified"));
        assert!(!report.has_issues());
    }

    #[test]
    fn test_flows_past_limit_are_reported() {
        use crate::verify::toxic::ToxicFlowGraph;

        let graph = ToxicFlowGraph::from_labelled([
            (
                EntityRef::new("web", EntityKind::Tool, "fetch"),
                BTreeSet::from([CapabilityLabel::UntrustedContent]),
            ),
            (
                EntityRef::new("mail", EntityKind::Tool, "send"),
                BTreeSet::from([CapabilityLabel::PublicSink]),
            ),
            (
                EntityRef::new("chat", EntityKind::Tool, "post"),
                BTreeSet::from([CapabilityLabel::PublicSink]),
            ),
        ]);
        let found = graph.enumerate_flows_capped(1);
        let report = ScanReport {
            generated_at: Utc::now(),
            targets: vec![TargetResult {
                path: PathBuf::from("/tmp/mcp.json"),
                client: None,
                error: None,
                servers: Vec::new(),
                cross_origin: Vec::new(),
                toxic_flows: found.flows,
                toxic_flows_omitted: found.omitted,
            }],
        };

        let text = render_scan(&report, &RenderOptions::default());
        assert!(text.contains("... 1 further flows past the enumeration limit"));
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["targets"][0]["toxic_flows_omitted"], 1);
        assert!(report.has_issues());
    }

    #[test]
    fn test_json_keeps_verdict_tag() {
        let report = ScanReport {
            generated_at: Utc::now(),
            targets: vec![TargetResult::failed(
                PathBuf::from("missing.json"),
                None,
                &CoreError::ConfigNotFound(PathBuf::from("missing.json")),
            )],
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert!(json["targets"][0]["error"]
            .as_str()
            .unwrap()
            .contains("file does not exist"));
        assert!(report.has_issues());
    }
}

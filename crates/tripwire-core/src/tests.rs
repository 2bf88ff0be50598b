//! Unit tests for tripwire-core.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tripwire_registry::{EntityHash, EntityKind, Registry, WhitelistEntry, WhitelistScope};

use crate::classifier::{Classifier, RemoteVerdict};
use crate::session::{Connector, ServerListing, Session};
use crate::target::ServerEntry;
use crate::{CoreError, FlowRanking, RenderOptions, Result, ScannerConfig, Tripwire, Verdict};

struct NoServers;

#[async_trait]
impl Connector for NoServers {
    async fn open(&self, entry: &ServerEntry, _timeout: Duration) -> Result<Box<dyn Session>> {
        Err(CoreError::connect(&entry.name, "no servers in unit tests"))
    }
}

/// Records contributions; refuses them when `refuse` is set.
#[derive(Default)]
struct RecordingClassifier {
    refuse: bool,
    contributed: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl Classifier for RecordingClassifier {
    async fn classify(&self, _server: &str, _listing: &ServerListing) -> Result<Vec<RemoteVerdict>> {
        Ok(Vec::new())
    }

    async fn contribute(&self, entry: &WhitelistEntry) -> Result<()> {
        if self.refuse {
            return Err(CoreError::ClassificationUnavailable("offline".into()));
        }
        self.contributed.lock().unwrap().push(entry.name.clone());
        Ok(())
    }
}

fn facade(classifier: Option<Arc<dyn Classifier>>) -> Tripwire {
    Tripwire::with_parts(
        ScannerConfig::default().with_classify_remote(classifier.is_some()),
        Registry::temporary().unwrap(),
        Arc::new(NoServers),
        classifier,
    )
}

fn some_hash() -> EntityHash {
    "ab".repeat(32).parse().unwrap()
}

// =============================================================================
// FACADE
// =============================================================================

#[tokio::test]
async fn test_local_whitelist_is_not_contributed() {
    let classifier = Arc::new(RecordingClassifier::default());
    let tripwire = facade(Some(classifier.clone()));

    tripwire
        .whitelist_add(EntityKind::Tool, "add", some_hash(), WhitelistScope::LocalOnly)
        .await
        .unwrap();

    assert!(classifier.contributed.lock().unwrap().is_empty());
    assert_eq!(tripwire.whitelist_list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_contributed_whitelist_is_shared() {
    let classifier = Arc::new(RecordingClassifier::default());
    let tripwire = facade(Some(classifier.clone()));

    tripwire
        .whitelist_add(EntityKind::Tool, "add", some_hash(), WhitelistScope::Contributed)
        .await
        .unwrap();

    assert_eq!(*classifier.contributed.lock().unwrap(), vec!["add".to_string()]);
}

#[tokio::test]
async fn test_failed_contribution_keeps_local_entry() {
    let classifier = Arc::new(RecordingClassifier {
        refuse: true,
        ..Default::default()
    });
    let tripwire = facade(Some(classifier));

    let entry = tripwire
        .whitelist_add(EntityKind::Prompt, "summarize", some_hash(), WhitelistScope::Contributed)
        .await
        .unwrap();

    assert_eq!(entry.name, "summarize");
    assert!(tripwire
        .registry()
        .lookup(EntityKind::Prompt, "summarize", &some_hash())
        .unwrap());
}

#[test]
fn test_whitelist_add_without_classifier() {
    let tripwire = facade(None);
    let entry = tokio_test::block_on(tripwire.whitelist_add(
        EntityKind::Resource,
        "readme",
        some_hash(),
        WhitelistScope::Contributed,
    ))
    .unwrap();

    assert_eq!(entry.scope, WhitelistScope::Contributed);
    assert_eq!(tripwire.whitelist_list().unwrap(), vec![entry]);
}

#[tokio::test]
async fn test_whitelist_reset_empties_list() {
    let tripwire = facade(None);
    for name in ["a", "b"] {
        tripwire
            .whitelist_add(EntityKind::Tool, name, some_hash(), WhitelistScope::LocalOnly)
            .await
            .unwrap();
    }

    assert_eq!(tripwire.whitelist_reset().unwrap(), 2);
    assert!(tripwire.whitelist_list().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_server_fails_scan_entry_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    std::fs::write(&path, r#"{"mcpServers": {"gone": {"command": "nowhere"}}}"#).unwrap();

    let tripwire = facade(None);
    let targets = Tripwire::load_targets(&[path.to_string_lossy().into_owned()]).unwrap();
    let report = tripwire.scan(targets).await.unwrap();

    let server = &report.targets[0].servers[0];
    assert!(server.verdict().is_failed());
    assert!(report.has_issues());
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[test]
fn test_render_options_follow_config() {
    let config = ScannerConfig::default()
        .with_full_toxic_flows(true)
        .with_flow_ranking(FlowRanking::ShortestFirst);
    let options = RenderOptions::from(&config);

    assert!(options.full_toxic_flows);
    assert_eq!(options.top_k, 3);
    assert_eq!(options.ranking, FlowRanking::ShortestFirst);
}

#[test]
fn test_zero_checks_means_one() {
    assert_eq!(ScannerConfig::default().with_checks_per_server(0).checks_per_server, 1);
}

#[test]
fn test_storage_paths_share_directory() {
    let config = ScannerConfig::default().with_storage_dir("/tmp/tw");
    assert!(config.registry_path().starts_with("/tmp/tw"));
    assert!(config.guardrails_path().starts_with("/tmp/tw"));
    assert!(config.audit_path().starts_with("/tmp/tw"));
}

// =============================================================================
// VERDICTS
// =============================================================================

#[test]
fn test_verdict_display() {
    assert_eq!(Verdict::Verified.to_string(), "verified");
    assert_eq!(
        Verdict::failed("could not reach verification server x").to_string(),
        "failed: could not reach verification server x"
    );
}

#[test]
fn test_verdict_serializes_with_status_tag() {
    let json = serde_json::to_value(Verdict::flagged("changed")).unwrap();
    assert_eq!(json, serde_json::json!({"status": "flagged", "reason": "changed"}));
}

//! Scan orchestrator.
//!
//! One task per server across every target, throttled by a semaphore.
//! Each task owns its result slot; slots are collected in input order after
//! every task has settled, so report order never depends on completion
//! order and one server's failure never touches its siblings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use tripwire_guard::cdr::sanitize_text;
use tripwire_registry::Registry;

use crate::classifier::Classifier;
use crate::config::ScannerConfig;
use crate::error::{CoreError, Result};
use crate::report::{
    EntityResult, InspectReport, InspectServer, InspectTarget, ScanReport, ServerResult,
    TargetResult,
};
use crate::session::{list_all, Connector, ServerListing};
use crate::target::{LoadedTarget, ServerEntry};
use crate::verdict::Verdict;
use crate::verify::{analyze_flows, apply_shadowing, stability, Verifier};

/// Runs scans and inspections over loaded targets.
pub struct Scanner {
    connector: Arc<dyn Connector>,
    verifier: Verifier,
    registry: Registry,
    config: ScannerConfig,
}

/// Why a listing attempt failed, with whatever the server printed.
struct ListingFailure {
    error: CoreError,
    diagnostics: Option<String>,
}

impl Scanner {
    /// Creates a scanner.
    pub fn new(
        connector: Arc<dyn Connector>,
        classifier: Option<Arc<dyn Classifier>>,
        registry: Registry,
        config: ScannerConfig,
    ) -> Self {
        Self {
            connector,
            verifier: Verifier::new(classifier),
            registry,
            config,
        }
    }

    /// The settings in use.
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Scans every server of every target.
    ///
    /// Pins are written once, after all servers have settled.
    pub async fn scan(&self, targets: Vec<LoadedTarget>) -> Result<ScanReport> {
        let checks = self.config.checks_per_server.max(1);
        let timeout = self.config.server_timeout;
        info!(
            targets = targets.len(),
            checks,
            concurrency = self.config.max_concurrency,
            "scan started"
        );

        let connector = Arc::clone(&self.connector);
        let verifier = self.verifier.clone();
        let registry = self.registry.clone();
        let slots = self.fan_out(&targets, move |entry| {
            scan_server(
                Arc::clone(&connector),
                verifier.clone(),
                registry.clone(),
                entry,
                checks,
                timeout,
            )
        });
        let slots = slots.await;

        let mut results = Vec::with_capacity(targets.len());
        for (target, servers) in targets.into_iter().zip(slots) {
            let target = match target {
                Ok(target) => target,
                Err(failed) => {
                    warn!(path = %failed.path.display(), error = %failed.error, "target skipped");
                    results.push(TargetResult::failed(failed.path, failed.client, &failed.error));
                    continue;
                }
            };

            let servers = target
                .servers
                .iter()
                .zip(servers)
                .map(|(entry, slot)| {
                    slot.unwrap_or_else(|e| {
                        ServerResult::failed(
                            &entry.name,
                            entry.transport.kind(),
                            &aborted(&entry.name, &e),
                            None,
                        )
                    })
                })
                .collect();

            let mut result = TargetResult {
                path: target.path,
                client: target.client,
                error: None,
                servers,
                cross_origin: Vec::new(),
                toxic_flows: Vec::new(),
                toxic_flows_omitted: 0,
            };
            apply_shadowing(&mut result);
            let flows = analyze_flows(&result);
            result.toxic_flows = flows.flows;
            result.toxic_flows_omitted = flows.omitted;
            results.push(result);
        }

        self.pin(&results)?;
        Ok(ScanReport {
            generated_at: Utc::now(),
            targets: results,
        })
    }

    /// Lists every server of every target without verifying anything.
    pub async fn inspect(&self, targets: Vec<LoadedTarget>) -> InspectReport {
        let timeout = self.config.server_timeout;
        let connector = Arc::clone(&self.connector);
        let slots = self
            .fan_out(&targets, move |entry| {
                let connector = Arc::clone(&connector);
                async move {
                    let listing = list_server(connector.as_ref(), &entry, timeout).await;
                    (entry, listing)
                }
            })
            .await;

        let mut results = Vec::with_capacity(targets.len());
        for (target, servers) in targets.into_iter().zip(slots) {
            let target = match target {
                Ok(target) => target,
                Err(failed) => {
                    results.push(InspectTarget {
                        path: failed.path,
                        client: failed.client,
                        error: Some(failed.error.to_string()),
                        servers: Vec::new(),
                    });
                    continue;
                }
            };

            let servers = target
                .servers
                .iter()
                .zip(servers)
                .map(|(entry, slot)| {
                    let listing = match slot {
                        Ok((_, listing)) => listing.map_err(|f| f.error),
                        Err(e) => Err(aborted(&entry.name, &e)),
                    };
                    match listing {
                        Ok(listing) => InspectServer {
                            name: entry.name.clone(),
                            transport: entry.transport.kind().to_string(),
                            error: None,
                            listing: Some(listing),
                        },
                        Err(error) => InspectServer {
                            name: entry.name.clone(),
                            transport: entry.transport.kind().to_string(),
                            error: Some(error.to_string()),
                            listing: None,
                        },
                    }
                })
                .collect();

            results.push(InspectTarget {
                path: target.path,
                client: target.client,
                error: None,
                servers,
            });
        }
        InspectReport { targets: results }
    }

    /// Spawns `task` for every server and returns the per-target slots in
    /// input order. Failed targets get an empty slot list.
    async fn fan_out<T, F, Fut>(
        &self,
        targets: &[LoadedTarget],
        task: F,
    ) -> Vec<Vec<std::result::Result<T, JoinError>>>
    where
        F: Fn(ServerEntry) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut pending = Vec::with_capacity(targets.len());
        for target in targets {
            let mut handles = Vec::new();
            if let Ok(target) = target {
                for entry in &target.servers {
                    let permits = Arc::clone(&permits);
                    let work = task(entry.clone());
                    handles.push(tokio::spawn(async move {
                        let _permit = permits.acquire_owned().await;
                        work.await
                    }));
                }
            }
            pending.push(handles);
        }

        let mut slots = Vec::with_capacity(pending.len());
        for handles in pending {
            let mut settled = Vec::with_capacity(handles.len());
            for handle in handles {
                settled.push(handle.await);
            }
            slots.push(settled);
        }
        slots
    }

    fn pin(&self, targets: &[TargetResult]) -> Result<()> {
        let mut pinned = 0usize;
        for server in targets.iter().flat_map(|t| t.servers.iter()) {
            if server.error.is_some() {
                continue;
            }
            for entity in &server.entities {
                self.registry.record(&entity.entity, &entity.descriptor)?;
                pinned += 1;
            }
        }
        self.registry.flush()?;
        debug!(pinned, "pins recorded");
        Ok(())
    }
}

fn aborted(server: &str, error: &JoinError) -> CoreError {
    CoreError::protocol(server, format!("scan task aborted: {error}"))
}

/// Opens, lists and closes one server.
async fn list_server(
    connector: &dyn Connector,
    entry: &ServerEntry,
    timeout: Duration,
) -> std::result::Result<ServerListing, ListingFailure> {
    let mut session = connector
        .open(entry, timeout)
        .await
        .map_err(|error| ListingFailure {
            error,
            diagnostics: None,
        })?;

    let listing = list_all(&entry.name, session.as_mut(), timeout).await;
    let diagnostics = listing
        .as_ref()
        .err()
        .and_then(|_| session.diagnostics())
        .map(|text| sanitize_text(&text));
    if let Err(e) = session.close().await {
        debug!(server = %entry.name, error = %e, "close failed");
    }

    listing.map_err(|error| ListingFailure { error, diagnostics })
}

/// Lists and verifies one server `checks` times.
async fn scan_server(
    connector: Arc<dyn Connector>,
    verifier: Verifier,
    registry: Registry,
    entry: ServerEntry,
    checks: u32,
    timeout: Duration,
) -> ServerResult {
    let transport = entry.transport.kind();
    let mut runs: Vec<Vec<EntityResult>> = Vec::with_capacity(checks as usize);
    let mut info = None;

    for run in 0..checks {
        let listing = match list_server(connector.as_ref(), &entry, timeout).await {
            Ok(listing) => listing,
            Err(failure) => {
                warn!(server = %entry.name, run, error = %failure.error, "server failed");
                return failed_after(&entry, runs, &failure.error, failure.diagnostics);
            }
        };
        match verifier.verify_listing(&entry.name, &listing, &registry).await {
            Ok(results) => runs.push(results),
            Err(error) => return failed_after(&entry, runs, &error, None),
        }
        info = Some(listing.info);
    }

    let entities = stability::merge_runs(runs);
    debug!(server = %entry.name, entities = entities.len(), "server scanned");
    ServerResult {
        name: entry.name,
        transport: transport.to_string(),
        info,
        error: None,
        timed_out: false,
        diagnostics: None,
        entities,
    }
}

/// A server that failed mid-way: whatever was listed earlier is reported
/// as failed too.
fn failed_after(
    entry: &ServerEntry,
    runs: Vec<Vec<EntityResult>>,
    error: &CoreError,
    diagnostics: Option<String>,
) -> ServerResult {
    let mut result = ServerResult::failed(&entry.name, entry.transport.kind(), error, diagnostics);
    result.entities = stability::merge_runs(runs)
        .into_iter()
        .map(|mut e| {
            e.verdict = Verdict::failed(error.to_string());
            e
        })
        .collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ServerInfo, Session};
    use crate::target::{ScanTarget, Transport};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tripwire_registry::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};

    struct StaticSession {
        info: ServerInfo,
        tools: Vec<ToolDescriptor>,
    }

    #[async_trait]
    impl Session for StaticSession {
        fn server_info(&self) -> &ServerInfo {
            &self.info
        }
        async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>> {
            Ok(self.tools.clone())
        }
        async fn list_prompts(&mut self) -> Result<Vec<PromptDescriptor>> {
            Ok(Vec::new())
        }
        async fn list_resources(&mut self) -> Result<Vec<ResourceDescriptor>> {
            Ok(Vec::new())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Serves one `echo` tool per server; servers named `down` refuse.
    struct EchoConnector;

    #[async_trait]
    impl Connector for EchoConnector {
        async fn open(&self, entry: &ServerEntry, _timeout: Duration) -> Result<Box<dyn Session>> {
            if entry.name == "down" {
                return Err(CoreError::connect(&entry.name, "refused"));
            }
            Ok(Box::new(StaticSession {
                info: ServerInfo::default(),
                tools: vec![ToolDescriptor {
                    name: format!("{}_echo", entry.name),
                    description: Some("Echo the input".into()),
                    input_schema: json!({"type": "object"}),
                    annotations: None,
                }],
            }))
        }
    }

    fn entry(name: &str) -> ServerEntry {
        ServerEntry::new(
            name,
            Transport::Stdio {
                command: "true".into(),
                args: Vec::new(),
                env: BTreeMap::new(),
            },
        )
    }

    fn scanner() -> Scanner {
        Scanner::new(
            Arc::new(EchoConnector),
            None,
            Registry::temporary().unwrap(),
            ScannerConfig::default().with_max_concurrency(2),
        )
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let names = ["a", "b", "c", "d", "e"];
        let target = ScanTarget::new("mcp.json", None, names.iter().map(|n| entry(n)).collect());
        let report = scanner().scan(vec![Ok(target)]).await.unwrap();

        let got: Vec<&str> = report.targets[0].servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(got, names);
    }

    #[tokio::test]
    async fn test_refused_server_is_isolated() {
        let target = ScanTarget::new("mcp.json", None, vec![entry("up"), entry("down")]);
        let report = scanner().scan(vec![Ok(target)]).await.unwrap();

        let servers = &report.targets[0].servers;
        assert!(servers[0].verdict().is_verified());
        assert_eq!(servers[0].entities.len(), 1);
        assert!(servers[1].verdict().is_failed());
        assert!(!servers[1].timed_out);
    }

    #[tokio::test]
    async fn test_scan_pins_entities() {
        let scanner = scanner();
        let target = ScanTarget::new("mcp.json", None, vec![entry("up")]);
        scanner.scan(vec![Ok(target)]).await.unwrap();

        let pinned = scanner
            .registry
            .last_seen(&tripwire_registry::EntityRef::new(
                "up",
                tripwire_registry::EntityKind::Tool,
                "up_echo",
            ))
            .unwrap();
        assert!(pinned.is_some());
    }

    #[tokio::test]
    async fn test_inspect_does_not_pin() {
        let scanner = scanner();
        let target = ScanTarget::new("mcp.json", None, vec![entry("up"), entry("down")]);
        let report = scanner.inspect(vec![Ok(target)]).await;

        assert!(report.targets[0].servers[0].listing.is_some());
        assert!(report.targets[0].servers[1].error.is_some());
        let pinned = scanner
            .registry
            .last_seen(&tripwire_registry::EntityRef::new(
                "up",
                tripwire_registry::EntityKind::Tool,
                "up_echo",
            ))
            .unwrap();
        assert!(pinned.is_none());
    }
}

//! The unified Tripwire facade.
//!
//! [`Tripwire`] owns the registry and the transport and classifier
//! collaborators for one invocation, and exposes the operations the CLI
//! needs: scan, inspect, proxy, uninstall and whitelist management.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tripwire_registry::{EntityHash, EntityKind, Registry, WhitelistEntry, WhitelistScope};

use crate::classifier::{Classifier, RemoteClassifier};
use crate::config::{ProxyConfig, ScannerConfig};
use crate::error::Result;
use crate::normalize::{load_target, resolve_targets};
use crate::proxy::injector::uninstall_from_config;
use crate::proxy::ProxyServer;
use crate::report::{InspectReport, RenderOptions, ScanReport};
use crate::scan::Scanner;
use crate::session::{Connector, TransportConnector};
use crate::target::{LoadedTarget, ScanTarget};

/// Entry point for scanning, proxying and whitelist management.
///
/// # Example
///
/// ```rust,ignore
/// let tripwire = Tripwire::open(ScannerConfig::default())?;
/// let targets = Tripwire::load_targets(&["cursor".to_string()])?;
/// let report = tripwire.scan(targets).await?;
/// println!("{}", render_scan(&report, &tripwire.render_options()));
/// ```
pub struct Tripwire {
    config: ScannerConfig,
    registry: Registry,
    connector: Arc<dyn Connector>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl Tripwire {
    /// Opens the registry under `config.storage_dir` and sets up the real
    /// transports and, unless disabled, the remote classifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be opened.
    pub fn open(config: ScannerConfig) -> Result<Self> {
        let registry = Registry::open(config.registry_path())?;
        let connector: Arc<dyn Connector> = Arc::new(TransportConnector::new(config.suppress_io));
        let classifier: Option<Arc<dyn Classifier>> = config.classify_remote.then(|| {
            Arc::new(RemoteClassifier::new(&config.base_url, config.classifier_timeout))
                as Arc<dyn Classifier>
        });

        info!(
            storage = %config.storage_dir.display(),
            remote = config.classify_remote,
            "tripwire initialized"
        );
        Ok(Self::with_parts(config, registry, connector, classifier))
    }

    /// Assembles a facade from explicit collaborators.
    pub fn with_parts(
        config: ScannerConfig,
        registry: Registry,
        connector: Arc<dyn Connector>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            classifier,
        }
    }

    /// The settings in use.
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// The registry in use.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text rendering settings derived from the config.
    pub fn render_options(&self) -> RenderOptions {
        RenderOptions::from(&self.config)
    }

    /// Resolves paths and client shorthands and loads each target.
    ///
    /// Per-file failures are kept as failed targets; only an unknown
    /// shorthand is an error.
    pub fn load_targets(args: &[String]) -> Result<Vec<LoadedTarget>> {
        let resolved = resolve_targets(args)?;
        Ok(resolved
            .into_iter()
            .map(|(path, client)| load_target(&path, client))
            .collect())
    }

    fn scanner(&self) -> Scanner {
        Scanner::new(
            Arc::clone(&self.connector),
            self.classifier.clone(),
            self.registry.clone(),
            self.config.clone(),
        )
    }

    /// Connects to every server, verifies every entity and pins the
    /// results.
    pub async fn scan(&self, targets: Vec<LoadedTarget>) -> Result<ScanReport> {
        self.scanner().scan(targets).await
    }

    /// Lists every server without verification or pinning.
    pub async fn inspect(&self, targets: Vec<LoadedTarget>) -> InspectReport {
        self.scanner().inspect(targets).await
    }

    /// Intercepts every stdio server of `targets` until `stop` completes.
    ///
    /// Configs are restored before this returns, on every path. Needs no
    /// registry, so scans can run against the same storage meanwhile.
    pub async fn proxy<F>(targets: &[ScanTarget], config: &ProxyConfig, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let proxy = ProxyServer::start(targets, config).await?;
        for skipped in proxy.skipped() {
            warn!(path = %skipped.path.display(), server = %skipped.server, reason = %skipped.reason, "not intercepted");
        }
        proxy.run_until(stop).await
    }

    /// Restores bridge entries left behind in `paths`.
    ///
    /// Returns the restored server names per file.
    pub fn uninstall(paths: &[PathBuf]) -> Result<Vec<(PathBuf, Vec<String>)>> {
        paths
            .iter()
            .map(|path| -> Result<(PathBuf, Vec<String>)> {
                Ok((path.clone(), uninstall_from_config(path)?))
            })
            .collect()
    }

    /// Approves an exact definition.
    ///
    /// Contributed entries are also shared with the verification service;
    /// a failed contribution is logged and does not undo the local entry.
    pub async fn whitelist_add(
        &self,
        kind: EntityKind,
        name: &str,
        hash: EntityHash,
        scope: WhitelistScope,
    ) -> Result<WhitelistEntry> {
        let entry = self.registry.add(kind, name, hash, scope)?;
        if scope == WhitelistScope::Contributed {
            if let Some(classifier) = &self.classifier {
                if let Err(e) = classifier.contribute(&entry).await {
                    warn!(name, error = %e, "entry kept locally only");
                }
            }
        }
        Ok(entry)
    }

    /// Removes every whitelist entry.
    pub fn whitelist_reset(&self) -> Result<usize> {
        Ok(self.registry.reset()?)
    }

    /// Lists whitelist entries.
    pub fn whitelist_list(&self) -> Result<Vec<WhitelistEntry>> {
        Ok(self.registry.list()?)
    }
}

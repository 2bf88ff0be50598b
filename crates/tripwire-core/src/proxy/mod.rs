//! # Interception Proxy
//!
//! Routes every stdio server of the given client configs through a local
//! guardrail relay until stopped, then puts the configs back.
//!
//! ## Lifecycle
//!
//! ```text
//!  start ──▶ bind 127.0.0.1:0 per server ──▶ rewrite configs (InstallGuard)
//!                                                   │
//!                        agent launches `tripwire bridge` ──▶ TCP ──▶ relay ──▶ real server
//!                                                   │
//!  ctrl-c / SIGTERM ──▶ stop accepting ──▶ stop relays ──▶ close audit ──▶ restore configs
//! ```
//!
//! Restoration runs once, after every relay has stopped. If the proxy is
//! dropped without [`ProxyServer::shutdown`] the guard restores on drop.
//!
//! ## Scope
//!
//! | Transport | Handling |
//! |-----------|----------|
//! | stdio | intercepted |
//! | SSE / streamable HTTP | left untouched, reported as unsupported |

pub mod audit;
pub mod bridge;
pub mod injector;
pub mod relay;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tripwire_guard::{GuardrailConfigFile, RuleSet};

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::target::ScanTarget;

use self::audit::{AuditLog, AuditSink};
use self::injector::{install, is_installed, InstallGuard, InstallPlan, ProxySession, Upstream};
use self::relay::{relay, RelayContext};

/// Grace period for a server to exit after its stdin closes.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// A server the proxy did not intercept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedServer {
    /// Config file.
    pub path: PathBuf,
    /// Server name.
    pub server: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Everything one listener needs to serve connections.
struct Route {
    upstream: Upstream,
    rules: Arc<RuleSet>,
}

/// A running proxy.
pub struct ProxyServer {
    guard: InstallGuard,
    listeners: JoinSet<()>,
    shutdown: watch::Sender<bool>,
    audit: AuditLog,
    skipped: Vec<SkippedServer>,
}

impl ProxyServer {
    /// Installs interception for every stdio server of `targets` and starts
    /// serving.
    ///
    /// On error nothing stays installed.
    pub async fn start(targets: &[ScanTarget], config: &ProxyConfig) -> Result<Self> {
        let guardrails = GuardrailConfigFile::load_or_init(&config.guardrails_path)?;
        let audit = AuditLog::open(&config.audit_path).await?;
        let mut guard = InstallGuard::new();
        let mut skipped = Vec::new();
        let mut pending: Vec<(TcpListener, Route)> = Vec::new();

        for target in targets {
            let client = target.client_name();
            let mut routes = Vec::new();

            for server in &target.servers {
                let skip = |reason: &str| SkippedServer {
                    path: target.path.clone(),
                    server: server.name.clone(),
                    reason: reason.to_string(),
                };
                let Some(upstream) = Upstream::from_transport(&server.transport) else {
                    warn!(server = %server.name, transport = server.transport.kind(), "only stdio servers can be intercepted");
                    skipped.push(skip("remote transports are not supported"));
                    continue;
                };
                if is_installed(&server.raw) {
                    warn!(server = %server.name, "already intercepted");
                    skipped.push(skip("already intercepted; run `tripwire uninstall` to recover"));
                    continue;
                }

                let rules = RuleSet::compile(&guardrails, &client, &server.name)?;
                let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
                let endpoint = listener.local_addr()?;
                routes.push((server.name.clone(), endpoint));
                pending.push((
                    listener,
                    Route {
                        upstream,
                        rules: Arc::new(rules),
                    },
                ));
            }

            if routes.is_empty() {
                continue;
            }
            let plan = InstallPlan {
                path: &target.path,
                client: &client,
                routes,
                bridge: &config.bridge_executable,
            };
            guard.push(install(&plan)?);
        }

        let (shutdown, stop) = watch::channel(false);
        let mut listeners = JoinSet::new();
        for (listener, route) in pending {
            listeners.spawn(serve(
                listener,
                Arc::new(route),
                audit.sink(),
                stop.clone(),
                config.suppress_io,
            ));
        }

        info!(
            servers = guard.installed().iter().map(|c| c.sessions.len()).sum::<usize>(),
            skipped = skipped.len(),
            "proxy running"
        );
        Ok(Self {
            guard,
            listeners,
            shutdown,
            audit,
            skipped,
        })
    }

    /// Intercepted servers.
    pub fn sessions(&self) -> impl Iterator<Item = &ProxySession> {
        self.guard.installed().iter().flat_map(|c| c.sessions.iter())
    }

    /// Servers left alone.
    pub fn skipped(&self) -> &[SkippedServer] {
        &self.skipped
    }

    /// Serves until `stop` completes, then shuts down.
    pub async fn run_until<F: Future<Output = ()>>(self, stop: F) -> Result<()> {
        stop.await;
        info!("stop requested");
        self.shutdown().await
    }

    /// Stops every relay, then restores every config.
    ///
    /// # Errors
    ///
    /// The first [`ConfigRestore`](crate::CoreError::ConfigRestore) error if any config could not be
    /// restored. Every config is attempted regardless.
    pub async fn shutdown(self) -> Result<()> {
        let ProxyServer {
            mut guard,
            mut listeners,
            shutdown,
            audit,
            ..
        } = self;

        let _ = shutdown.send(true);
        while let Some(joined) = listeners.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "listener task failed");
            }
        }
        audit.close().await;

        match guard.restore().into_iter().next() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Completes on ctrl-c, or on SIGTERM where available.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Accepts bridge connections until shutdown, then waits for their relays.
async fn serve(
    listener: TcpListener,
    route: Arc<Route>,
    audit: AuditSink,
    mut stop: watch::Receiver<bool>,
    suppress_io: bool,
) {
    let server = route.rules.server().to_string();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(server = %server, %peer, "bridge connected");
                    connections.spawn(handle_connection(
                        stream,
                        Arc::clone(&route),
                        audit.clone(),
                        stop.clone(),
                        suppress_io,
                    ));
                }
                Err(e) => warn!(server = %server, error = %e, "accept failed"),
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    warn!(server = %server, error = %e, "relay task failed");
                }
            }
        }
    }

    drop(listener);
    while let Some(finished) = connections.join_next().await {
        if let Err(e) = finished {
            warn!(server = %server, error = %e, "relay task failed");
        }
    }
}

/// Spawns the real server and relays one bridge connection to it.
async fn handle_connection(
    stream: TcpStream,
    route: Arc<Route>,
    audit: AuditSink,
    stop: watch::Receiver<bool>,
    suppress_io: bool,
) {
    let server = route.rules.server().to_string();
    let upstream = &route.upstream;

    let spawned = Command::new(&upstream.command)
        .args(&upstream.args)
        .envs(&upstream.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if suppress_io { Stdio::null() } else { Stdio::inherit() })
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            error!(server = %server, command = %upstream.command, error = %e, "could not start server");
            return;
        }
    };
    let (Some(child_in), Some(child_out)) = (child.stdin.take(), child.stdout.take()) else {
        error!(server = %server, "server stdio unavailable");
        return;
    };

    let ctx = RelayContext {
        rules: Arc::clone(&route.rules),
        audit,
        session_id: uuid::Uuid::new_v4().to_string(),
    };
    info!(server = %server, session = %ctx.session_id, "relay started");

    let (client_in, client_out) = stream.into_split();
    if let Err(e) = relay(ctx, client_in, client_out, child_out, child_in, stop).await {
        warn!(server = %server, error = %e, "relay ended with error");
    }

    match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(server = %server, %status, "server exited"),
        Ok(Err(e)) => warn!(server = %server, error = %e, "wait failed"),
        Err(_) => {
            debug!(server = %server, "server did not exit; killing");
            let _ = child.kill().await;
        }
    }
}

/// Endpoint of the session for `server`, if it was intercepted.
pub fn endpoint_of<'a>(sessions: impl IntoIterator<Item = &'a ProxySession>, server: &str) -> Option<SocketAddr> {
    sessions
        .into_iter()
        .find(|s| s.server == server)
        .map(|s| s.endpoint)
}

//! Tripwire CLI - verify and guard the MCP servers of local agent clients

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tripwire_core::normalize::resolve_targets;
use tripwire_core::proxy::bridge::run_bridge;
use tripwire_core::{
    render_inspect, render_scan, shutdown_signal, ProxyConfig, ScanTarget, ScannerConfig,
    Tripwire, UploadConfig, Uploader, DEFAULT_BASE_URL,
};
use tripwire_registry::{EntityHash, EntityKind, WhitelistScope};

#[derive(Parser)]
#[command(name = "tripwire", version)]
#[command(about = "Tripwire - verify and guard MCP tool servers")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StorageArgs {
    /// Directory for the registry, guardrails and audit log [default: ~/.tripwire]
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Verification service
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Never contact the verification service
    #[arg(long)]
    local_only: bool,
}

#[derive(Args)]
struct ServerArgs {
    /// Config files or client names (claude, cursor, vscode, windsurf); every known client when omitted
    targets: Vec<String>,

    /// Seconds to wait for each server
    #[arg(long, default_value_t = 10)]
    server_timeout: u64,

    /// Pass server stderr through instead of capturing it
    #[arg(long)]
    show_server_output: bool,

    /// Print the full result tree as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct UploadArgs {
    /// Control server to push results to
    #[arg(long, requires = "push_key")]
    control_server: Option<String>,

    /// Key authenticating the push
    #[arg(long, requires = "control_server")]
    push_key: Option<String>,

    /// Contact address sent with pushed results
    #[arg(long)]
    email: Option<String>,

    /// Send only a fresh anonymous identifier with pushed results
    #[arg(long)]
    opt_out: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify every server and pin what it exposes
    Scan {
        #[command(flatten)]
        servers: ServerArgs,

        #[command(flatten)]
        storage: StorageArgs,

        /// List each server this many times and flag any disagreement
        #[arg(long, default_value_t = 1)]
        checks_per_server: u32,

        /// Show every toxic flow instead of the top three
        #[arg(long)]
        full_toxic_flows: bool,

        #[command(flatten)]
        upload: UploadArgs,
    },
    /// List what every server exposes, without verification
    Inspect {
        #[command(flatten)]
        servers: ServerArgs,

        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Approve an exact definition, or list or reset approvals
    Whitelist {
        /// tool, prompt or resource
        kind: Option<String>,

        /// Entity name
        name: Option<String>,

        /// Full hex hash, as printed in the scan remediation
        hash: Option<String>,

        /// Remove every entry
        #[arg(long, conflicts_with_all = ["kind", "name", "hash"])]
        reset: bool,

        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Route stdio servers through guardrails until interrupted
    Proxy {
        /// Config files or client names; every known client when omitted
        targets: Vec<String>,

        /// Pass server stderr through instead of discarding it
        #[arg(long)]
        show_server_output: bool,

        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Restore configs left intercepted by a proxy that did not exit cleanly
    Uninstall {
        /// Config files or client names; every known client when omitted
        targets: Vec<String>,
    },
    /// Client-side end of an intercepted server (written into configs by `proxy`)
    #[command(hide = true)]
    Bridge {
        /// Proxy endpoint
        #[arg(long)]
        connect: SocketAddr,

        /// Client the config belongs to
        #[arg(long)]
        client: String,

        /// Server name in the config
        #[arg(long)]
        server: String,

        /// Marks the start of the original command
        #[arg(long)]
        exec: bool,

        /// Original command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        original: Vec<String>,
    },
}

impl StorageArgs {
    fn config(&self) -> ScannerConfig {
        let mut config = ScannerConfig::default()
            .with_base_url(self.base_url.clone())
            .with_classify_remote(!self.local_only);
        if let Some(dir) = &self.storage_dir {
            config = config.with_storage_dir(dir.clone());
        }
        config
    }
}

impl UploadArgs {
    fn config(&self, scanner: &ScannerConfig) -> Option<UploadConfig> {
        let (server, key) = (self.control_server.as_ref()?, self.push_key.as_ref()?);
        Some(
            UploadConfig::new(server.clone(), key.clone(), scanner)
                .with_email(self.email.clone())
                .with_opt_out(self.opt_out),
        )
    }
}

impl ServerArgs {
    fn apply(&self, config: ScannerConfig) -> ScannerConfig {
        config
            .with_server_timeout(Duration::from_secs(self.server_timeout))
            .with_suppress_io(!self.show_server_output)
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Scan {
            servers,
            storage,
            checks_per_server,
            full_toxic_flows,
            upload,
        } => {
            let config = servers
                .apply(storage.config())
                .with_checks_per_server(checks_per_server)
                .with_full_toxic_flows(full_toxic_flows);
            let upload = upload.config(&config);
            let tripwire = Tripwire::open(config).context("opening storage")?;
            let targets = Tripwire::load_targets(&servers.targets)?;
            let report = tripwire.scan(targets).await?;

            if servers.json {
                println!("{}", report.to_json()?);
            } else {
                print!("{}", render_scan(&report, &tripwire.render_options()));
            }

            if let Some(upload) = upload {
                let summary = Uploader::new(upload).push(&report).await;
                if summary.failed > 0 {
                    eprintln!("{} of {} results not uploaded", summary.failed, report.targets.len());
                }
            }
        }

        Commands::Inspect { servers, storage } => {
            let config = servers.apply(storage.config());
            let tripwire = Tripwire::open(config).context("opening storage")?;
            let targets = Tripwire::load_targets(&servers.targets)?;
            let report = tripwire.inspect(targets).await;

            if servers.json {
                println!("{}", report.to_json()?);
            } else {
                print!("{}", render_inspect(&report));
            }
        }

        Commands::Whitelist {
            kind,
            name,
            hash,
            reset,
            storage,
        } => {
            let tripwire = Tripwire::open(storage.config()).context("opening storage")?;
            match (kind, name, hash) {
                (Some(kind), Some(name), Some(hash)) => {
                    let kind: EntityKind = kind.parse()?;
                    let hash: EntityHash = hash.parse().context("hash must be 64 hex characters")?;
                    let scope = if storage.local_only {
                        WhitelistScope::LocalOnly
                    } else {
                        WhitelistScope::Contributed
                    };
                    let entry = tripwire.whitelist_add(kind, &name, hash, scope).await?;
                    println!("whitelisted {} {} {}", entry.kind, entry.name, entry.hash.short());
                }
                (None, None, None) if reset => {
                    let removed = tripwire.whitelist_reset()?;
                    println!("removed {removed} entries");
                }
                (None, None, None) => {
                    for entry in tripwire.whitelist_list()? {
                        println!(
                            "{:<8} {:<32} {}  {}",
                            entry.kind.as_str(),
                            entry.name,
                            entry.hash.to_hex(),
                            entry.added_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
                _ => bail!("whitelist takes KIND NAME HASH together"),
            }
        }

        Commands::Proxy {
            targets,
            show_server_output,
            storage,
        } => {
            let config = storage.config().with_suppress_io(!show_server_output);
            let proxy_config = ProxyConfig::from_scanner(&config);

            let loaded: Vec<ScanTarget> = Tripwire::load_targets(&targets)?
                .into_iter()
                .filter_map(|target| match target {
                    Ok(target) => Some(target),
                    Err(failed) => {
                        warn!(path = %failed.path.display(), error = %failed.error, "config skipped");
                        None
                    }
                })
                .collect();
            if loaded.is_empty() {
                bail!("no client configs found");
            }

            eprintln!("tripwire proxy running; press ctrl-c to stop and restore configs");
            Tripwire::proxy(&loaded, &proxy_config, shutdown_signal()).await?;
            eprintln!("configs restored");
        }

        Commands::Uninstall { targets } => {
            let explicit = !targets.is_empty();
            let paths: Vec<PathBuf> = resolve_targets(&targets)?
                .into_iter()
                .map(|(path, _)| path)
                .filter(|path| explicit || path.exists())
                .collect();

            for (path, restored) in Tripwire::uninstall(&paths)? {
                if !restored.is_empty() {
                    println!("{}: restored {}", path.display(), restored.join(", "));
                }
            }
        }

        Commands::Bridge {
            connect,
            client,
            server,
            exec: _,
            original,
        } => {
            info!(client, server, command = ?original.first(), "bridge starting");
            run_bridge(connect, &server)
                .await
                .with_context(|| format!("server '{server}' of {client}"))?;
        }
    }
    Ok(())
}

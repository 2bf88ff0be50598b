//! # Tripwire Core
//!
//! Scan and proxy engines for agent tool servers (MCP). Orchestrates the
//! registry, the guard and the server transports behind one facade.
//!
//! ## Threat Coverage
//!
//! | Layer | Component | Threats |
//! |-------|-----------|---------|
//! | Definition | Verification engine | Tool poisoning, rug pulls, non-deterministic listings |
//! | Composition | Shadowing and toxic-flow analysis | Cross-origin escalation, exfiltration chains |
//! | Traffic | Interception proxy | Secret and PII leakage, disabled tools |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TRIPWIRE CORE                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   client configs ──▶ normalize ──▶ ScanTarget / ServerEntry     │
//! │                                         │                       │
//! │                    ┌────────────────────┴─────────────┐         │
//! │                    ▼                                  ▼         │
//! │          ┌──────────────────┐               ┌──────────────────┐│
//! │          │  Scanner         │               │  ProxyServer     ││
//! │          │  task per server │               │  InstallGuard    ││
//! │          │  semaphore cap   │               │  relay per conn  ││
//! │          └────────┬─────────┘               └────────┬─────────┘│
//! │                   ▼                                  ▼          │
//! │     Session (stdio / SSE / HTTP)            RuleSet + audit.jsonl│
//! │                   ▼                                             │
//! │     Verifier: whitelist ▸ pins ▸ heuristics ▸ classifier        │
//! │                   ▼                                             │
//! │     shadowing ▸ toxic flows ▸ ScanReport                        │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tripwire_core::{render_scan, ScannerConfig, Tripwire};
//!
//! let tripwire = Tripwire::open(ScannerConfig::default().with_checks_per_server(3))?;
//! let targets = Tripwire::load_targets(&[])?;
//! let report = tripwire.scan(targets).await?;
//! print!("{}", render_scan(&report, &tripwire.render_options()));
//! ```
//!
//! ## Security Notes
//!
//! - A server that fails yields `failed` verdicts for itself only
//! - Remote classification errors are `failed`, never `verified`
//! - A changed definition is flagged even when it looks benign, unless the
//!   new hash is whitelisted
//! - Configs rewritten by the proxy are restored on every exit path
//!
//! ## References
//!
//! - Model Context Protocol: <https://modelcontextprotocol.io/>
//! - JSON-RPC 2.0: <https://www.jsonrpc.org/specification>

pub mod classifier;
pub mod config;
pub mod error;
pub mod normalize;
pub mod proxy;
pub mod report;
pub mod scan;
pub mod session;
pub mod target;
pub mod upload;
pub mod verdict;
pub mod verify;
mod tripwire;

pub use classifier::{Classifier, RemoteClassifier, RemoteVerdict};
pub use config::{FlowRanking, ProxyConfig, ScannerConfig, DEFAULT_BASE_URL};
pub use error::{CoreError, Result};
pub use proxy::{shutdown_signal, ProxyServer};
pub use report::{
    render_inspect, render_scan, EntityResult, InspectReport, RenderOptions, ScanReport,
    ServerResult, TargetResult,
};
pub use scan::Scanner;
pub use session::{Connector, ServerInfo, ServerListing, Session, TransportConnector};
pub use target::{LoadedTarget, ScanTarget, ServerEntry, Transport};
pub use tripwire::Tripwire;
pub use upload::{ScanUserInfo, UploadConfig, UploadSummary, Uploader};
pub use verdict::{Flag, Verdict};
pub use verify::shadowing::ShadowingFinding;
pub use verify::toxic::{FlowEnumeration, ToxicFlowFinding, ToxicFlowGraph};
pub use verify::Verifier;

// Re-export component types for convenience
pub use tripwire_guard::{CapabilityLabel, GuardrailConfigFile, RuleSet};
pub use tripwire_registry::{
    CapabilityDescriptor, EntityHash, EntityKind, EntityRef, Registry, WhitelistEntry,
    WhitelistScope,
};

#[cfg(test)]
mod tests;

//! # Core Types for the Guard
//!
//! Shared vocabulary of the descriptor heuristics and the guardrail rule
//! engine: what a heuristic hit looks like, which capability labels feed the
//! toxic-flow graph, and the actions a guardrail rule can take.
//!
//! ## Threat Model
//!
//! | Type | Attack Class | Used By |
//! |------|--------------|---------|
//! | [`HeuristicMatch`] | Tool poisoning via descriptor text | Local verification |
//! | [`CapabilityLabel`] | Multi-step data exfiltration (toxic flows) | Flow analysis |
//! | [`GuardrailMode`] | Secret/PII leakage through live traffic | Interception loop |
//!
//! ## References
//!
//! - Invariant Labs, "MCP Security Notification: Tool Poisoning Attacks" (2025)
//!   <https://invariantlabs.ai/blog/mcp-security-notification-tool-poisoning-attacks>
//! - OWASP LLM Top 10: <https://owasp.org/www-project-top-10-for-large-language-model-applications/>

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How bad a heuristic hit is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Worth a look, not conclusive.
    Low,
    /// Suspicious wording commonly found in poisoned tools.
    Medium,
    /// Almost certainly an injected instruction.
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

/// A single heuristic hit in descriptor text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeuristicMatch {
    /// Stable identifier of the heuristic (`hidden_instruction_tag`, ...).
    pub id: String,
    /// Human-readable explanation.
    pub detail: String,
    /// Severity of the hit.
    pub severity: Severity,
}

/// Coarse capability classes used to build the toxic-flow graph.
///
/// # Variants
///
/// | Variant | Meaning | Typical Tools |
/// |---------|---------|---------------|
/// | `UntrustedContent` | Ingests attacker-controllable text | web fetch, issue reader, inbox |
/// | `PrivateData` | Reads data the user would not publish | file reader, database query |
/// | `PublicSink` | Sends data somewhere others can see it | email, HTTP post, comment |
/// | `Destructive` | Acts irreversibly on the host or account | shell, delete, write file |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityLabel {
    /// Reads attacker-controllable content.
    UntrustedContent,
    /// Reads private data.
    PrivateData,
    /// Writes to a publicly visible or external destination.
    PublicSink,
    /// Performs destructive or code-executing actions.
    Destructive,
}

impl CapabilityLabel {
    /// Label name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityLabel::UntrustedContent => "untrusted_content",
            CapabilityLabel::PrivateData => "private_data",
            CapabilityLabel::PublicSink => "public_sink",
            CapabilityLabel::Destructive => "destructive",
        }
    }
}

impl fmt::Display for CapabilityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode of a configured guardrail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailMode {
    /// Record matches, forward the message.
    Log,
    /// Record matches and stop the message.
    Block,
    /// Compiled but never evaluated.
    Paused,
}

impl GuardrailMode {
    /// Returns the action taken on a match, or `None` when paused.
    pub fn action(&self) -> Option<RuleAction> {
        match self {
            GuardrailMode::Log => Some(RuleAction::Log),
            GuardrailMode::Block => Some(RuleAction::Block),
            GuardrailMode::Paused => None,
        }
    }
}

/// Action recorded for a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Message is forwarded.
    Log,
    /// Message is replaced by a denial.
    Block,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleAction::Log => "log",
            RuleAction::Block => "block",
        })
    }
}

/// Which way a message travels through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to server.
    Request,
    /// Server to client.
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Request => "request",
            Direction::Response => "response",
        })
    }
}

/// Directions a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionFilter {
    /// Only client-to-server messages.
    Request,
    /// Only server-to-client messages.
    Response,
    /// Both directions.
    #[default]
    Both,
}

impl DirectionFilter {
    /// Returns true if messages travelling `direction` are covered.
    pub fn covers(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (DirectionFilter::Both, _)
                | (DirectionFilter::Request, Direction::Request)
                | (DirectionFilter::Response, Direction::Response)
        )
    }
}

/// Built-in guardrail templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    /// API keys, tokens, private keys.
    Secrets,
    /// Email addresses, phone numbers, card numbers, SSNs.
    Pii,
    /// URLs.
    Links,
    /// Content moderation. Needs an external service.
    Moderated,
}

impl Template {
    /// Templates in the order their rules are emitted.
    pub const ALL: [Template; 4] = [
        Template::Links,
        Template::Moderated,
        Template::Pii,
        Template::Secrets,
    ];

    /// Template name used in rule ids and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Template::Secrets => "secrets",
            Template::Pii => "pii",
            Template::Links => "links",
            Template::Moderated => "moderated",
        }
    }

    /// Returns true if the template can be evaluated locally.
    pub fn is_available(&self) -> bool {
        !matches!(self, Template::Moderated)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule that matched a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Id of the matching rule.
    pub rule_id: String,
    /// Action the rule takes.
    pub action: RuleAction,
    /// What matched, for logs. Never the matched secret itself.
    pub detail: String,
}

/// Errors raised while loading or compiling guardrails.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The guardrail file could not be read or written.
    #[error("I/O error on guardrail config: {0}")]
    Io(#[from] std::io::Error),

    /// The guardrail file is not valid YAML for the expected shape.
    #[error("could not parse guardrail config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A custom guardrail has an invalid regular expression.
    #[error("invalid pattern in guardrail {id:?}: {source}")]
    InvalidPattern {
        /// Guardrail id.
        id: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// A custom guardrail path is not a JSON pointer.
    #[error("invalid path in guardrail {id:?}: {path:?} must start with '/'")]
    InvalidPath {
        /// Guardrail id.
        id: String,
        /// The offending path.
        path: String,
    },
}

/// Result type for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_mode_has_no_action() {
        assert_eq!(GuardrailMode::Block.action(), Some(RuleAction::Block));
        assert_eq!(GuardrailMode::Log.action(), Some(RuleAction::Log));
        assert_eq!(GuardrailMode::Paused.action(), None);
    }

    #[test]
    fn test_direction_filter() {
        assert!(DirectionFilter::Both.covers(Direction::Request));
        assert!(DirectionFilter::Response.covers(Direction::Response));
        assert!(!DirectionFilter::Request.covers(Direction::Response));
    }

    #[test]
    fn test_moderated_is_unavailable() {
        assert!(!Template::Moderated.is_available());
        assert!(Template::Secrets.is_available());
    }

    #[test]
    fn test_severity_orders_low_to_high() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}

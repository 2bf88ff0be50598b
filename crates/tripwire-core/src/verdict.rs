//! Verdict types for scan results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tripwire_guard::HeuristicMatch;
use tripwire_registry::EntityHash;

/// The outcome of verifying one entity.
///
/// - `Verified`: no check raised anything, or the exact definition is
///   whitelisted
/// - `Flagged`: a check found a problem
/// - `Skipped`: the verification service declined to judge the entity
/// - `Failed`: a check could not run; never treated as verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    /// Passed all checks.
    Verified,

    /// A check found a problem.
    Flagged(String),

    /// Not judged.
    Skipped(String),

    /// A check could not run.
    Failed(String),
}

impl Verdict {
    /// Create a Flagged verdict.
    pub fn flagged(reason: impl Into<String>) -> Self {
        Self::Flagged(reason.into())
    }

    /// Create a Failed verdict.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Returns true if this is a Verified verdict.
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }

    /// Returns true if this is a Flagged verdict.
    pub fn is_flagged(&self) -> bool {
        matches!(self, Self::Flagged(_))
    }

    /// Returns true if this is a Failed verdict.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Short status word.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Flagged(_) => "flagged",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }

    /// The reason, if the verdict carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Verified => None,
            Self::Flagged(r) | Self::Skipped(r) | Self::Failed(r) => Some(r),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.label(), reason),
            None => f.write_str(self.label()),
        }
    }
}

/// Additional findings attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Flag {
    /// The definition differs from the one pinned by the previous scan.
    Changed {
        /// Hash pinned last time.
        previous_hash: EntityHash,
        /// Description pinned last time.
        previous_description: Option<String>,
        /// When the previous pin was taken.
        seen_at: DateTime<Utc>,
    },

    /// Repeated listings disagreed.
    NonDeterministic {
        /// Listings performed.
        runs: u32,
        /// Different hashes observed.
        distinct_hashes: usize,
        /// What varied.
        detail: String,
    },

    /// A local heuristic matched.
    Heuristic(HeuristicMatch),

    /// The description refers to another server's entity.
    Shadowing {
        /// The referenced server.
        server: String,
        /// The referenced entity or server name.
        target: String,
    },

    /// The exact definition is whitelisted.
    Whitelisted,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Changed { previous_hash, seen_at, .. } => write!(
                f,
                "changed since {} (was {})",
                seen_at.format("%Y-%m-%d %H:%M"),
                previous_hash.short()
            ),
            Flag::NonDeterministic { runs, distinct_hashes, detail } => write!(
                f,
                "non-deterministic over {runs} runs ({distinct_hashes} hashes): {detail}"
            ),
            Flag::Heuristic(hit) => write!(f, "{} [{}]: {}", hit.id, hit.severity, hit.detail),
            Flag::Shadowing { server, target } => write!(f, "references {target} of {server}"),
            Flag::Whitelisted => f.write_str("whitelisted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_helpers() {
        assert!(Verdict::Verified.is_verified());
        assert!(Verdict::flagged("x").is_flagged());
        assert!(Verdict::failed("x").is_failed());
        assert_eq!(Verdict::Verified.reason(), None);
        assert_eq!(Verdict::Skipped("later".into()).reason(), Some("later"));
    }

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Verified.to_string(), "verified");
        assert_eq!(
            Verdict::flagged("definition changed since last scan").to_string(),
            "flagged: definition changed since last scan"
        );
    }

    #[test]
    fn test_verdict_serialization() {
        let json = serde_json::to_value(Verdict::failed("timeout")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failed", "reason": "timeout"}));

        let json = serde_json::to_value(Verdict::Verified).unwrap();
        assert_eq!(json, serde_json::json!({"status": "verified"}));
    }

    #[test]
    fn test_flag_serialization_is_tagged() {
        let flag = Flag::Shadowing {
            server: "math".into(),
            target: "add".into(),
        };
        let json = serde_json::to_value(&flag).unwrap();
        assert_eq!(json["kind"], "shadowing");
        assert_eq!(flag.to_string(), "references add of math");
    }
}

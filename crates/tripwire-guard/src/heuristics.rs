//! Descriptor heuristics
//!
//! Pattern-based checks over the text of a tool, prompt or resource
//! descriptor. Pure functions of the text: no I/O, no model calls.
//!
//! Poisoned descriptors tend to share a few traits: instruction blocks
//! wrapped in pseudo-tags, requests to keep something from the user,
//! references to credential files, and preconditions that chain into other
//! tools. Invisible characters are reported separately since they hide the
//! payload from a human reviewer.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cdr;
use crate::models::{HeuristicMatch, Severity};

/// Heuristics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicsConfig {
    /// Minimum severity that makes a descriptor suspicious.
    pub flag_threshold: Severity,
    /// Whether invisible characters are reported at all.
    pub report_hidden_characters: bool,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            flag_threshold: Severity::Medium,
            report_hidden_characters: true,
        }
    }
}

/// Descriptor pattern with severity
struct DescriptorPattern {
    id: &'static str,
    pattern: Regex,
    severity: Severity,
    description: &'static str,
}

fn patterns() -> &'static [DescriptorPattern] {
    static PATTERNS: OnceLock<Vec<DescriptorPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let raw: [(&str, &str, Severity, &str); 9] = [
            (
                "hidden_instruction_tag",
                r"(?i)<\s*/?\s*(important|instructions?|system|secret|hidden|note_to_assistant)\s*>",
                Severity::High,
                "Instruction block wrapped in a pseudo-tag",
            ),
            (
                "ignore_instructions",
                r"(?i)(ignore|disregard|forget)\s+(all\s+)?(your\s+)?(previous|prior|above|other)\s+(instructions?|prompts?|rules?|guidelines?)",
                Severity::High,
                "Attempts to override prior instructions",
            ),
            (
                "conceal_from_user",
                r"(?i)(do\s+not|don'?t|never)\s+(tell|mention|inform|notify|reveal|show|alert)\s+(this\s+)?(to\s+)?(the\s+)?user",
                Severity::High,
                "Asks the model to hide behaviour from the user",
            ),
            (
                "sensitive_file_access",
                r"(?i)(~/\.ssh|id_rsa|id_ed25519|/etc/passwd|/etc/shadow|\.aws/credentials|\.env\b|mcp\.json|\.cursor/|claude_desktop_config)",
                Severity::High,
                "References credential or agent configuration files",
            ),
            (
                "exfiltration_instruction",
                r"(?i)(send|post|upload|transmit|forward|exfiltrate)\s+.{0,60}?\bto\s+(https?://|\S+@\S+\.\w+)",
                Severity::High,
                "Instructs the model to send data to an external destination",
            ),
            (
                "tool_precondition",
                r"(?i)before\s+(using|calling|invoking|running)\s+(this|any|the\s+\w+)\s+tool",
                Severity::Medium,
                "Imposes a precondition on tool use",
            ),
            (
                "cross_tool_override",
                r"(?i)(when|whenever|if)\s+(using|calling|invoking)\s+(the\s+)?[\w.-]+\s+tool|(instead\s+of|rather\s+than)\s+(using|calling)\s+[\w.-]+",
                Severity::Medium,
                "Tries to change how another tool is used",
            ),
            (
                "role_hijack",
                r"(?i)you\s+are\s+now\s+(a|an|in|the)\b|from\s+now\s+on\s+you\s+(must|will|should)",
                Severity::Medium,
                "Attempts to reassign the model's role",
            ),
            (
                "encoded_payload",
                r"[A-Za-z0-9+/]{80,}={0,2}",
                Severity::Low,
                "Long base64-like run",
            ),
        ];

        raw.into_iter()
            .filter_map(|(id, pattern, severity, description)| {
                Regex::new(pattern).ok().map(|pattern| DescriptorPattern {
                    id,
                    pattern,
                    severity,
                    description,
                })
            })
            .collect()
    })
}

/// Local descriptor checks.
#[derive(Debug, Clone, Default)]
pub struct DescriptorHeuristics {
    config: HeuristicsConfig,
}

impl DescriptorHeuristics {
    /// Create heuristics with default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Create heuristics with custom config
    pub fn with_config(config: HeuristicsConfig) -> Self {
        Self { config }
    }

    /// Runs every heuristic over `text` and returns all hits, highest
    /// severity first.
    pub fn scan(&self, text: &str) -> Vec<HeuristicMatch> {
        let mut hits = Vec::new();

        if self.config.report_hidden_characters {
            let hidden = cdr::find_hidden_characters(text);
            if let Some(first) = hidden.first() {
                hits.push(HeuristicMatch {
                    id: "hidden_characters".to_string(),
                    detail: format!(
                        "{} invisible character(s), first U+{:04X} at byte {}",
                        hidden.len(),
                        first.ch as u32,
                        first.offset
                    ),
                    severity: Severity::High,
                });
            }
        }

        for p in patterns() {
            if p.pattern.is_match(text) {
                hits.push(HeuristicMatch {
                    id: p.id.to_string(),
                    detail: p.description.to_string(),
                    severity: p.severity,
                });
            }
        }

        hits.sort_by(|a, b| b.severity.cmp(&a.severity));
        hits
    }

    /// Returns the hits at or above the flag threshold. Empty means clean.
    pub fn flag(&self, text: &str) -> Vec<HeuristicMatch> {
        self.scan(text)
            .into_iter()
            .filter(|hit| hit.severity >= self.config.flag_threshold)
            .collect()
    }
}

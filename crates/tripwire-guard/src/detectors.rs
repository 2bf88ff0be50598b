//! Built-in content detectors behind the `secrets`, `pii` and `links`
//! guardrail templates.
//!
//! Each detector reports the kind of thing it found, never the matched
//! text, so audit records do not leak what they are guarding.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::Template;

/// A detector hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// Template the detector belongs to.
    pub template: Template,
    /// Kind of content found (`aws_access_key`, `email`, ...).
    pub kind: &'static str,
}

type PatternTable = Vec<(&'static str, Regex)>;

fn compile(raw: &[(&'static str, &'static str)]) -> PatternTable {
    raw.iter()
        .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|r| (*name, r)))
        .collect()
}

fn secret_patterns() -> &'static PatternTable {
    static PATTERNS: OnceLock<PatternTable> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile(&[
            ("aws_access_key", r"\b(AKIA|ASIA)[0-9A-Z]{16}\b"),
            ("github_token", r"\bgh[pousr]_[A-Za-z0-9]{36,}\b"),
            ("slack_token", r"\bxox[abprs]-[A-Za-z0-9-]{10,}"),
            ("openai_key", r"\bsk-(proj-)?[A-Za-z0-9_-]{20,}"),
            ("anthropic_key", r"\bsk-ant-[A-Za-z0-9_-]{20,}"),
            ("google_api_key", r"\bAIza[0-9A-Za-z_-]{35}\b"),
            ("stripe_key", r"\b(sk|rk)_(live|test)_[0-9A-Za-z]{16,}\b"),
            ("private_key", r"-----BEGIN ([A-Z]+ )?PRIVATE KEY-----"),
            ("jwt", r"\beyJ[A-Za-z0-9_-]{8,}\.eyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}"),
            (
                "generic_credential",
                r#"(?i)\b(api[_-]?key|secret|password|passwd|access[_-]?token)\b\s*["']?\s*[:=]\s*["']?[A-Za-z0-9/+_.-]{12,}"#,
            ),
        ])
    })
}

fn pii_patterns() -> &'static PatternTable {
    static PATTERNS: OnceLock<PatternTable> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile(&[
            ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
            ("credit_card", r"\b(?:\d[ -]?){13,16}\b"),
            ("phone", r"(?:\+\d{1,3}[\s.-]?)?\(?\b\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b"),
            ("iban", r"\b[A-Z]{2}\d{2}[A-Z0-9]{11,30}\b"),
        ])
    })
}

fn link_patterns() -> &'static PatternTable {
    static PATTERNS: OnceLock<PatternTable> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(&[("url", r#"(?i)\b(https?|ftp)://[^\s"'<>)]+"#)]))
}

/// Runs the detector of `template` over `text`.
///
/// `Template::Moderated` has no local detector and never matches.
pub fn detect(template: Template, text: &str) -> Option<Detection> {
    let table = match template {
        Template::Secrets => secret_patterns(),
        Template::Pii => pii_patterns(),
        Template::Links => link_patterns(),
        Template::Moderated => return None,
    };

    table.iter().find_map(|(kind, re)| {
        let hit = if *kind == "credit_card" {
            // Digit runs are common in payloads; require a valid checksum.
            re.find_iter(text).any(|m| luhn_valid(m.as_str()))
        } else {
            re.is_match(text)
        };
        hit.then_some(Detection {
            template,
            kind: *kind,
        })
    })
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

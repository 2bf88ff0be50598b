//! Capability labelling for toxic-flow analysis
//!
//! Assigns each entity a set of [`CapabilityLabel`]s from its name, its
//! description and its behavioral annotations. Labels are coarse on
//! purpose: the flow graph only needs to know which entities can ingest
//! attacker text, which touch private data, and which can act on the world.
//!
//! ## Label Sources
//!
//! | Source | Example | Label |
//! |--------|---------|-------|
//! | Name/description keywords | `fetch_url`, "browse the web" | `UntrustedContent` |
//! | Name/description keywords | `read_file`, "query the database" | `PrivateData` |
//! | Name/description keywords | `send_email`, "post a comment" | `PublicSink` |
//! | Name/description keywords | `run_shell`, "delete the file" | `Destructive` |
//! | `annotations.destructiveHint: true` | | `Destructive` |
//! | `annotations.openWorldHint: true` | | `UntrustedContent` |

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::CapabilityLabel;

fn label_patterns() -> &'static [(CapabilityLabel, Regex)] {
    static PATTERNS: OnceLock<Vec<(CapabilityLabel, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let raw = [
            (
                CapabilityLabel::UntrustedContent,
                r"(?i)\b(fetch|browse|scrape|crawl|download|web[\s_-]?(page|search|content)|search[\s_-]the[\s_-]web|url|rss|issues?|pull[\s_-]requests?|inbox|read[\s_-](email|mail|messages?)|comments?)\b",
            ),
            (
                CapabilityLabel::PrivateData,
                r"(?i)\b(read[\s_-]?files?|file[\s_-]?system|filesystem|directory|database|sql|query|credentials?|secrets?|private|password|ssh|notes?|calendar|contacts?|documents?|repositor(y|ies)|env(ironment)?[\s_-]variables?)\b",
            ),
            (
                CapabilityLabel::PublicSink,
                r"(?i)\b(send|post|publish|upload|share|tweet|webhook|notify|email|slack|message|create[\s_-](issue|comment|gist)|http[\s_-]?request|push)\b",
            ),
            (
                CapabilityLabel::Destructive,
                r"(?i)\b(delete|remove|drop|truncate|destroy|overwrite|write[\s_-]?files?|exec(ute)?|shell|bash|command|terminal|run[\s_-]?(code|script|command)|kill|format|rm)\b",
            ),
        ];

        raw.into_iter()
            .filter_map(|(label, pattern)| Regex::new(pattern).ok().map(|r| (label, r)))
            .collect()
    })
}

/// Labels an entity.
///
/// `text` should hold the entity name and description; underscores in
/// names are treated as word separators.
pub fn label_capability(
    text: &str,
    annotations: Option<&serde_json::Value>,
) -> BTreeSet<CapabilityLabel> {
    let spaced = text.replace(['_', '.'], " ");
    let mut labels: BTreeSet<CapabilityLabel> = label_patterns()
        .iter()
        .filter(|(_, re)| re.is_match(&spaced))
        .map(|(label, _)| *label)
        .collect();

    if let Some(annotations) = annotations {
        let hint = |key: &str| annotations.get(key).and_then(|v| v.as_bool());
        if hint("destructiveHint") == Some(true) {
            labels.insert(CapabilityLabel::Destructive);
        }
        if hint("openWorldHint") == Some(true) {
            labels.insert(CapabilityLabel::UntrustedContent);
        }
        if hint("readOnlyHint") == Some(true) {
            labels.remove(&CapabilityLabel::Destructive);
        }
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_web_fetch_is_untrusted() {
        let labels = label_capability("fetch_url\nFetch a web page and return its text", None);
        assert!(labels.contains(&CapabilityLabel::UntrustedContent));
    }

    #[test]
    fn test_shell_is_destructive() {
        let labels = label_capability("run_command\nExecute a shell command", None);
        assert!(labels.contains(&CapabilityLabel::Destructive));
    }

    #[test]
    fn test_send_email_is_sink() {
        let labels = label_capability("send_email\nSend an email to a recipient", None);
        assert!(labels.contains(&CapabilityLabel::PublicSink));
    }

    #[test]
    fn test_read_file_is_private() {
        let labels = label_capability("read_file\nRead a file from the filesystem", None);
        assert!(labels.contains(&CapabilityLabel::PrivateData));
    }

    #[test]
    fn test_arithmetic_has_no_labels() {
        assert!(label_capability("add\nAdd two numbers", None).is_empty());
    }

    #[test]
    fn test_annotations_override() {
        let labels = label_capability(
            "tidy\nTidy things up",
            Some(&json!({"destructiveHint": true, "openWorldHint": true})),
        );
        assert!(labels.contains(&CapabilityLabel::Destructive));
        assert!(labels.contains(&CapabilityLabel::UntrustedContent));

        let read_only = label_capability("remove_preview\nPreview what would be removed", Some(&json!({"readOnlyHint": true})));
        assert!(!read_only.contains(&CapabilityLabel::Destructive));
    }
}

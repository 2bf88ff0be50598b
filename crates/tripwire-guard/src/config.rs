//! # Guardrail Configuration
//!
//! YAML file keyed by client, then server, declaring which guardrails apply
//! to the intercepted traffic of each `(client, server)` pair.
//!
//! ## File Shape
//!
//! ```yaml
//! cursor:                       # client
//!   custom_guardrails:          # applies to every server of this client
//!     - id: no_errors
//!       name: "Block tool results mentioning errors"
//!       action: block
//!       content: "(?i)error"
//!   servers:
//!     whatsapp:                 # server name as in the client config
//!       guardrails:
//!         pii: block            # template shorthand: log | block | paused
//!         secrets: log
//!         custom_guardrails:
//!           - id: no_wire
//!             name: "No wire transfers"
//!             action: block
//!             content: "(?i)wire\\s+transfer"
//!             path: /params/arguments
//!             direction: request
//!       tools:
//!         send_message:
//!           enabled: false      # every call is blocked
//!         read_messages:
//!           secrets: block      # overrides the server shorthand
//! ```
//!
//! Unknown keys are rejected so typos do not silently disable a guardrail.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{DirectionFilter, GuardrailMode, Result, Template};

/// Commented example written on first use.
pub const DEFAULT_GUARDRAIL_CONFIG: &str = r#"# Configure guardrails for intercepted MCP traffic here.
# <client-name>:            # client shorthand (cursor, claude, windsurf, vscode)
#   servers:
#     <server-name>:        # server name as it appears in the client config
#       guardrails:
#         secrets: block    # block calls/results containing secrets
#         pii: log          # log calls/results containing PII
#         links: paused     # keep the rule but do not evaluate it
#
#         custom_guardrails:
#           - id: error_filter
#             name: "Filter tool results with 'error'"
#             action: block # or 'log'
#             content: "(?i)error"
#             direction: response
#
#       tools:
#         <tool-name>:
#           enabled: false  # block every call to this tool
"#;

/// Template shorthands shared by server and tool sections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shorthands {
    /// PII detector.
    pub pii: Option<GuardrailMode>,
    /// Moderation. Reported unavailable.
    pub moderated: Option<GuardrailMode>,
    /// URL detector.
    pub links: Option<GuardrailMode>,
    /// Secret detector.
    pub secrets: Option<GuardrailMode>,
}

impl Shorthands {
    /// Returns the configured `(template, mode)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Template, GuardrailMode)> {
        [
            (Template::Pii, self.pii),
            (Template::Moderated, self.moderated),
            (Template::Links, self.links),
            (Template::Secrets, self.secrets),
        ]
        .into_iter()
        .filter_map(|(template, mode)| mode.map(|m| (template, m)))
    }
}

/// A user-defined guardrail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomGuardrail {
    /// Identifier, unique per server.
    pub id: String,
    /// Display name.
    pub name: String,
    /// What to do on a match.
    #[serde(default = "default_action")]
    pub action: GuardrailMode,
    /// Disabled guardrails are dropped at compile time.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Regular expression matched against message text.
    pub content: String,
    /// JSON pointer restricting the match to part of the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Which messages the guardrail looks at.
    #[serde(default)]
    pub direction: DirectionFilter,
}

fn default_action() -> GuardrailMode {
    GuardrailMode::Log
}

fn default_true() -> bool {
    true
}

/// Server-level guardrails section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerGuardrails {
    /// PII shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pii: Option<GuardrailMode>,
    /// Moderation shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderated: Option<GuardrailMode>,
    /// Links shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<GuardrailMode>,
    /// Secrets shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<GuardrailMode>,
    /// Custom guardrails for this server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_guardrails: Vec<CustomGuardrail>,
}

impl ServerGuardrails {
    /// Returns the template shorthands.
    pub fn shorthands(&self) -> Shorthands {
        Shorthands {
            pii: self.pii,
            moderated: self.moderated,
            links: self.links,
            secrets: self.secrets,
        }
    }
}

/// Tool-level overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolGuardrails {
    /// A disabled tool has every call blocked.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// PII shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pii: Option<GuardrailMode>,
    /// Moderation shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderated: Option<GuardrailMode>,
    /// Links shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<GuardrailMode>,
    /// Secrets shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<GuardrailMode>,
}

impl ToolGuardrails {
    /// Returns the template shorthands.
    pub fn shorthands(&self) -> Shorthands {
        Shorthands {
            pii: self.pii,
            moderated: self.moderated,
            links: self.links,
            secrets: self.secrets,
        }
    }
}

/// Configuration of one server under one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerGuardrailConfig {
    /// Server-wide guardrails.
    #[serde(default)]
    pub guardrails: ServerGuardrails,
    /// Per-tool overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolGuardrails>,
}

/// Configuration of one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientGuardrailConfig {
    /// Guardrails applied to every server of the client.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_guardrails: Vec<CustomGuardrail>,
    /// Per-server configuration.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerGuardrailConfig>,
}

/// The whole guardrail file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuardrailConfigFile {
    /// Client name to client config.
    pub clients: BTreeMap<String, ClientGuardrailConfig>,
}

impl GuardrailConfigFile {
    /// Parses a YAML document. A document with only comments is empty.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let has_content = text
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with('#') && line != "---");
        if !has_content {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Loads the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Loads the file at `path`, first writing [`DEFAULT_GUARDRAIL_CONFIG`]
    /// there if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, DEFAULT_GUARDRAIL_CONFIG)?;
            info!(path = %path.display(), "wrote example guardrail config");
        }
        Self::load(path)
    }

    /// Returns the config of `client`, if any.
    pub fn client(&self, client: &str) -> Option<&ClientGuardrailConfig> {
        self.clients.get(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cursor:
  custom_guardrails:
    - id: no_errors
      name: "No errors"
      action: block
      content: "(?i)error"
  servers:
    whatsapp:
      guardrails:
        pii: block
        moderated: paused
        custom_guardrails:
          - id: wire
            name: "No wire transfers"
            content: "wire transfer"
            path: /params/arguments
            direction: request
      tools:
        send_message:
          enabled: false
        read_messages:
          secrets: block
"#;

    #[test]
    fn test_parse_sample() {
        let config = GuardrailConfigFile::from_yaml_str(SAMPLE).unwrap();
        let cursor = config.client("cursor").unwrap();
        assert_eq!(cursor.custom_guardrails.len(), 1);

        let whatsapp = &cursor.servers["whatsapp"];
        assert_eq!(whatsapp.guardrails.pii, Some(GuardrailMode::Block));
        assert_eq!(whatsapp.guardrails.moderated, Some(GuardrailMode::Paused));

        let custom = &whatsapp.guardrails.custom_guardrails[0];
        assert_eq!(custom.action, GuardrailMode::Log);
        assert!(custom.enabled);
        assert_eq!(custom.direction, DirectionFilter::Request);

        assert!(!whatsapp.tools["send_message"].enabled);
        assert_eq!(
            whatsapp.tools["read_messages"].secrets,
            Some(GuardrailMode::Block)
        );
    }

    #[test]
    fn test_comment_only_file_is_empty() {
        let config = GuardrailConfigFile::from_yaml_str(DEFAULT_GUARDRAIL_CONFIG).unwrap();
        assert!(config.clients.is_empty());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let text = "cursor:\n  servers:\n    s:\n      guardrails:\n        secret: block\n";
        assert!(GuardrailConfigFile::from_yaml_str(text).is_err());
    }

    #[test]
    fn test_load_or_init_writes_example() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("guardrails_config.yml");

        let config = GuardrailConfigFile::load_or_init(&path).unwrap();
        assert!(config.clients.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), DEFAULT_GUARDRAIL_CONFIG);
    }

    #[test]
    fn test_shorthand_iter_skips_unset() {
        let s = Shorthands {
            secrets: Some(GuardrailMode::Block),
            ..Shorthands::default()
        };
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![(Template::Secrets, GuardrailMode::Block)]);
    }
}

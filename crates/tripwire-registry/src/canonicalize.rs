//! # Canonical Entity Hashing
//!
//! Pins are SHA-256 digests over an RFC 8785 (JCS) serialization of a
//! descriptor's canonical form. Two listings of the same entity must hash
//! identically no matter how the server or transport ordered the JSON keys,
//! while any change to the name, description text or parameter schema must
//! change the hash.
//!
//! ## Canonical Form
//!
//! ```text
//! {
//!   "description": <description, whitespace runs collapsed, trimmed>,
//!   "kind":        "tool" | "prompt" | "resource",
//!   "name":        <name>,
//!   "parameters":  <parameter schema, see CapabilityDescriptor::parameter_schema>
//! }
//! ```
//!
//! ## Threat Model
//!
//! - **Key Reordering**: JSON objects have no inherent key order; a server
//!   could reorder keys between listings to break naive byte comparison.
//! - **Whitespace Games**: reflowed description text is not a semantic change
//!   and must not trigger rug-pull alarms.
//! - **Unicode Escaping**: `"\u0041"` and `"A"` are the same string once
//!   parsed; canonicalization always works on parsed values.
//!
//! ## References
//!
//! - **RFC 8785** - "JSON Canonicalization Scheme (JCS)"
//!   <https://www.rfc-editor.org/rfc/rfc8785>
//!
//! ## Example
//!
//! ```rust
//! use tripwire_registry::canonicalize::canonicalize;
//! use serde_json::json;
//!
//! let a = canonicalize(&json!({"b": 1, "a": [true, null]}));
//! let b = canonicalize(&json!({"a": [true, null], "b": 1}));
//! assert_eq!(a, b);
//! assert_eq!(a, r#"{"a":[true,null],"b":1}"#);
//! ```

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::models::{CapabilityDescriptor, EntityHash, Hash};

/// Canonicalizes a JSON value according to RFC 8785.
///
/// Object keys are sorted by UTF-16 code units, strings use minimal escaping
/// and no insignificant whitespace is emitted.
pub fn canonicalize(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Computes the SHA-256 digest of a value's canonical serialization.
pub fn hash_canonical(value: &serde_json::Value) -> Hash {
    Sha256::digest(canonicalize(value).as_bytes()).into()
}

/// Builds the canonical form of a descriptor (see module docs).
pub fn canonical_form(descriptor: &CapabilityDescriptor) -> serde_json::Value {
    serde_json::json!({
        "kind": descriptor.kind().as_str(),
        "name": descriptor.name(),
        "description": normalize_whitespace(descriptor.description()),
        "parameters": descriptor.parameter_schema(),
    })
}

/// Computes the pin for a descriptor.
///
/// Pure and deterministic: the same descriptor content always yields the
/// same hash.
///
/// # Example
///
/// ```rust
/// use tripwire_registry::{hash_descriptor, CapabilityDescriptor, ToolDescriptor};
/// use serde_json::json;
///
/// let tool = |desc: &str| CapabilityDescriptor::Tool(ToolDescriptor {
///     name: "add".to_string(),
///     description: Some(desc.to_string()),
///     input_schema: json!({"type": "object"}),
///     annotations: None,
/// });
///
/// assert_eq!(hash_descriptor(&tool("Add two numbers")), hash_descriptor(&tool("Add  two\nnumbers ")));
/// assert_ne!(hash_descriptor(&tool("Add two numbers")), hash_descriptor(&tool("Add three numbers")));
/// ```
pub fn hash_descriptor(descriptor: &CapabilityDescriptor) -> EntityHash {
    EntityHash::from_bytes(hash_canonical(&canonical_form(descriptor)))
}

/// Collapses every run of whitespace to a single space and trims the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn write_value(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(true) => out.push_str("true"),
        serde_json::Value::Bool(false) => out.push_str("false"),
        serde_json::Value::Number(n) => write_number(n, out),
        serde_json::Value::String(s) => write_string(s, out),
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));

            out.push('{');
            for (i, (key, child)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(child, out);
            }
            out.push('}');
        }
    }
}

/// Numbers use their shortest form; integral floats print without a
/// fractional part so `1.0` and `1` agree.
fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            out.push_str("null");
        } else if f.fract() == 0.0 && f.abs() < 1e15 {
            let _ = write!(out, "{}", f as i64);
        } else {
            let _ = write!(out, "{f}");
        }
    } else {
        out.push_str(&n.to_string());
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\x08' => out.push_str("\\b"),
            '\x0C' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c < '\x20' => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

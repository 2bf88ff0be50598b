//! # Tripwire Registry - Entity Pinning
//!
//! The registry gives every tool, prompt and resource a stable content
//! address, remembers which addresses the user approved, and remembers the
//! last address each entity was seen with. That is enough to detect a rug
//! pull: an approved entity that silently changes its definition.
//!
//! ## Purpose
//!
//! 1. **Typed Descriptors** - [`CapabilityDescriptor`] is a tagged variant per
//!    entity kind sharing a base field set (name, description).
//!
//! 2. **Canonical Hashing** - RFC 8785 serialization of a canonical form,
//!    hashed with SHA-256, so key order and whitespace reflow do not matter.
//!
//! 3. **Whitelist** - exact `(kind, name, hash)` approval, with a scope flag
//!    that keeps local-only approvals off shared surfaces.
//!
//! 4. **Pin History** - the last hash per `(server, kind, name)`.
//!
//! ## Threat Model
//!
//! | Threat | Description | Defense |
//! |--------|-------------|---------|
//! | Rug Pull | Approved tool changes its description after approval | Pin history comparison |
//! | Trust Carry-over | Approval of v1 reused for a malicious v2 | Whitelist keyed by hash |
//! | Key Reordering | Same schema listed with different key order | RFC 8785 canonicalization |
//! | Kind Confusion | Prompt named like an approved tool | Kind in every key |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      TRIPWIRE REGISTRY                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  CapabilityDescriptor ──▶ canonical_form ──▶ JCS ──▶ SHA-256 │
//! │                                                     │        │
//! │                                                EntityHash    │
//! │                                                     │        │
//! │            ┌────────────────────────┬───────────────┘        │
//! │            ▼                        ▼                        │
//! │   ┌─────────────────┐      ┌─────────────────┐               │
//! │   │    whitelist    │      │     history     │   sled trees  │
//! │   │ kind/name/hash  │      │ server/kind/name│               │
//! │   └─────────────────┘      └─────────────────┘               │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use tripwire_registry::{
//!     hash_descriptor, CapabilityDescriptor, EntityRef, PinStatus, Registry, ToolDescriptor,
//! };
//! use serde_json::json;
//!
//! let registry = Registry::temporary().unwrap();
//! let add = CapabilityDescriptor::Tool(ToolDescriptor {
//!     name: "add".to_string(),
//!     description: Some("Add two numbers".to_string()),
//!     input_schema: json!({"type": "object"}),
//!     annotations: None,
//! });
//! let entity = EntityRef::new("math", add.kind(), add.name());
//!
//! let hash = hash_descriptor(&add);
//! assert_eq!(registry.compare(&entity, &hash).unwrap(), PinStatus::Unseen);
//! registry.record(&entity, &add).unwrap();
//! assert_eq!(registry.compare(&entity, &hash).unwrap(), PinStatus::Unchanged);
//! ```
//!
//! ## References
//!
//! - **RFC 8785 (2020)** - "JSON Canonicalization Scheme (JCS)"
//!   <https://www.rfc-editor.org/rfc/rfc8785>
//! - **NIST FIPS 180-4** - "Secure Hash Standard (SHS)"
//!   <https://csrc.nist.gov/publications/detail/fips/180/4/final>
//! - **Sled Documentation** - <https://sled.rs/>

pub mod canonicalize;
pub mod models;
pub mod registry;
pub mod storage;

pub use canonicalize::hash_descriptor;
pub use models::{
    CapabilityDescriptor, EntityHash, EntityKind, EntityRef, Hash, PinStatus, PromptArgument,
    PromptDescriptor, RegistryError, ResourceDescriptor, Result, SeenEntity, ToolDescriptor,
    WhitelistEntry, WhitelistScope,
};
pub use registry::Registry;

#[cfg(test)]
mod tests;

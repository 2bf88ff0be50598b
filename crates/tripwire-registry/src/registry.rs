//! # Registry Facade
//!
//! [`Registry`] is the single store object handed to the scanner: the
//! whitelist operations (`lookup`, `add`, `reset`, `list`) and the pin
//! history used for rug-pull detection (`compare`, `record`).
//!
//! ## Lifecycle
//!
//! Open once per invocation, read during the scan, write the fresh pins
//! after every server has settled, then [`Registry::flush`].

use std::path::Path;

use chrono::Utc;
use tracing::{debug, info};

use crate::canonicalize::hash_descriptor;
use crate::models::{
    CapabilityDescriptor, EntityHash, EntityKind, EntityRef, PinStatus, Result, SeenEntity,
    WhitelistEntry, WhitelistScope,
};
use crate::storage::Storage;

/// Whitelist and pin-history store.
///
/// # Example
///
/// ```rust
/// use tripwire_registry::{Registry, EntityKind, EntityHash, WhitelistScope};
///
/// let registry = Registry::temporary().unwrap();
/// let hash = EntityHash::from_bytes([3u8; 32]);
///
/// registry.add(EntityKind::Tool, "add", hash, WhitelistScope::LocalOnly).unwrap();
/// assert!(registry.lookup(EntityKind::Tool, "add", &hash).unwrap());
///
/// registry.reset().unwrap();
/// assert!(!registry.lookup(EntityKind::Tool, "add", &hash).unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct Registry {
    storage: Storage,
}

impl Registry {
    /// Opens the registry database at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Database` if the database can not be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = Storage::open(path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            whitelist = storage.whitelist_len(),
            pinned = storage.history_len(),
            "registry opened"
        );
        Ok(Self { storage })
    }

    /// Creates an in-memory registry.
    pub fn temporary() -> Result<Self> {
        Ok(Self {
            storage: Storage::temporary()?,
        })
    }

    /// Returns true iff the exact `(kind, name, hash)` triple is approved.
    ///
    /// A rug pull changes the hash, so a previously approved entity stops
    /// matching and has to be re-verified.
    pub fn lookup(&self, kind: EntityKind, name: &str, hash: &EntityHash) -> Result<bool> {
        self.storage.contains_whitelist(kind, name, hash)
    }

    /// Approves a triple.
    ///
    /// The scope is recorded with the entry. Propagating `Contributed`
    /// entries to a shared whitelist is the caller's job; `LocalOnly`
    /// entries are never handed out for propagation by this crate.
    pub fn add(
        &self,
        kind: EntityKind,
        name: &str,
        hash: EntityHash,
        scope: WhitelistScope,
    ) -> Result<WhitelistEntry> {
        let entry = WhitelistEntry {
            kind,
            name: name.to_string(),
            hash,
            scope,
            added_at: Utc::now(),
        };
        self.storage.insert_whitelist(&entry)?;
        self.storage.flush()?;
        info!(%kind, name, hash = %hash.short(), ?scope, "whitelisted");
        Ok(entry)
    }

    /// Removes every whitelist entry.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub fn reset(&self) -> Result<usize> {
        let removed = self.storage.clear_whitelist()?;
        self.storage.flush()?;
        info!(removed, "whitelist reset");
        Ok(removed)
    }

    /// Lists whitelist entries ordered by kind, name, then hash.
    pub fn list(&self) -> Result<Vec<WhitelistEntry>> {
        self.storage.whitelist_entries()
    }

    /// Compares a fresh hash with the last pin for the same entity.
    pub fn compare(&self, entity: &EntityRef, hash: &EntityHash) -> Result<PinStatus> {
        let status = match self.storage.load_seen(entity)? {
            None => PinStatus::Unseen,
            Some(previous) if previous.hash == *hash => PinStatus::Unchanged,
            Some(previous) => {
                debug!(%entity, old = %previous.hash.short(), new = %hash.short(), "pin changed");
                PinStatus::Changed { previous }
            }
        };
        Ok(status)
    }

    /// Records the latest observation of an entity.
    pub fn record(&self, entity: &EntityRef, descriptor: &CapabilityDescriptor) -> Result<EntityHash> {
        let hash = hash_descriptor(descriptor);
        let seen = SeenEntity {
            hash,
            kind: descriptor.kind(),
            timestamp: Utc::now(),
            description: Some(descriptor.description().to_string()),
        };
        self.storage.store_seen(entity, &seen)?;
        Ok(hash)
    }

    /// Returns the last-seen record for an entity, if any.
    pub fn last_seen(&self, entity: &EntityRef) -> Result<Option<SeenEntity>> {
        self.storage.load_seen(entity)
    }

    /// Flushes pending writes.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()?;
        Ok(())
    }
}

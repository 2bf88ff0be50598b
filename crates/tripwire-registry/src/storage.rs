//! # Persistent Storage Layer
//!
//! Sled-backed persistence for the whitelist and the per-entity pin history.
//! Both survive restarts so rug pulls are detected across scan invocations.
//!
//! ## Storage Structure
//!
//! | Tree | Key | Value | Purpose |
//! |------|-----|-------|---------|
//! | `whitelist` | `kind \0 name \0 hex-hash` | JSON [`WhitelistEntry`] | Approved triples |
//! | `history` | `server \0 kind \0 name` | JSON [`SeenEntity`] | Last-seen pin |
//!
//! Keys are NUL-separated so sled's lexicographic iteration yields whitelist
//! entries ordered by kind, then name, then hash.
//!
//! ## Concurrency
//!
//! Sled is safe for concurrent readers and writers inside one process, but
//! two processes can not open the same database. Scan invocations are
//! single-writer: open once, flush once at the end of a successful run.
//!
//! ## References
//!
//! - Sled documentation: <https://sled.rs/>

use std::path::Path;

use crate::models::{
    EntityHash, EntityKind, EntityRef, RegistryError, Result, SeenEntity, WhitelistEntry,
};

/// Tree name for approved triples.
const WHITELIST_TREE: &str = "whitelist";

/// Tree name for last-seen pins.
const HISTORY_TREE: &str = "history";

const SEP: u8 = 0;

/// Wrapper around a Sled database holding registry state.
///
/// # Example
///
/// ```rust
/// use tripwire_registry::storage::Storage;
/// use tripwire_registry::{EntityHash, EntityKind, WhitelistEntry, WhitelistScope};
///
/// let storage = Storage::temporary().unwrap();
/// let entry = WhitelistEntry {
///     kind: EntityKind::Tool,
///     name: "add".to_string(),
///     hash: EntityHash::from_bytes([7u8; 32]),
///     scope: WhitelistScope::LocalOnly,
///     added_at: chrono::Utc::now(),
/// };
///
/// storage.insert_whitelist(&entry).unwrap();
/// assert!(storage.contains_whitelist(EntityKind::Tool, "add", &entry.hash).unwrap());
/// ```
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
    whitelist: sled::Tree,
    history: sled::Tree,
}

impl Storage {
    /// Opens or creates a storage database at the given directory.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Database` if the path is unusable, another
    /// process holds the database lock, or the files are corrupted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Creates an in-memory storage that is discarded on drop.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let whitelist = db.open_tree(WHITELIST_TREE)?;
        let history = db.open_tree(HISTORY_TREE)?;
        Ok(Storage {
            db,
            whitelist,
            history,
        })
    }

    /// Inserts (or replaces) a whitelist entry.
    pub fn insert_whitelist(&self, entry: &WhitelistEntry) -> Result<()> {
        let key = whitelist_key(entry.kind, &entry.name, &entry.hash.to_hex());
        self.whitelist.insert(key, serde_json::to_vec(entry)?)?;
        Ok(())
    }

    /// Returns true iff the exact `(kind, name, hash)` triple is present.
    pub fn contains_whitelist(
        &self,
        kind: EntityKind,
        name: &str,
        hash: &EntityHash,
    ) -> Result<bool> {
        let key = whitelist_key(kind, name, &hash.to_hex());
        Ok(self.whitelist.contains_key(key)?)
    }

    /// Returns every whitelist entry in key order.
    pub fn whitelist_entries(&self) -> Result<Vec<WhitelistEntry>> {
        self.whitelist
            .iter()
            .values()
            .map(|value| -> Result<WhitelistEntry> { Ok(serde_json::from_slice(&value?)?) })
            .collect()
    }

    /// Removes every whitelist entry and returns how many were removed.
    pub fn clear_whitelist(&self) -> Result<usize> {
        let count = self.whitelist.len();
        self.whitelist.clear()?;
        Ok(count)
    }

    /// Loads the last-seen record for an entity.
    pub fn load_seen(&self, entity: &EntityRef) -> Result<Option<SeenEntity>> {
        match self.history.get(history_key(entity))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stores the last-seen record for an entity, replacing any previous one.
    pub fn store_seen(&self, entity: &EntityRef, seen: &SeenEntity) -> Result<()> {
        self.history
            .insert(history_key(entity), serde_json::to_vec(seen)?)?;
        Ok(())
    }

    /// Returns every history record with its entity reference.
    pub fn history_entries(&self) -> Result<Vec<(EntityRef, SeenEntity)>> {
        let mut out = Vec::new();
        for item in self.history.iter() {
            let (key, value) = item?;
            let entity = parse_history_key(&key)?;
            out.push((entity, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    /// Returns the number of whitelist entries.
    pub fn whitelist_len(&self) -> usize {
        self.whitelist.len()
    }

    /// Returns the number of pinned entities.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Flushes all pending writes to disk.
    ///
    /// # Returns
    ///
    /// The number of bytes flushed.
    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("whitelist_count", &self.whitelist_len())
            .field("history_count", &self.history_len())
            .finish()
    }
}

fn join_key(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(part.as_bytes());
    }
    key
}

fn whitelist_key(kind: EntityKind, name: &str, hex_hash: &str) -> Vec<u8> {
    join_key(&[kind.as_str(), name, hex_hash])
}

fn history_key(entity: &EntityRef) -> Vec<u8> {
    join_key(&[&entity.server, entity.kind.as_str(), &entity.name])
}

fn parse_history_key(key: &[u8]) -> Result<EntityRef> {
    let text = std::str::from_utf8(key)
        .map_err(|_| RegistryError::Corrupt("history key is not UTF-8".to_string()))?;
    let mut parts = text.splitn(3, SEP as char);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(server), Some(kind), Some(name)) => {
            Ok(EntityRef::new(server, kind.parse()?, name))
        }
        _ => Err(RegistryError::Corrupt(format!("malformed history key {text:?}"))),
    }
}

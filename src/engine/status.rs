//! Read/unread bookkeeping
//!
//! A flat map from message hash to status, persisted as one JSON blob in
//! the caller-supplied durable store. Unknown hashes read as unread.
//! Single writer per wallet; two engines sharing a wallet would race.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::Address;
use crate::storage::{statuses_key, KeyValueStore};

/// Whether a message has been read
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStatus {
    /// Seen by the user
    Read,
    /// Not yet seen; the default for unknown hashes
    Unread,
}

/// Per-wallet read/unread map
pub struct StatusStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
    map: HashMap<String, ReadStatus>,
}

impl StatusStore {
    /// Load the map persisted for a wallet, empty when absent or corrupt
    pub fn load(store: Arc<dyn KeyValueStore>, wallet: &Address) -> Self {
        let key = statuses_key(wallet);
        let map = match store.get(&key) {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(%wallet, %err, "discarding unreadable status map");
                HashMap::new()
            }),
            None => HashMap::new(),
        };
        StatusStore { store, key, map }
    }

    /// Status of a message hash; unknown hashes are unread
    pub fn status_of(&self, hash: &str) -> ReadStatus {
        self.map.get(hash).copied().unwrap_or(ReadStatus::Unread)
    }

    /// Mark a message read
    pub fn mark_read(&mut self, hash: &str) {
        self.set(hash, ReadStatus::Read);
    }

    /// Mark a message unread again
    pub fn mark_unread(&mut self, hash: &str) {
        self.set(hash, ReadStatus::Unread);
    }

    fn set(&mut self, hash: &str, status: ReadStatus) {
        self.map.insert(hash.to_string(), status);
        self.persist();
    }

    /// Write the whole map back to the store
    fn persist(&self) {
        match serde_json::to_string(&self.map) {
            Ok(raw) => self.store.set(&self.key, &raw),
            Err(err) => warn!(%err, "status map serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MessagingKeypair;
    use crate::storage::MemoryStore;

    #[test]
    fn test_unknown_hash_is_unread() {
        let wallet = MessagingKeypair::generate().address();
        let statuses = StatusStore::load(Arc::new(MemoryStore::new()), &wallet);
        assert_eq!(statuses.status_of("0xA-0xB.0"), ReadStatus::Unread);
    }

    #[test]
    fn test_marks_persist_across_loads() {
        let wallet = MessagingKeypair::generate().address();
        let store = Arc::new(MemoryStore::new());

        let mut statuses = StatusStore::load(store.clone(), &wallet);
        statuses.mark_read("room.0");
        statuses.mark_read("room.1");
        statuses.mark_unread("room.1");

        let reloaded = StatusStore::load(store, &wallet);
        assert_eq!(reloaded.status_of("room.0"), ReadStatus::Read);
        assert_eq!(reloaded.status_of("room.1"), ReadStatus::Unread);
    }

    #[test]
    fn test_wallets_do_not_share_maps() {
        let store = Arc::new(MemoryStore::new());
        let w1 = MessagingKeypair::generate().address();
        let w2 = MessagingKeypair::generate().address();

        let mut s1 = StatusStore::load(store.clone(), &w1);
        s1.mark_read("shared.0");

        let s2 = StatusStore::load(store, &w2);
        assert_eq!(s2.status_of("shared.0"), ReadStatus::Unread);
    }

    #[test]
    fn test_corrupt_blob_resets_to_empty() {
        let wallet = MessagingKeypair::generate().address();
        let store = Arc::new(MemoryStore::new());
        store.set(&statuses_key(&wallet), "not json");

        let statuses = StatusStore::load(store, &wallet);
        assert_eq!(statuses.status_of("room.0"), ReadStatus::Unread);
    }
}

//! Pluggable key-value persistence
//!
//! The engine persists two very different kinds of data: messaging
//! secrets (private key, enrollment phrase, publication proof) and the
//! read/unread status map. Secrets belong in the most ephemeral store the
//! deployment offers; the status map belongs in a durable one. Both sides
//! consume the same minimal [`KeyValueStore`] interface, and
//! [`SecretVault`] layers a priority order over several secret stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::crypto::Address;

/// Minimal string key-value store
///
/// Implementations wrap whatever the host platform offers: an in-memory
/// map, session cookies, a browser's local storage, a file.
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value, `None` when absent
    fn get(&self, key: &str) -> Option<String>;

    /// Store a value, replacing any previous one
    fn set(&self, key: &str, value: &str);
}

/// In-memory store used in tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().expect("store lock").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .expect("store lock")
            .insert(key.to_string(), value.to_string());
    }
}

/// Storage key for the hex messaging private key of a wallet
pub fn messaging_key_key(wallet: &Address) -> String {
    format!("MK_:{wallet}")
}

/// Storage key for the enrollment phrase the wallet signed
pub fn enrollment_phrase_key(wallet: &Address) -> String {
    format!("MP_:{wallet}")
}

/// Storage key for the publication message
pub fn publication_message_key(wallet: &Address) -> String {
    format!("KEY_:{wallet}")
}

/// Storage key for the wallet's publication signature
pub fn publication_signature_key(wallet: &Address) -> String {
    format!("PMS_:{wallet}")
}

/// Storage key for the first-subscription timestamp
pub fn subscription_start_key(wallet: &Address) -> String {
    format!("message_subscription_start:{wallet}")
}

/// Storage key for the serialized read/unread map
pub fn statuses_key(wallet: &Address) -> String {
    format!("message_statuses:{wallet}")
}

/// Prioritized stack of secret stores
///
/// Reads scan the tiers in order and return the first hit. Writes go to
/// the tier already holding the wallet's messaging key, so an identity
/// that lives in (say) session storage keeps its companion values there;
/// a wallet with no stored identity writes to the first tier.
#[derive(Clone)]
pub struct SecretVault {
    tiers: Vec<Arc<dyn KeyValueStore>>,
}

impl SecretVault {
    /// Build a vault over stores in priority order
    ///
    /// At least one store is required.
    pub fn new(tiers: Vec<Arc<dyn KeyValueStore>>) -> Option<Self> {
        if tiers.is_empty() {
            return None;
        }
        Some(SecretVault { tiers })
    }

    /// First value found for `key` across the tiers
    pub fn get(&self, key: &str) -> Option<String> {
        self.tiers.iter().find_map(|tier| tier.get(key))
    }

    /// Write a value for this wallet to its home tier
    pub fn set(&self, wallet: &Address, key: &str, value: &str) {
        self.home_tier(wallet).set(key, value);
    }

    /// The tier holding this wallet's messaging key, or the default
    fn home_tier(&self, wallet: &Address) -> &dyn KeyValueStore {
        let marker = messaging_key_key(wallet);
        self.tiers
            .iter()
            .find(|tier| tier.get(&marker).is_some())
            .unwrap_or(&self.tiers[0])
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MessagingKeypair;

    fn wallet() -> Address {
        MessagingKeypair::generate().address()
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing"), None);
        store.set("k", "v1");
        store.set("k", "v2");
        assert_eq!(store.get("k"), Some("v2".to_string()));
    }

    #[test]
    fn test_vault_reads_in_priority_order() {
        let first = Arc::new(MemoryStore::new());
        let second = Arc::new(MemoryStore::new());
        second.set("shared", "from-second");
        first.set("shared", "from-first");

        let vault = SecretVault::new(vec![first, second]).unwrap();
        assert_eq!(vault.get("shared"), Some("from-first".to_string()));
    }

    #[test]
    fn test_vault_writes_follow_the_messaging_key() {
        let wallet = wallet();
        let first = Arc::new(MemoryStore::new());
        let second = Arc::new(MemoryStore::new());

        // Identity already lives in the second tier
        second.set(&messaging_key_key(&wallet), "deadbeef");

        let vault = SecretVault::new(vec![first.clone(), second.clone()]).unwrap();
        vault.set(&wallet, &publication_signature_key(&wallet), "0xsig");

        assert_eq!(first.get(&publication_signature_key(&wallet)), None);
        assert_eq!(
            second.get(&publication_signature_key(&wallet)),
            Some("0xsig".to_string())
        );
    }

    #[test]
    fn test_vault_defaults_to_first_tier() {
        let wallet = wallet();
        let first = Arc::new(MemoryStore::new());
        let second = Arc::new(MemoryStore::new());

        let vault = SecretVault::new(vec![first.clone(), second]).unwrap();
        vault.set(&wallet, &messaging_key_key(&wallet), "cafe");

        assert_eq!(first.get(&messaging_key_key(&wallet)), Some("cafe".to_string()));
    }

    #[test]
    fn test_vault_requires_a_tier() {
        assert!(SecretVault::new(Vec::new()).is_none());
    }
}

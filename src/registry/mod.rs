//! Cached registry lookups
//!
//! The registry is the server-held mapping from wallet address to
//! published messaging identity. Lookups validate the record before
//! trusting it - the embedded public key must hash to the claimed
//! messaging address, and the wallet's publication signature must
//! recover to the wallet being looked up - and successful results are
//! cached for the life of the engine. There is no negative cache, so a
//! peer who enrolls later becomes visible on the next lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::crypto::{recover_address, Address, MessagingPublicKey};
use crate::identity::SigningStyle;
use crate::transport::{AccountRecord, KeyServer, TransportResult};

/// A validated registry entry for one wallet
#[derive(Clone, Debug)]
pub struct RegistryEntry {
    /// The wallet the registry maps from
    pub wallet_address: Address,
    /// The messaging address the wallet published
    pub messaging_address: Address,
    /// The messaging public key used for key wraps
    pub messaging_public_key: MessagingPublicKey,
    /// The publication message the wallet signed
    pub publication_message: String,
    /// Wallet signature over the publication message
    pub publication_signature: String,
    /// The enrollment phrase in use
    pub enrollment_phrase: String,
    /// Messaging key's proof-of-possession signature over the phrase
    pub enrollment_phrase_signature: String,
}

impl RegistryEntry {
    /// Validate a raw server record for `wallet`
    ///
    /// Returns `None` when the public key does not hash to the claimed
    /// messaging address or the publication signature does not recover
    /// to the wallet.
    pub fn from_record(
        wallet: Address,
        record: AccountRecord,
        style: SigningStyle,
    ) -> Option<Self> {
        let public = match MessagingPublicKey::from_hex(&record.pub_key) {
            Ok(key) => key,
            Err(_) => {
                warn!(%wallet, "registry record carries an unparsable public key");
                return None;
            }
        };
        if public.address() != record.address {
            warn!(%wallet, "registry record public key does not match its messaging address");
            return None;
        }

        match recover_address(&style.digest(&record.msg), &record.signature) {
            Ok(signer) if signer == wallet => {}
            Ok(signer) => {
                warn!(%wallet, %signer, "publication signature recovered to the wrong wallet");
                return None;
            }
            Err(_) => {
                warn!(%wallet, "publication signature is malformed");
                return None;
            }
        }

        Some(RegistryEntry {
            wallet_address: wallet,
            messaging_address: record.address,
            messaging_public_key: public,
            publication_message: record.msg,
            publication_signature: record.signature,
            enrollment_phrase: record.ph,
            enrollment_phrase_signature: record.phs,
        })
    }
}

/// Registry client with an in-process cache
pub struct Registry {
    server: Arc<dyn KeyServer>,
    style: SigningStyle,
    cache: Mutex<HashMap<Address, RegistryEntry>>,
}

impl Registry {
    /// Create a client over a key server
    pub fn new(server: Arc<dyn KeyServer>, style: SigningStyle) -> Self {
        Registry {
            server,
            style,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a wallet's messaging identity
    ///
    /// `None` means "peer not enrolled": absent record, invalid record,
    /// or unreachable registry all collapse to it.
    pub async fn lookup(&self, wallet: &Address) -> Option<RegistryEntry> {
        if let Some(entry) = self.cache.lock().expect("registry cache lock").get(wallet) {
            return Some(entry.clone());
        }

        let record = match self.server.fetch_account(wallet).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(%wallet, "no registry record");
                return None;
            }
            Err(err) => {
                warn!(%wallet, %err, "registry lookup failed");
                return None;
            }
        };

        let entry = RegistryEntry::from_record(*wallet, record, self.style)?;
        self.cache
            .lock()
            .expect("registry cache lock")
            .insert(*wallet, entry.clone());
        Some(entry)
    }

    /// Publish a record under a wallet address
    ///
    /// On success the validated entry is primed into the cache.
    pub async fn publish(&self, wallet: &Address, record: &AccountRecord) -> TransportResult<()> {
        self.server.publish_account(wallet, record).await?;
        if let Some(entry) = RegistryEntry::from_record(*wallet, record.clone(), self.style) {
            self.cache
                .lock()
                .expect("registry cache lock")
                .insert(*wallet, entry);
        }
        Ok(())
    }

    /// Drop every cached entry
    pub fn clear(&self) {
        self.cache.lock().expect("registry cache lock").clear();
    }
}

//! The conversation engine
//!
//! [`Messenger`] ties the layers together: it drives the enrollment
//! ceremony against the wallet signer, publishes and resolves registry
//! identities, seeds rooms with wrapped keys, seals and posts messages,
//! and keeps room logs reconciled through the ingestor.
//!
//! # Lifecycle
//!
//! ```text
//! Unbound --set_account--> Bound --enable--> Enrolled
//!     --publish_binding/init_messaging--> Published --load_rooms--> Ready
//! ```
//!
//! All engine state lives behind one async mutex; network and signing
//! calls suspend without the lock so an account switch can always
//! proceed. `set_account` is the cancellation point: it bumps an epoch
//! counter, and suspended operations re-check the epoch before applying
//! their results.

pub mod ingest;
pub mod status;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::codec::{
    self, current_millis, DecryptedMessage, Envelope, Message, MessageOutcome, OutboundMessage,
    OutOfBandEnvelope, SealedEnvelope, SealedRecord,
};
use crate::crypto::{hash::personal_digest, Address, MessagingPublicKey};
use crate::error::{EngineError, EngineResult};
use crate::identity::{
    AccountBinding, PrecomputedEnrollment, SigningStyle, WalletSigner, ENROLLMENT_PHRASE,
    PUBLICATION_PREFIX,
};
use crate::registry::Registry;
use crate::room::{Room, RoomId};
use crate::storage::{
    enrollment_phrase_key, messaging_key_key, publication_message_key, publication_signature_key,
    subscription_start_key, KeyValueStore, SecretVault,
};
use crate::transport::{KeyServer, LogEntry};
use self::status::{ReadStatus, StatusStore};

/// Default cap on concurrent bulk log fetches
pub const DEFAULT_BULK_FETCH_LIMIT: usize = 25;

/// Default delay before a dropped stream is re-established
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Default ceiling on waiting for a room's key handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 256;

/// Where the engine is in its identity lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// No wallet address set
    Unbound,
    /// Wallet address set, no messaging key
    Bound,
    /// Messaging key derived and cached locally
    Enrolled,
    /// Enrollment and publication present on the registry
    Published,
    /// Rooms loaded and live feed subscribed
    Ready,
}

/// Events the engine emits as it progresses
///
/// Delivered over a broadcast channel per engine instance; a lagging
/// subscriber may miss events and should replay room state instead of
/// relying on completeness.
#[derive(Clone, Debug)]
pub enum Event {
    /// A wallet account was bound
    AccountChanged {
        /// The newly bound wallet
        wallet: Address,
    },
    /// The enrollment signature produced a messaging identity
    EnrollmentSigned {
        /// The derived messaging address
        messaging_address: Address,
    },
    /// Local and server identity state were reconciled
    Initialized,
    /// Rooms are loaded and the live feed is up
    Ready,
    /// A message decrypted and validated
    Message(DecryptedMessage),
    /// A payload arrived that no room key opens yet
    Undecryptable(SealedRecord),
}

/// Construction-time configuration for [`Messenger`]
pub struct MessengerConfig {
    /// The key server to talk to
    pub server: Arc<dyn KeyServer>,
    /// The wallet that signs for this engine
    pub signer: Arc<dyn WalletSigner>,
    /// How the wallet hashes messages before signing
    pub signing_style: SigningStyle,
    /// Secret stores in priority order; secrets belong in the most
    /// ephemeral store the deployment offers
    pub secret_stores: Vec<Arc<dyn KeyValueStore>>,
    /// Durable store for the read/unread map
    pub durable_store: Arc<dyn KeyValueStore>,
    /// Phrase whose signature seeds the messaging key
    pub enrollment_phrase: String,
    /// Prefix of the publication message
    pub publication_prefix: String,
    /// Delay before a dropped stream is re-established
    pub reconnect_delay: Duration,
    /// Ceiling on waiting for a room's key handshake
    pub handshake_timeout: Duration,
    /// Cap on concurrent bulk log fetches
    pub bulk_fetch_limit: usize,
}

impl MessengerConfig {
    /// Configuration with defaults over a server, signer and stores
    pub fn new(
        server: Arc<dyn KeyServer>,
        signer: Arc<dyn WalletSigner>,
        secret_stores: Vec<Arc<dyn KeyValueStore>>,
        durable_store: Arc<dyn KeyValueStore>,
    ) -> Self {
        MessengerConfig {
            server,
            signer,
            signing_style: SigningStyle::Personal,
            secret_stores,
            durable_store,
            enrollment_phrase: ENROLLMENT_PHRASE.to_string(),
            publication_prefix: PUBLICATION_PREFIX.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            bulk_fetch_limit: DEFAULT_BULK_FETCH_LIMIT,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) server: Arc<dyn KeyServer>,
    pub(crate) signer: Arc<dyn WalletSigner>,
    pub(crate) registry: Registry,
    pub(crate) vault: SecretVault,
    pub(crate) durable: Arc<dyn KeyValueStore>,
    pub(crate) enrollment_phrase: String,
    pub(crate) publication_prefix: String,
    pub(crate) reconnect_delay: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) bulk_permits: Arc<Semaphore>,
    pub(crate) send_busy: AtomicBool,
    pub(crate) events: broadcast::Sender<Event>,
    pub(crate) state: Mutex<State>,
}

pub(crate) struct State {
    pub(crate) epoch: u64,
    pub(crate) phase: Phase,
    pub(crate) wallet: Option<Address>,
    pub(crate) binding: Option<AccountBinding>,
    pub(crate) rooms: HashMap<RoomId, Room>,
    pub(crate) emitted: HashSet<String>,
    pub(crate) emitted_sealed: HashSet<String>,
    pub(crate) statuses: Option<StatusStore>,
    pub(crate) ingest_task: Option<JoinHandle<()>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

/// Releases the send slot when the send completes or fails
struct SendSlot<'a>(&'a AtomicBool);

impl Drop for SendSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The conversation engine
pub struct Messenger {
    shared: Arc<Shared>,
}

impl Messenger {
    /// Build an engine from configuration
    ///
    /// Fails fast on unusable configuration; nothing touches the network
    /// until the lifecycle methods run.
    pub fn new(config: MessengerConfig) -> EngineResult<Self> {
        let vault = SecretVault::new(config.secret_stores).ok_or_else(|| {
            EngineError::Configuration("at least one secret store is required".to_string())
        })?;
        if config.bulk_fetch_limit == 0 {
            return Err(EngineError::Configuration(
                "bulk fetch limit must be at least 1".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Registry::new(config.server.clone(), config.signing_style);

        Ok(Messenger {
            shared: Arc::new(Shared {
                server: config.server,
                signer: config.signer,
                registry,
                vault,
                durable: config.durable_store,
                enrollment_phrase: config.enrollment_phrase,
                publication_prefix: config.publication_prefix,
                reconnect_delay: config.reconnect_delay,
                handshake_timeout: config.handshake_timeout,
                bulk_permits: Arc::new(Semaphore::new(config.bulk_fetch_limit)),
                send_busy: AtomicBool::new(false),
                events,
                state: Mutex::new(State {
                    epoch: 0,
                    phase: Phase::Unbound,
                    wallet: None,
                    binding: None,
                    rooms: HashMap::new(),
                    emitted: HashSet::new(),
                    emitted_sealed: HashSet::new(),
                    statuses: None,
                    ingest_task: None,
                }),
            }),
        })
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Current lifecycle phase
    pub async fn phase(&self) -> Phase {
        self.shared.state.lock().await.phase
    }

    /// The bound wallet address, if any
    pub async fn wallet(&self) -> Option<Address> {
        self.shared.state.lock().await.wallet
    }

    /// Bind a wallet account, resetting all room state
    ///
    /// This is the cancellation point: the live feed stops, rooms clear,
    /// and any suspended operation started under the previous account
    /// discards its result.
    pub async fn set_account(&self, wallet: &str) -> EngineResult<()> {
        let wallet: Address = wallet
            .parse()
            .map_err(|_| EngineError::InvalidAddress(wallet.to_string()))?;

        let mut state = self.shared.state.lock().await;
        state.epoch += 1;
        if let Some(task) = state.ingest_task.take() {
            task.abort();
        }
        state.rooms.clear();
        state.emitted.clear();
        state.emitted_sealed.clear();
        state.binding = None;
        state.wallet = Some(wallet);
        state.phase = Phase::Bound;
        state.statuses = Some(StatusStore::load(self.shared.durable.clone(), &wallet));
        drop(state);

        info!(%wallet, "account bound");
        self.shared.emit(Event::AccountChanged { wallet });
        Ok(())
    }

    /// Derive the messaging identity, prompting the wallet if no stored
    /// secret exists for this account
    pub async fn enable(&self) -> EngineResult<()> {
        let (wallet, epoch) = {
            let state = self.shared.state.lock().await;
            if state.binding.is_some() {
                return Ok(());
            }
            (state.wallet.ok_or(EngineError::AccountNotSet)?, state.epoch)
        };

        let binding = match self.shared.vault.get(&messaging_key_key(&wallet)) {
            Some(secret_hex) => {
                let phrase = self
                    .shared
                    .vault
                    .get(&enrollment_phrase_key(&wallet))
                    .unwrap_or_else(|| self.shared.enrollment_phrase.clone());
                AccountBinding::from_stored_secret(wallet, &phrase, &secret_hex)?
            }
            None => {
                let phrase = self.shared.enrollment_phrase.clone();
                let signature = self.shared.signer.sign(&phrase, &wallet).await?;
                let binding =
                    AccountBinding::from_enrollment_signature(wallet, &phrase, &signature)?;

                self.shared.vault.set(
                    &wallet,
                    &messaging_key_key(&wallet),
                    &hex::encode(binding.keypair().secret_bytes()),
                );
                self.shared
                    .vault
                    .set(&wallet, &enrollment_phrase_key(&wallet), &phrase);
                binding
            }
        };

        let messaging_address = binding.messaging_address();
        self.install_binding(epoch, binding).await?;

        info!(%wallet, %messaging_address, "messaging identity enrolled");
        self.shared.emit(Event::EnrollmentSigned { messaging_address });
        Ok(())
    }

    /// Inject an enrollment whose signatures were gathered externally
    ///
    /// Takes the same path as [`enable`](Self::enable) plus, when the
    /// publication signature is present, the local half of
    /// [`publish_binding`](Self::publish_binding).
    pub async fn inject_enrollment(&self, enrollment: PrecomputedEnrollment) -> EngineResult<()> {
        let (wallet, epoch) = {
            let state = self.shared.state.lock().await;
            (state.wallet.ok_or(EngineError::AccountNotSet)?, state.epoch)
        };

        let phrase = self.shared.enrollment_phrase.clone();
        let mut binding = AccountBinding::from_enrollment_signature(
            wallet,
            &phrase,
            &enrollment.enrollment_signature,
        )?;

        self.shared.vault.set(
            &wallet,
            &messaging_key_key(&wallet),
            &hex::encode(binding.keypair().secret_bytes()),
        );
        self.shared
            .vault
            .set(&wallet, &enrollment_phrase_key(&wallet), &phrase);

        if let Some(publication_signature) = enrollment.publication_signature {
            let message = format!("{}{}", self.shared.publication_prefix, binding.messaging_address());
            binding.set_publication(message.clone(), publication_signature.clone());
            self.shared
                .vault
                .set(&wallet, &publication_message_key(&wallet), &message);
            self.shared.vault.set(
                &wallet,
                &publication_signature_key(&wallet),
                &publication_signature,
            );
        }

        let messaging_address = binding.messaging_address();
        self.install_binding(epoch, binding).await?;
        self.shared.emit(Event::EnrollmentSigned { messaging_address });
        Ok(())
    }

    async fn install_binding(&self, epoch: u64, binding: AccountBinding) -> EngineResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.epoch != epoch {
            return Err(EngineError::Superseded);
        }
        state.binding = Some(binding);
        state.phase = state.phase.max(Phase::Enrolled);
        Ok(())
    }

    /// Publish the messaging identity to the registry
    ///
    /// Prompts for the publication signature unless one is cached. A
    /// registry failure leaves the engine Enrolled with the signature
    /// cached locally, so a later retry needs no new prompt.
    pub async fn publish_binding(&self) -> EngineResult<()> {
        let (wallet, epoch, has_publication, expected_message) = {
            let state = self.shared.state.lock().await;
            let binding = state.binding.as_ref().ok_or(EngineError::NotEnrolled)?;
            (
                binding.wallet_address(),
                state.epoch,
                binding.has_publication(),
                format!(
                    "{}{}",
                    self.shared.publication_prefix,
                    binding.messaging_address()
                ),
            )
        };

        if !has_publication {
            let cached_message = self.shared.vault.get(&publication_message_key(&wallet));
            let cached_signature = self.shared.vault.get(&publication_signature_key(&wallet));

            let (message, signature) = match (cached_message, cached_signature) {
                (Some(message), Some(signature)) if message == expected_message => {
                    (message, signature)
                }
                _ => {
                    let signature = self
                        .shared
                        .signer
                        .sign(&expected_message, &wallet)
                        .await?;
                    (expected_message.clone(), signature)
                }
            };

            self.shared
                .vault
                .set(&wallet, &publication_message_key(&wallet), &message);
            self.shared
                .vault
                .set(&wallet, &publication_signature_key(&wallet), &signature);

            let mut state = self.shared.state.lock().await;
            if state.epoch != epoch {
                return Err(EngineError::Superseded);
            }
            let binding = state.binding.as_mut().ok_or(EngineError::NotEnrolled)?;
            binding.set_publication(message, signature);
        }

        let record = {
            let state = self.shared.state.lock().await;
            let binding = state.binding.as_ref().ok_or(EngineError::NotEnrolled)?;
            binding
                .to_account_record()?
                .ok_or(EngineError::NotEnrolled)?
        };

        self.shared
            .registry
            .publish(&wallet, &record)
            .await
            .map_err(|err| {
                warn!(%wallet, %err, "registry publish failed; staying enrolled");
                EngineError::RegistryUnavailable(err.to_string())
            })?;

        let mut state = self.shared.state.lock().await;
        if state.epoch != epoch {
            return Err(EngineError::Superseded);
        }
        state.phase = state.phase.max(Phase::Published);
        info!(%wallet, "messaging identity published");
        Ok(())
    }

    /// Reconcile local and server identity state
    ///
    /// Adopts the server's publication proof when it matches the locally
    /// derived messaging address; republishes otherwise.
    pub async fn init_messaging(&self) -> EngineResult<()> {
        {
            let state = self.shared.state.lock().await;
            state.wallet.ok_or(EngineError::AccountNotSet)?;
        }
        self.enable().await?;

        let (wallet, epoch, messaging_address) = {
            let state = self.shared.state.lock().await;
            let binding = state.binding.as_ref().ok_or(EngineError::NotEnrolled)?;
            (
                binding.wallet_address(),
                state.epoch,
                binding.messaging_address(),
            )
        };

        match self.shared.registry.lookup(&wallet).await {
            Some(entry) if entry.messaging_address == messaging_address => {
                self.shared.vault.set(
                    &wallet,
                    &publication_message_key(&wallet),
                    &entry.publication_message,
                );
                self.shared.vault.set(
                    &wallet,
                    &publication_signature_key(&wallet),
                    &entry.publication_signature,
                );

                let mut state = self.shared.state.lock().await;
                if state.epoch != epoch {
                    return Err(EngineError::Superseded);
                }
                let binding = state.binding.as_mut().ok_or(EngineError::NotEnrolled)?;
                binding.set_publication(entry.publication_message, entry.publication_signature);
                state.phase = state.phase.max(Phase::Published);
                debug!(%wallet, "adopted registry publication");
            }
            _ => {
                self.publish_binding().await?;
            }
        }

        self.shared.emit(Event::Initialized);
        Ok(())
    }

    /// Load every room this wallet participates in and go live
    pub async fn load_rooms(&self) -> EngineResult<()> {
        let (wallet, epoch) = {
            let state = self.shared.state.lock().await;
            if state.phase < Phase::Published {
                return Err(EngineError::Configuration(
                    "load_rooms requires a published identity".to_string(),
                ));
            }
            (state.wallet.ok_or(EngineError::AccountNotSet)?, state.epoch)
        };

        let heads = self.shared.server.conversations(&wallet).await?;
        {
            let mut state = self.shared.state.lock().await;
            if state.epoch != epoch {
                return Err(EngineError::Superseded);
            }
            for head in &heads {
                state
                    .rooms
                    .entry(head.id.clone())
                    .or_insert_with(|| Room::new(head.id.clone()));
            }
        }

        futures_util::future::join_all(
            heads
                .iter()
                .map(|head| ingest::bulk_load(&self.shared, epoch, &head.id)),
        )
        .await;

        let start_key = subscription_start_key(&wallet);
        if self.shared.durable.get(&start_key).is_none() {
            self.shared
                .durable
                .set(&start_key, &current_millis().to_string());
        }

        let feed = self.shared.server.subscribe(&wallet).await?;
        let task = tokio::spawn(ingest::run(self.shared.clone(), epoch, wallet, feed));

        let mut state = self.shared.state.lock().await;
        if state.epoch != epoch {
            task.abort();
            return Err(EngineError::Superseded);
        }
        if let Some(old) = state.ingest_task.replace(task) {
            old.abort();
        }
        state.phase = Phase::Ready;
        drop(state);

        info!(%wallet, rooms = heads.len(), "rooms loaded, live feed up");
        self.shared.emit(Event::Ready);
        Ok(())
    }

    /// Open (or confirm) a conversation with a remote wallet
    ///
    /// Returns `false` without posting anything when the remote has no
    /// registry entry. Otherwise guarantees the room has at least one
    /// key: either one recovered from the server log or a fresh one
    /// announced at the next log index.
    pub async fn start_conversation(&self, remote: &str) -> EngineResult<bool> {
        let remote: Address = remote
            .parse()
            .map_err(|_| EngineError::InvalidAddress(remote.to_string()))?;

        let (wallet, epoch) = {
            let state = self.shared.state.lock().await;
            let binding = state.binding.as_ref().ok_or(EngineError::NotEnrolled)?;
            (binding.wallet_address(), state.epoch)
        };
        if remote == wallet {
            return Err(EngineError::InvalidAddress(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let room = RoomId::between(&wallet, &remote);
        self.ensure_room_keys(&room, epoch).await
    }

    /// Seed a room with keys, announcing a fresh one if none exist
    async fn ensure_room_keys(&self, room: &RoomId, epoch: u64) -> EngineResult<bool> {
        if self.room_has_keys(room).await {
            return Ok(true);
        }

        // The log may already hold an announcement addressed to us
        ingest::bulk_load(&self.shared, epoch, room).await;
        if self.room_has_keys(room).await {
            return Ok(true);
        }

        let (wallet, keypair) = {
            let state = self.shared.state.lock().await;
            if state.epoch != epoch {
                return Err(EngineError::Superseded);
            }
            let binding = state.binding.as_ref().ok_or(EngineError::NotEnrolled)?;
            (binding.wallet_address(), binding.keypair().clone())
        };

        // Wrap the fresh key for every participant, ourselves included
        let mut recipients: Vec<(Address, MessagingPublicKey)> = vec![(wallet, *keypair.public_key())];
        for participant in room.participants() {
            if participant == wallet {
                continue;
            }
            match self.shared.registry.lookup(&participant).await {
                Some(entry) => recipients.push((participant, entry.messaging_public_key)),
                None => {
                    debug!(%participant, "peer not enrolled; conversation not started");
                    return Ok(false);
                }
            }
        }

        let (announcement, room_key) = codec::encode_key_announcement(wallet, &recipients)?;
        let content = serde_json::to_value(Envelope::Keys(announcement))
            .map_err(|_| EngineError::InvalidMessage)?;

        // One retry: an index conflict means the log moved under us, so
        // resynchronize and either adopt the server's key or repost.
        for attempt in 0..2 {
            let index = {
                let mut state = self.shared.state.lock().await;
                if state.epoch != epoch {
                    return Err(EngineError::Superseded);
                }
                state
                    .rooms
                    .entry(room.clone())
                    .or_insert_with(|| Room::new(room.clone()))
                    .message_count()
            };

            let text = codec::entry_signing_text(room, index, &content);
            let signature = keypair.sign_digest(&personal_digest(&text))?;
            let entry = LogEntry {
                conversation_id: room.clone(),
                conversation_index: index,
                content: content.clone(),
                signature: Some(signature),
            };

            match self.shared.server.append_entry(&entry).await {
                Ok(()) => {
                    let mut state = self.shared.state.lock().await;
                    if state.epoch != epoch {
                        return Err(EngineError::Superseded);
                    }
                    let room_state = state
                        .rooms
                        .entry(room.clone())
                        .or_insert_with(|| Room::new(room.clone()));
                    room_state.add_key(room_key);
                    info!(room = %room, index, "room key announced");
                    return Ok(true);
                }
                Err(crate::transport::TransportError::IndexConflict) if attempt == 0 => {
                    warn!(room = %room, index, "key announcement hit an index conflict; resynchronizing");
                    ingest::bulk_load(&self.shared, epoch, room).await;
                    if self.room_has_keys(room).await {
                        return Ok(true);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::IndexConflict)
    }

    async fn room_has_keys(&self, room: &RoomId) -> bool {
        let state = self.shared.state.lock().await;
        state.rooms.get(room).is_some_and(|r| !r.keys().is_empty())
    }

    /// Send a message to a wallet address or room id
    ///
    /// Returns the posted message's hash, or `None` when the remote is
    /// not enrolled. Only one send may be in flight per engine; a 409
    /// from the server surfaces as [`EngineError::IndexConflict`] and may
    /// be retried once the ingestor advances.
    pub async fn send_message(
        &self,
        target: &str,
        message: OutboundMessage,
    ) -> EngineResult<Option<String>> {
        if self
            .shared
            .send_busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(EngineError::SendBusy);
        }
        let _slot = SendSlot(&self.shared.send_busy);

        let (room, epoch) = self.resolve_target(target).await?;

        if !self.ensure_room_keys(&room, epoch).await? {
            return Ok(None);
        }
        self.wait_for_handshake(&room, epoch).await?;

        let (wallet, keypair, key, index) = {
            let state = self.shared.state.lock().await;
            if state.epoch != epoch {
                return Err(EngineError::Superseded);
            }
            let binding = state.binding.as_ref().ok_or(EngineError::NotEnrolled)?;
            let room_state = state.rooms.get(&room).ok_or(EngineError::RoomNotReady)?;
            let key = *room_state.keys().primary().ok_or(EngineError::RoomNotReady)?;
            (
                binding.wallet_address(),
                binding.keypair().clone(),
                key,
                room_state.message_count(),
            )
        };

        let (envelope, _stamped) = codec::encode_message(wallet, message, &key, current_millis())?;
        let content = serde_json::to_value(Envelope::Msg(envelope))
            .map_err(|_| EngineError::InvalidMessage)?;
        let text = codec::entry_signing_text(&room, index, &content);
        let signature = keypair.sign_digest(&personal_digest(&text))?;

        self.shared
            .server
            .append_entry(&LogEntry {
                conversation_id: room.clone(),
                conversation_index: index,
                content,
                signature: Some(signature),
            })
            .await?;

        debug!(room = %room, index, "message posted");
        Ok(Some(DecryptedMessage::hash_of(&room, index)))
    }

    /// Build a `msg` envelope for out-of-band delivery instead of posting
    ///
    /// The envelope carries a `to` field naming the recipient so the
    /// other side can locate the room. Returns `None` when the remote is
    /// not enrolled.
    pub async fn create_out_of_band_envelope(
        &self,
        remote: &str,
        message: OutboundMessage,
    ) -> EngineResult<Option<OutOfBandEnvelope>> {
        let remote: Address = remote
            .parse()
            .map_err(|_| EngineError::InvalidAddress(remote.to_string()))?;

        let (wallet, epoch) = {
            let state = self.shared.state.lock().await;
            let binding = state.binding.as_ref().ok_or(EngineError::NotEnrolled)?;
            (binding.wallet_address(), state.epoch)
        };
        let room = RoomId::between(&wallet, &remote);

        if !self.ensure_room_keys(&room, epoch).await? {
            return Ok(None);
        }

        let key = {
            let state = self.shared.state.lock().await;
            if state.epoch != epoch {
                return Err(EngineError::Superseded);
            }
            let room_state = state.rooms.get(&room).ok_or(EngineError::RoomNotReady)?;
            *room_state.keys().primary().ok_or(EngineError::RoomNotReady)?
        };

        let (envelope, _stamped) = codec::encode_message(wallet, message, &key, current_millis())?;
        Ok(Some(OutOfBandEnvelope {
            kind: "msg".to_string(),
            address: wallet,
            to: remote,
            iv: envelope.iv,
            ciphertext: envelope.ciphertext,
        }))
    }

    /// Decrypt an envelope received outside the room log
    ///
    /// The remote participant is whichever of `address` and `to` is not
    /// us; the room's keys are pulled from the server log if we do not
    /// hold them yet.
    pub async fn decrypt_out_of_band_envelope(
        &self,
        envelope: &OutOfBandEnvelope,
    ) -> EngineResult<Message> {
        let (wallet, epoch) = {
            let state = self.shared.state.lock().await;
            (state.wallet.ok_or(EngineError::AccountNotSet)?, state.epoch)
        };

        let remote = if envelope.address == wallet {
            envelope.to
        } else {
            envelope.address
        };
        let room = RoomId::between(&wallet, &remote);

        if !self.room_has_keys(&room).await {
            ingest::bulk_load(&self.shared, epoch, &room).await;
        }

        let keys = {
            let state = self.shared.state.lock().await;
            state
                .rooms
                .get(&room)
                .map(|r| r.keys().clone())
                .unwrap_or_default()
        };

        let sealed = SealedEnvelope {
            address: envelope.address,
            iv: envelope.iv.clone(),
            ciphertext: envelope.ciphertext.clone(),
        };
        match codec::decode_message(&sealed, &keys) {
            MessageOutcome::Decrypted(message) => Ok(message),
            MessageOutcome::Invalid => Err(EngineError::InvalidMessage),
            MessageOutcome::Undecryptable => Err(EngineError::Undecryptable),
        }
    }

    /// Decrypted messages of a room, ascending by log index
    pub async fn get_messages(&self, target: &str) -> EngineResult<Vec<DecryptedMessage>> {
        let (room, _) = self.resolve_target(target).await?;
        let state = self.shared.state.lock().await;
        Ok(state
            .rooms
            .get(&room)
            .map(|r| r.messages().cloned().collect())
            .unwrap_or_default())
    }

    /// One past the highest known log index of a room
    pub async fn get_message_count(&self, target: &str) -> EngineResult<u64> {
        let (room, _) = self.resolve_target(target).await?;
        let state = self.shared.state.lock().await;
        Ok(state.rooms.get(&room).map_or(0, Room::message_count))
    }

    /// Rooms known to this engine, sorted by identifier
    pub async fn conversations(&self) -> Vec<RoomId> {
        let state = self.shared.state.lock().await;
        let mut rooms: Vec<RoomId> = state.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Read/unread status of a message hash; unknown hashes are unread
    pub async fn message_status(&self, hash: &str) -> EngineResult<ReadStatus> {
        let state = self.shared.state.lock().await;
        let statuses = state.statuses.as_ref().ok_or(EngineError::AccountNotSet)?;
        Ok(statuses.status_of(hash))
    }

    /// Mark a message read
    pub async fn mark_read(&self, hash: &str) -> EngineResult<()> {
        let mut state = self.shared.state.lock().await;
        let statuses = state.statuses.as_mut().ok_or(EngineError::AccountNotSet)?;
        statuses.mark_read(hash);
        Ok(())
    }

    /// Mark a message unread
    pub async fn mark_unread(&self, hash: &str) -> EngineResult<()> {
        let mut state = self.shared.state.lock().await;
        let statuses = state.statuses.as_mut().ok_or(EngineError::AccountNotSet)?;
        statuses.mark_unread(hash);
        Ok(())
    }

    /// Resolve a wallet address or room id string to a room
    async fn resolve_target(&self, target: &str) -> EngineResult<(RoomId, u64)> {
        let state = self.shared.state.lock().await;
        let wallet = state.wallet.ok_or(EngineError::AccountNotSet)?;
        let epoch = state.epoch;
        drop(state);

        if RoomId::is_room_reference(target) {
            let room: RoomId = target
                .parse()
                .map_err(|_| EngineError::InvalidAddress(target.to_string()))?;
            if !room.participants().contains(&wallet) {
                return Err(EngineError::InvalidAddress(format!(
                    "room {room} does not include the bound wallet"
                )));
            }
            Ok((room, epoch))
        } else {
            let remote: Address = target
                .parse()
                .map_err(|_| EngineError::InvalidAddress(target.to_string()))?;
            if remote == wallet {
                return Err(EngineError::InvalidAddress(
                    "cannot message yourself".to_string(),
                ));
            }
            Ok((RoomId::between(&wallet, &remote), epoch))
        }
    }

    /// Wait until a room holds a key and its announcement is ingested
    async fn wait_for_handshake(&self, room: &RoomId, epoch: u64) -> EngineResult<()> {
        let deadline = Instant::now() + self.shared.handshake_timeout;
        let mut next_reload = Instant::now() + Duration::from_millis(250);

        loop {
            {
                let state = self.shared.state.lock().await;
                if state.epoch != epoch {
                    return Err(EngineError::Superseded);
                }
                if let Some(room_state) = state.rooms.get(room) {
                    if room_state.message_count() > 0 && !room_state.keys().is_empty() {
                        return Ok(());
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(EngineError::RoomNotReady);
            }
            if Instant::now() >= next_reload {
                ingest::bulk_load(&self.shared, epoch, room).await;
                next_reload = Instant::now() + Duration::from_millis(250);
            }
            sleep(Duration::from_millis(25)).await;
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        if let Ok(state) = self.shared.state.try_lock() {
            if let Some(task) = &state.ingest_task {
                task.abort();
            }
        }
    }
}

//! # Parlor
//!
//! Client engine for end-to-end encrypted, room-oriented messaging over
//! wallet identities.
//!
//! ## Features
//!
//! - **Signature-derived identity**: a deterministic two-signature
//!   ceremony turns any wallet into a messaging identity, no key upload
//! - **Encrypted rooms** with per-room symmetric keys wrapped via ECIES
//!   for each participant
//! - **Ordered log ingestion** reconciling bulk fetches with a live
//!   stream, including gap detection and reconnect
//! - **Pluggable key server and storage** so tests and deployments swap
//!   transports without touching the engine
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parlor::{
//!     LocalSigner, MemoryStore, Messenger, MessengerConfig, OutboundMessage, SigningStyle,
//!     transport::HttpKeyServer,
//! };
//!
//! # async fn run() -> Result<(), parlor::EngineError> {
//! let signer = Arc::new(LocalSigner::random(SigningStyle::Personal));
//! let wallet = signer.address().to_string();
//!
//! let config = MessengerConfig::new(
//!     Arc::new(HttpKeyServer::new("https://keys.example.org")?),
//!     signer,
//!     vec![Arc::new(MemoryStore::new())],
//!     Arc::new(MemoryStore::new()),
//! );
//! let messenger = Messenger::new(config)?;
//!
//! messenger.set_account(&wallet).await?;
//! messenger.init_messaging().await?;
//! messenger.load_rooms().await?;
//!
//! messenger
//!     .send_message("0x89205A3A3b2A69De6Dbf7f01ED13B2108B2c43e7", OutboundMessage::text("hi"))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             CONVERSATION ENGINE             │
//! │  Lifecycle | Send | Ingest | Status         │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │              PROTOCOL LAYER                 │
//! │  Identity | Registry | Rooms | Codec        │
//! └─────────────────────┬───────────────────────┘
//! ┌─────────────────────▼───────────────────────┐
//! │               CRYPTO LAYER                  │
//! │  secp256k1 | ECIES | AES-CBC | Keccak-256   │
//! └─────────────────────┬───────────────────────┘
//! ┌─────────────────────▼───────────────────────┐
//! │             TRANSPORT LAYER                 │
//! │   HTTP + WebSocket | In-memory | Future     │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod registry;
pub mod room;
pub mod storage;
pub mod transport;

// Re-export main types at crate root
pub use codec::{DecryptedMessage, Message, OutboundMessage, OutOfBandEnvelope, SealedRecord};
pub use crypto::{Address, CryptoError, CryptoResult};
pub use engine::{
    status::ReadStatus, Event, Messenger, MessengerConfig, Phase,
};
pub use error::{EngineError, EngineResult};
pub use identity::{
    AccountBinding, LocalSigner, PrecomputedEnrollment, SignerError, SigningStyle, WalletSigner,
};
pub use registry::RegistryEntry;
pub use room::RoomId;
pub use storage::{KeyValueStore, MemoryStore};

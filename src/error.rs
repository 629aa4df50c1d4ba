//! Engine-level error taxonomy
//!
//! Faults are split by how the caller should react: `UserDenied` aborts
//! the current lifecycle transition, `IndexConflict` and `SendBusy` are
//! transient and retryable, `RegistryUnavailable` degrades discovery
//! without tearing down local state, and `Configuration` /
//! `InvalidAddress` are caller bugs surfaced synchronously.

use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::CryptoError;
use crate::identity::SignerError;
use crate::transport::TransportError;

/// Errors surfaced by the messaging engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The wallet refused to produce a signature
    #[error("Wallet declined to sign")]
    UserDenied,

    /// The wallet signer failed for a reason other than refusal
    #[error("Wallet signer failed: {0}")]
    Signer(String),

    /// The registry could not be reached or rejected the publish
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The server already has an entry at the posted log index
    #[error("Log index conflict; retry once the room catches up")]
    IndexConflict,

    /// Another send is already in flight on this engine
    #[error("A send is already in flight")]
    SendBusy,

    /// A caller-supplied wallet address failed validation
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// An outgoing message failed schema validation
    #[error("Message failed schema validation")]
    InvalidMessage,

    /// No known room key opens this payload
    #[error("Payload is not decryptable with any room key")]
    Undecryptable,

    /// The engine was constructed or called with unusable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation needing a bound wallet ran before `set_account`
    #[error("No wallet account is set")]
    AccountNotSet,

    /// An operation needing a messaging identity ran before enrollment
    #[error("Messaging identity is not enrolled")]
    NotEnrolled,

    /// A room did not finish its key handshake in time
    #[error("Timed out waiting for the room key handshake")]
    RoomNotReady,

    /// The account was switched while this operation was in flight
    #[error("Superseded by an account switch")]
    Superseded,

    /// A transport failure that is not an index conflict
    #[error("Transport failure: {0}")]
    Transport(TransportError),

    /// A cryptographic failure bubbled up from the primitives
    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::IndexConflict => EngineError::IndexConflict,
            other => EngineError::Transport(other),
        }
    }
}

impl From<CodecError> for EngineError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InvalidMessage => EngineError::InvalidMessage,
            CodecError::Crypto(inner) => EngineError::Crypto(inner),
        }
    }
}

impl From<SignerError> for EngineError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::Denied => EngineError::UserDenied,
            SignerError::Unavailable(msg) => EngineError::Signer(msg),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

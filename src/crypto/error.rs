//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// The provided signature is malformed or has an invalid length
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signature recovery produced no usable public key
    #[error("Signature recovery failed")]
    RecoveryFailed,

    /// The public key format is invalid
    #[error("Invalid public key format")]
    InvalidPublicKey,

    /// The secret key is not a valid curve scalar
    #[error("Invalid secret key format")]
    InvalidSecretKey,

    /// Decryption failed - wrong key, corrupt data, or integrity tag mismatch
    #[error("Decryption failed")]
    DecryptionFailed,

    /// An ECIES blob is too short or structurally invalid
    #[error("Invalid wrapped-key blob")]
    InvalidWrappedKey,

    /// The address string is not a valid 20-byte hex address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

//! Cryptographic primitives for parlor
//!
//! This module provides all the cryptographic building blocks:
//! - `keys`: secp256k1 keypairs, addresses and recoverable signatures
//! - `cipher`: AES-256-CBC text envelopes with an embedded integrity tag
//! - `ecies`: ECIES key wrap for handing room keys to participants
//! - `hash`: Keccak-256, address checksums and signing digests

pub mod cipher;
pub mod ecies;
pub mod error;
pub mod hash;
pub mod keys;

// Re-export commonly used types
pub use cipher::{Cipher, SealedText};
pub use ecies::{unwrap_key, wrap_key};
pub use error::{CryptoError, CryptoResult};
pub use keys::{recover_address, Address, MessagingKeypair, MessagingPublicKey};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_room_key_handoff_flow() {
        // The initiator mints a room key and wraps it for a peer
        let peer = MessagingKeypair::generate();
        let room_key = random_bytes::<32>();

        let blob = wrap_key(peer.public_key(), &room_key).unwrap();

        // The peer unwraps it and both sides can exchange sealed text
        let recovered = unwrap_key(peer.secret_bytes(), &blob).unwrap();
        let mut key = [0u8; 32];
        key.copy_from_slice(&recovered);

        let sealed = Cipher::seal(&room_key, "first message");
        assert_eq!(
            Cipher::open(&key, &sealed.iv, &sealed.ciphertext).unwrap(),
            "first message"
        );
    }

    #[test]
    fn test_signature_derived_identity_flow() {
        // A wallet signature deterministically yields a messaging identity
        let wallet = MessagingKeypair::generate();
        let digest = hash::personal_digest("I am ready to start messaging on Origin.");
        let signature = wallet.sign_digest(&digest).unwrap();

        let raw = keys::decode_signature_hex(&signature).unwrap();
        let id1 = MessagingKeypair::from_signature(&raw).unwrap();
        let id2 = MessagingKeypair::from_signature(&raw).unwrap();

        assert_eq!(id1.address(), id2.address());
        assert_ne!(id1.address(), wallet.address());
    }
}

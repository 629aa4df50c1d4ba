//! Keccak-256 hashing, address checksums and the short integrity tag
//!
//! Deterministic helper material for the rest of the crypto layer:
//! Keccak-256 (addresses, signing digests), the EIP-55 mixed-case address
//! checksum, the prefixed personal-sign digest, and the 6-character SHA-1
//! tag embedded in symmetric envelopes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::Sha1;
use sha3::{Digest, Keccak256};

/// Size of a Keccak-256 output in bytes
pub const HASH_SIZE: usize = 32;

/// Number of base64 characters in the embedded integrity tag
pub const SHORT_TAG_LEN: usize = 6;

/// Compute Keccak-256 of data
pub fn keccak256(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest of a message signed in `personal_sign` style
///
/// The wallet prepends `"\x19Ethereum Signed Message:\n" + len` before
/// hashing, which prevents a signing prompt from doubling as a valid
/// transaction signature.
pub fn personal_digest(message: &str) -> [u8; HASH_SIZE] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// Digest of a message signed in raw style (no prefix)
pub fn raw_digest(message: &str) -> [u8; HASH_SIZE] {
    keccak256(message.as_bytes())
}

/// Apply the EIP-55 mixed-case checksum to a 20-byte address
///
/// Returns the 40 hex characters without the `0x` prefix. A nibble is
/// uppercased when the corresponding nibble of `keccak256(lowercase_hex)`
/// is 8 or above.
pub fn checksum_hex(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let digest = keccak256(lower.as_bytes());

    lower
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let nibble = if i % 2 == 0 {
                digest[i / 2] >> 4
            } else {
                digest[i / 2] & 0x0f
            };
            if nibble >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

/// First 6 base64 characters of SHA-1 over the plaintext
///
/// This is a key-discrimination check, not a MAC. It lets a decryptor
/// holding several candidate room keys tell which one produced sensible
/// plaintext; authenticity comes from the log-entry signature.
pub fn short_tag(plaintext: &str) -> String {
    let digest = Sha1::digest(plaintext.as_bytes());
    let mut tag = BASE64.encode(digest);
    tag.truncate(SHORT_TAG_LEN);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_deterministic() {
        let h1 = keccak256(b"room log");
        let h2 = keccak256(b"room log");
        assert_eq!(h1, h2);
        assert_ne!(h1, keccak256(b"room log!"));
    }

    #[test]
    fn test_keccak_known_vector() {
        // keccak256("") is a fixed constant
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_personal_digest_differs_from_raw() {
        assert_ne!(personal_digest("hello"), raw_digest("hello"));
    }

    #[test]
    fn test_checksum_known_vector() {
        // EIP-55 reference vector
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&hex::decode("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap());
        assert_eq!(checksum_hex(&addr), "5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");
    }

    #[test]
    fn test_short_tag_length_and_stability() {
        let tag = short_tag("hello world");
        assert_eq!(tag.len(), SHORT_TAG_LEN);
        assert_eq!(tag, short_tag("hello world"));
        assert_ne!(tag, short_tag("hello worlds"));
    }
}

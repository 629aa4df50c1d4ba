//! ECIES key wrap over secp256k1
//!
//! Room keys are handed to each participant wrapped under their messaging
//! public key. The profile is the classic ECIES construction: ephemeral
//! ECDH on secp256k1, SHA-512 of the shared X coordinate split into an
//! AES-256-CBC key and an HMAC-SHA-256 key, and a self-contained blob
//!
//! ```text
//! iv (16) || ephemeral public key, SEC1 uncompressed (65) || mac (32) || ciphertext
//! ```
//!
//! carried as hex inside `keys` envelopes.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

use super::error::{CryptoError, CryptoResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<sha2::Sha256>;

const IV_LEN: usize = 16;
const EPHEMERAL_LEN: usize = 65;
const MAC_LEN: usize = 32;

/// Smallest structurally valid blob: header plus one AES block
pub const MIN_BLOB_LEN: usize = IV_LEN + EPHEMERAL_LEN + MAC_LEN + 16;

use super::keys::MessagingPublicKey;

/// Wrap a secret for the holder of `recipient`
pub fn wrap_key(recipient: &MessagingPublicKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let recipient_point = PublicKey::from_sec1_bytes(&recipient.sec1_bytes())
        .map_err(|_| CryptoError::InvalidPublicKey)?;

    let ephemeral = SecretKey::random(&mut OsRng);
    let ephemeral_pub = ephemeral.public_key().to_encoded_point(false);

    let shared = k256::ecdh::diffie_hellman(
        ephemeral.to_nonzero_scalar(),
        recipient_point.as_affine(),
    );
    let (enc_key, mac_key) = derive_keys(shared.raw_secret_bytes());

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(&enc_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut mac = HmacSha256::new_from_slice(&mac_key).map_err(|_| CryptoError::InvalidSecretKey)?;
    mac.update(&iv);
    mac.update(ephemeral_pub.as_bytes());
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut blob = Vec::with_capacity(IV_LEN + EPHEMERAL_LEN + MAC_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(ephemeral_pub.as_bytes());
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Unwrap a blob with the recipient's 32-byte secret key
///
/// Structural problems yield [`CryptoError::InvalidWrappedKey`]; a failed
/// MAC or padding check yields [`CryptoError::DecryptionFailed`]. The
/// latter is routine when scanning a `keys` envelope for the entry
/// addressed to us.
pub fn unwrap_key(secret: &[u8; 32], blob: &[u8]) -> CryptoResult<Vec<u8>> {
    if blob.len() < MIN_BLOB_LEN {
        return Err(CryptoError::InvalidWrappedKey);
    }

    let iv = &blob[..IV_LEN];
    let ephemeral_raw = &blob[IV_LEN..IV_LEN + EPHEMERAL_LEN];
    let tag = &blob[IV_LEN + EPHEMERAL_LEN..IV_LEN + EPHEMERAL_LEN + MAC_LEN];
    let ciphertext = &blob[IV_LEN + EPHEMERAL_LEN + MAC_LEN..];

    let ephemeral =
        PublicKey::from_sec1_bytes(ephemeral_raw).map_err(|_| CryptoError::InvalidWrappedKey)?;
    let own = SecretKey::from_slice(secret).map_err(|_| CryptoError::InvalidSecretKey)?;

    let shared = k256::ecdh::diffie_hellman(own.to_nonzero_scalar(), ephemeral.as_affine());
    let (enc_key, mac_key) = derive_keys(shared.raw_secret_bytes());

    let mut mac = HmacSha256::new_from_slice(&mac_key).map_err(|_| CryptoError::InvalidSecretKey)?;
    mac.update(iv);
    mac.update(ephemeral_raw);
    mac.update(ciphertext);
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut iv_arr = [0u8; IV_LEN];
    iv_arr.copy_from_slice(iv);

    Aes256CbcDec::new(&enc_key.into(), (&iv_arr).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// SHA-512 of the shared X coordinate, split into cipher and MAC keys
fn derive_keys(shared_x: impl AsRef<[u8]>) -> ([u8; 32], [u8; 32]) {
    let digest = Sha512::digest(shared_x.as_ref());
    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&digest[..32]);
    mac_key.copy_from_slice(&digest[32..]);
    (enc_key, mac_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::MessagingKeypair;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let recipient = MessagingKeypair::generate();
        let secret = [99u8; 32];

        let blob = wrap_key(recipient.public_key(), &secret).unwrap();
        let opened = unwrap_key(recipient.secret_bytes(), &blob).unwrap();
        assert_eq!(opened, secret);
    }

    #[test]
    fn test_blob_is_self_contained_over_hex() {
        let recipient = MessagingKeypair::generate();
        let blob = wrap_key(recipient.public_key(), b"room key material").unwrap();

        let carried = hex::encode(&blob);
        let recovered = hex::decode(carried).unwrap();
        assert_eq!(
            unwrap_key(recipient.secret_bytes(), &recovered).unwrap(),
            b"room key material"
        );
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let intended = MessagingKeypair::generate();
        let other = MessagingKeypair::generate();

        let blob = wrap_key(intended.public_key(), b"not for you").unwrap();
        assert_eq!(
            unwrap_key(other.secret_bytes(), &blob),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_blob_fails() {
        let recipient = MessagingKeypair::generate();
        let mut blob = wrap_key(recipient.public_key(), b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        assert_eq!(
            unwrap_key(recipient.secret_bytes(), &blob),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let recipient = MessagingKeypair::generate();
        let blob = wrap_key(recipient.public_key(), b"payload").unwrap();

        assert_eq!(
            unwrap_key(recipient.secret_bytes(), &blob[..MIN_BLOB_LEN - 1]),
            Err(CryptoError::InvalidWrappedKey)
        );
    }

    #[test]
    fn test_each_wrap_is_unique() {
        // Fresh ephemeral key and IV per wrap
        let recipient = MessagingKeypair::generate();
        let b1 = wrap_key(recipient.public_key(), b"same").unwrap();
        let b2 = wrap_key(recipient.public_key(), b"same").unwrap();
        assert_ne!(b1, b2);
    }
}

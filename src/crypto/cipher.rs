//! AES-256-CBC text envelope with an embedded integrity tag
//!
//! Room messages are UTF-8 strings sealed under a shared symmetric key.
//! Before encryption the first 6 base64 characters of SHA-1(plaintext)
//! are appended; after decryption the tag is re-derived and compared.
//! The tag is not a MAC - it only discriminates among candidate room keys
//! so the decryptor can tell "wrong key" from "valid plaintext".

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use super::error::{CryptoError, CryptoResult};
use super::hash::{short_tag, SHORT_TAG_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Size of the symmetric key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the CBC initialization vector in bytes
pub const IV_SIZE: usize = 16;

/// An encrypted text payload as it travels inside a content envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedText {
    /// Base64-encoded 16-byte IV
    pub iv: String,
    /// Base64-encoded AES-256-CBC ciphertext of `plaintext || tag`
    pub ciphertext: String,
}

/// Symmetric cipher for room message payloads
pub struct Cipher;

impl Cipher {
    /// Seal a plaintext string under a room key with a random IV
    pub fn seal(key: &[u8; KEY_SIZE], plaintext: &str) -> SealedText {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        Self::seal_with_iv(key, &iv, plaintext)
    }

    /// Seal with a caller-supplied IV
    ///
    /// Reusing an IV under the same key leaks plaintext structure; only
    /// use this with IVs that are unique per message.
    pub fn seal_with_iv(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], plaintext: &str) -> SealedText {
        let mut tagged = String::with_capacity(plaintext.len() + SHORT_TAG_LEN);
        tagged.push_str(plaintext);
        tagged.push_str(&short_tag(plaintext));

        let ciphertext =
            Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(tagged.as_bytes());

        SealedText {
            iv: BASE64.encode(iv),
            ciphertext: BASE64.encode(ciphertext),
        }
    }

    /// Open a sealed payload with one candidate key
    ///
    /// Every failure mode - bad base64, bad padding, non-UTF-8 plaintext,
    /// truncated text, tag mismatch - collapses to
    /// [`CryptoError::DecryptionFailed`], meaning "not decryptable with
    /// this key". Callers try their remaining room keys on that error.
    pub fn open(key: &[u8; KEY_SIZE], iv: &str, ciphertext: &str) -> CryptoResult<String> {
        let iv_raw = BASE64.decode(iv).map_err(|_| CryptoError::DecryptionFailed)?;
        if iv_raw.len() != IV_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut iv_arr = [0u8; IV_SIZE];
        iv_arr.copy_from_slice(&iv_raw);

        let ct = BASE64
            .decode(ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let padded = Aes256CbcDec::new(key.into(), (&iv_arr).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ct)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let text = String::from_utf8(padded).map_err(|_| CryptoError::DecryptionFailed)?;

        let char_count = text.chars().count();
        if char_count <= SHORT_TAG_LEN {
            return Err(CryptoError::DecryptionFailed);
        }

        // Split off the last 6 characters on a char boundary; decrypting
        // with the wrong key can yield arbitrary multi-byte sequences.
        let split = text
            .char_indices()
            .nth(char_count - SHORT_TAG_LEN)
            .map(|(i, _)| i)
            .ok_or(CryptoError::DecryptionFailed)?;
        let (body, tag) = text.split_at(split);

        if short_tag(body) != tag {
            return Err(CryptoError::DecryptionFailed);
        }
        Ok(body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [42u8; KEY_SIZE];
        let sealed = Cipher::seal(&key, "hello rooms");
        let opened = Cipher::open(&key, &sealed.iv, &sealed.ciphertext).unwrap();
        assert_eq!(opened, "hello rooms");
    }

    #[test]
    fn test_ciphertext_differs_per_iv() {
        let key = [42u8; KEY_SIZE];
        let s1 = Cipher::seal(&key, "same text");
        let s2 = Cipher::seal(&key, "same text");
        assert_ne!(s1.ciphertext, s2.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = Cipher::seal(&[1u8; KEY_SIZE], "secret");
        let result = Cipher::open(&[2u8; KEY_SIZE], &sealed.iv, &sealed.ciphertext);
        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];
        let sealed = Cipher::seal(&key, "untouched");

        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&sealed.ciphertext)
            .unwrap();
        raw[0] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);

        assert!(Cipher::open(&key, &sealed.iv, &tampered).is_err());
    }

    #[test]
    fn test_deterministic_with_fixed_iv() {
        let key = [42u8; KEY_SIZE];
        let iv = [7u8; IV_SIZE];
        let s1 = Cipher::seal_with_iv(&key, &iv, "stable");
        let s2 = Cipher::seal_with_iv(&key, &iv, "stable");
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_multibyte_plaintext() {
        let key = [42u8; KEY_SIZE];
        let text = "snøhetta ❄ 密室";
        let sealed = Cipher::seal(&key, text);
        assert_eq!(Cipher::open(&key, &sealed.iv, &sealed.ciphertext).unwrap(), text);
    }

    #[test]
    fn test_empty_plaintext_is_not_openable() {
        // An empty body plus tag is exactly 6 chars, below the strict
        // length floor, so it reads as "wrong key". Envelopes always
        // carry a JSON object, never an empty string.
        let key = [3u8; KEY_SIZE];
        let sealed = Cipher::seal(&key, "");
        assert_eq!(
            Cipher::open(&key, &sealed.iv, &sealed.ciphertext),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_bad_base64_fails() {
        let key = [42u8; KEY_SIZE];
        assert!(Cipher::open(&key, "!!!", "also not base64").is_err());
    }
}

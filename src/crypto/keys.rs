//! secp256k1 keys, addresses and recoverable signatures
//!
//! Provides the messaging identity primitives: 20-byte account addresses
//! with EIP-55 checksums, 64-byte uncompressed public keys (SEC1 form with
//! the leading tag byte stripped), and ECDSA signing with public-key
//! recovery so a signer's address can be derived from any signature.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};
use super::hash::{checksum_hex, keccak256};

/// Size of an account address in bytes
pub const ADDRESS_SIZE: usize = 20;

/// Size of a tagless uncompressed public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 64;

/// Size of a secret key in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a recoverable signature in bytes (r || s || v)
pub const SIGNATURE_SIZE: usize = 65;

/// A 20-byte account address
///
/// Displays as `0x` plus 40 hex characters with the EIP-55 mixed-case
/// checksum. Parsing accepts any capitalization but rejects anything that
/// is not exactly 20 bytes of hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: ADDRESS_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; ADDRESS_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Address(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    /// Checksummed string form, `0x`-prefixed
    pub fn to_checksum_string(&self) -> String {
        format!("0x{}", checksum_hex(&self.0))
    }
}

impl std::str::FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> CryptoResult<Self> {
        let body = s
            .strip_prefix("0x")
            .ok_or_else(|| CryptoError::InvalidAddress(s.to_string()))?;
        if body.len() != ADDRESS_SIZE * 2 {
            return Err(CryptoError::InvalidAddress(s.to_string()));
        }
        let bytes = hex::decode(body).map_err(|_| CryptoError::InvalidAddress(s.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_checksum_string())
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.to_checksum_string())
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_checksum_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An uncompressed secp256k1 public key without the leading tag byte
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MessagingPublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl MessagingPublicKey {
    /// Create from raw bytes; accepts the 64-byte tagless form or the
    /// 65-byte SEC1 form with its `0x04` tag
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let body = match bytes.len() {
            PUBLIC_KEY_SIZE => bytes,
            65 if bytes[0] == 0x04 => &bytes[1..],
            _ => {
                return Err(CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_SIZE,
                    actual: bytes.len(),
                })
            }
        };
        let mut arr = [0u8; PUBLIC_KEY_SIZE];
        arr.copy_from_slice(body);
        Ok(MessagingPublicKey(arr))
    }

    /// Get the raw 64 bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// The full 65-byte SEC1 encoding (tag byte restored)
    pub fn sec1_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[0] = 0x04;
        out[1..].copy_from_slice(&self.0);
        out
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string, with or without a `0x` prefix
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let body = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(body).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// The address of this key: last 20 bytes of `keccak256(pubkey)`
    pub fn address(&self) -> Address {
        let digest = keccak256(&self.0);
        let mut addr = [0u8; ADDRESS_SIZE];
        addr.copy_from_slice(&digest[12..]);
        Address(addr)
    }
}

impl std::fmt::Debug for MessagingPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessagingPublicKey({}...)", &self.to_hex()[..16])
    }
}

impl Serialize for MessagingPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MessagingPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A secp256k1 keypair used as a messaging identity
///
/// The secret key is zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct MessagingKeypair {
    secret: [u8; SECRET_KEY_SIZE],
    #[zeroize(skip)]
    public: MessagingPublicKey,
    #[zeroize(skip)]
    address: Address,
}

impl MessagingKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut OsRng);
        Self::from_secret_bytes(&signing.to_bytes()).expect("fresh key is a valid scalar")
    }

    /// Build a keypair from 32 bytes of secret scalar material
    pub fn from_secret_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SECRET_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let sk = k256::SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let point = sk.public_key().to_encoded_point(false);
        let public = MessagingPublicKey::from_bytes(point.as_bytes())?;

        let mut secret = [0u8; SECRET_KEY_SIZE];
        secret.copy_from_slice(bytes);

        Ok(MessagingKeypair {
            secret,
            address: public.address(),
            public,
        })
    }

    /// Derive a keypair from a wallet signature: the secret key is exactly
    /// the first 32 bytes of the 65-byte signature
    ///
    /// Any other derivation breaks compatibility with peers deriving the
    /// same identity from the same wallet.
    pub fn from_signature(signature: &[u8]) -> CryptoResult<Self> {
        if signature.len() < SECRET_KEY_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        Self::from_secret_bytes(&signature[..SECRET_KEY_SIZE])
    }

    /// Get the public key
    pub fn public_key(&self) -> &MessagingPublicKey {
        &self.public
    }

    /// Get the address of this keypair
    pub fn address(&self) -> Address {
        self.address
    }

    /// Get the secret key bytes (for persistence; handle with care)
    pub fn secret_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.secret
    }

    /// Sign a prehashed digest, returning the 65-byte `r || s || v`
    /// signature as a `0x`-prefixed hex string
    pub fn sign_digest(&self, digest: &[u8; 32]) -> CryptoResult<String> {
        let signing =
            SigningKey::from_slice(&self.secret).map_err(|_| CryptoError::InvalidSecretKey)?;
        let (sig, recid) = signing
            .sign_prehash_recoverable(digest)
            .map_err(|_| CryptoError::InvalidSecretKey)?;

        let mut raw = [0u8; SIGNATURE_SIZE];
        raw[..64].copy_from_slice(&sig.to_bytes());
        raw[64] = 27 + recid.to_byte();
        Ok(format!("0x{}", hex::encode(raw)))
    }
}

impl Clone for MessagingKeypair {
    fn clone(&self) -> Self {
        MessagingKeypair {
            secret: self.secret,
            public: self.public,
            address: self.address,
        }
    }
}

impl std::fmt::Debug for MessagingKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessagingKeypair({})", self.address)
    }
}

/// Decode a `0x`-prefixed (or bare) hex signature into its 65 raw bytes
pub fn decode_signature_hex(signature: &str) -> CryptoResult<[u8; SIGNATURE_SIZE]> {
    let body = signature.strip_prefix("0x").unwrap_or(signature);
    let raw = hex::decode(body).map_err(|_| CryptoError::InvalidSignature)?;
    if raw.len() != SIGNATURE_SIZE {
        return Err(CryptoError::InvalidSignature);
    }
    let mut out = [0u8; SIGNATURE_SIZE];
    out.copy_from_slice(&raw);
    Ok(out)
}

/// Recover the signer's address from a recoverable signature over a
/// prehashed digest
pub fn recover_address(digest: &[u8; 32], signature: &str) -> CryptoResult<Address> {
    let raw = decode_signature_hex(signature)?;

    let v = match raw[64] {
        27 | 28 => raw[64] - 27,
        0 | 1 => raw[64],
        _ => return Err(CryptoError::InvalidSignature),
    };
    let recid = RecoveryId::try_from(v).map_err(|_| CryptoError::InvalidSignature)?;
    let sig = Signature::try_from(&raw[..64]).map_err(|_| CryptoError::InvalidSignature)?;

    let vk = VerifyingKey::recover_from_prehash(digest, &sig, recid)
        .map_err(|_| CryptoError::RecoveryFailed)?;
    let public = MessagingPublicKey::from_bytes(vk.to_encoded_point(false).as_bytes())?;
    Ok(public.address())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::personal_digest;

    #[test]
    fn test_keypair_generation() {
        let k1 = MessagingKeypair::generate();
        let k2 = MessagingKeypair::generate();
        assert_ne!(k1.address(), k2.address());
    }

    #[test]
    fn test_deterministic_derivation() {
        let seed = [7u8; 32];
        let k1 = MessagingKeypair::from_secret_bytes(&seed).unwrap();
        let k2 = MessagingKeypair::from_secret_bytes(&seed).unwrap();
        assert_eq!(k1.address(), k2.address());
        assert_eq!(k1.public_key().as_bytes(), k2.public_key().as_bytes());
    }

    #[test]
    fn test_from_signature_takes_first_32_bytes() {
        let mut sig = [0u8; 65];
        sig[..32].copy_from_slice(&[9u8; 32]);
        let derived = MessagingKeypair::from_signature(&sig).unwrap();
        let direct = MessagingKeypair::from_secret_bytes(&[9u8; 32]).unwrap();
        assert_eq!(derived.address(), direct.address());
    }

    #[test]
    fn test_sign_and_recover() {
        let keypair = MessagingKeypair::generate();
        let digest = personal_digest("prove it");

        let sig = keypair.sign_digest(&digest).unwrap();
        let recovered = recover_address(&digest, &sig).unwrap();
        assert_eq!(recovered, keypair.address());
    }

    #[test]
    fn test_recover_rejects_wrong_digest() {
        let keypair = MessagingKeypair::generate();
        let sig = keypair.sign_digest(&personal_digest("original")).unwrap();

        let recovered = recover_address(&personal_digest("tampered"), &sig).unwrap();
        assert_ne!(recovered, keypair.address());
    }

    #[test]
    fn test_address_parse_display_roundtrip() {
        let keypair = MessagingKeypair::generate();
        let text = keypair.address().to_string();
        let parsed: Address = text.parse().unwrap();
        assert_eq!(parsed, keypair.address());
    }

    #[test]
    fn test_address_rejects_malformed_input() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse::<Address>().is_err());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let keypair = MessagingKeypair::generate();
        let hex = keypair.public_key().to_hex();
        assert_eq!(hex.len(), 128);
        let restored = MessagingPublicKey::from_hex(&hex).unwrap();
        assert_eq!(restored, *keypair.public_key());
    }

    #[test]
    fn test_public_key_accepts_sec1_form() {
        let keypair = MessagingKeypair::generate();
        let sec1 = keypair.public_key().sec1_bytes();
        let restored = MessagingPublicKey::from_bytes(&sec1).unwrap();
        assert_eq!(restored, *keypair.public_key());
    }
}

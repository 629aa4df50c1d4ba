//! Wallet-backed messaging identity
//!
//! A wallet never hands out its private key; it only signs. Enrollment
//! turns two signatures into a messaging identity:
//!
//! 1. the wallet signs the fixed enrollment phrase - the first 32 bytes
//!    of that signature *are* the messaging private key, making the
//!    derivation deterministic and repeatable on any device
//! 2. the wallet signs the publication message, publicly authorizing the
//!    derived messaging address to speak for it
//!
//! The [`WalletSigner`] trait is the seam to the external wallet;
//! [`LocalSigner`] implements it over an in-process key for tests and
//! key-in-process deployments.

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::{
    hash, keys::decode_signature_hex, Address, CryptoResult, MessagingKeypair,
};
use crate::transport::AccountRecord;

/// The fixed phrase whose signature seeds the messaging key
///
/// Changing this breaks identity derivation for every existing user.
pub const ENROLLMENT_PHRASE: &str = "I am ready to start messaging on Origin.";

/// Prefix of the publication message the wallet signs
pub const PUBLICATION_PREFIX: &str = "My public messaging key is: ";

/// How a wallet hashes a message before signing it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SigningStyle {
    /// `personal_sign`: prefix with `"\x19Ethereum Signed Message:\n" + len`
    #[default]
    Personal,
    /// Raw keccak over the message bytes
    Raw,
}

impl SigningStyle {
    /// Digest a message the way this style's wallets do
    pub fn digest(&self, message: &str) -> [u8; 32] {
        match self {
            SigningStyle::Personal => hash::personal_digest(message),
            SigningStyle::Raw => hash::raw_digest(message),
        }
    }
}

/// Wallet signer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// The user declined the signing prompt
    #[error("Signing request denied")]
    Denied,

    /// The signer cannot serve the request
    #[error("Signer unavailable: {0}")]
    Unavailable(String),
}

/// An external wallet that signs on the engine's behalf
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Sign a message for the given wallet address
    ///
    /// Returns the 65-byte recoverable signature as a `0x`-prefixed hex
    /// string. Implementations prompt the user; a refusal is
    /// [`SignerError::Denied`].
    async fn sign(&self, message: &str, wallet: &Address) -> Result<String, SignerError>;
}

/// A signer holding its key in process
pub struct LocalSigner {
    keypair: MessagingKeypair,
    style: SigningStyle,
}

impl LocalSigner {
    /// Fresh random wallet key
    pub fn random(style: SigningStyle) -> Self {
        LocalSigner {
            keypair: MessagingKeypair::generate(),
            style,
        }
    }

    /// Wrap an existing secret key
    pub fn from_secret_bytes(bytes: &[u8], style: SigningStyle) -> CryptoResult<Self> {
        Ok(LocalSigner {
            keypair: MessagingKeypair::from_secret_bytes(bytes)?,
            style,
        })
    }

    /// The wallet address this signer controls
    pub fn address(&self) -> Address {
        self.keypair.address()
    }
}

#[async_trait]
impl WalletSigner for LocalSigner {
    async fn sign(&self, message: &str, wallet: &Address) -> Result<String, SignerError> {
        if *wallet != self.keypair.address() {
            return Err(SignerError::Unavailable(format!(
                "account {wallet} is not held by this signer"
            )));
        }
        let digest = self.style.digest(message);
        self.keypair
            .sign_digest(&digest)
            .map_err(|e| SignerError::Unavailable(e.to_string()))
    }
}

/// A signer that always refuses, for exercising denial paths
pub struct DenyingSigner;

#[async_trait]
impl WalletSigner for DenyingSigner {
    async fn sign(&self, _message: &str, _wallet: &Address) -> Result<String, SignerError> {
        Err(SignerError::Denied)
    }
}

/// Enrollment signatures gathered outside the engine
///
/// Takes the same path as an interactive ceremony: the enrollment
/// signature seeds the keypair, the optional publication signature skips
/// the second prompt.
#[derive(Clone, Debug)]
pub struct PrecomputedEnrollment {
    /// Wallet signature over the enrollment phrase
    pub enrollment_signature: String,
    /// Wallet signature over the publication message, if already gathered
    pub publication_signature: Option<String>,
}

/// The enrolled messaging identity of one wallet
///
/// Owned by the engine; created once per wallet and replaced only when
/// the caller rotates accounts.
pub struct AccountBinding {
    wallet_address: Address,
    keypair: MessagingKeypair,
    enrollment_phrase: String,
    publication_message: Option<String>,
    publication_signature: Option<String>,
}

impl AccountBinding {
    /// Derive a binding from the wallet's enrollment signature
    pub fn from_enrollment_signature(
        wallet_address: Address,
        enrollment_phrase: &str,
        signature: &str,
    ) -> CryptoResult<Self> {
        let raw = decode_signature_hex(signature)?;
        Ok(AccountBinding {
            wallet_address,
            keypair: MessagingKeypair::from_signature(&raw)?,
            enrollment_phrase: enrollment_phrase.to_string(),
            publication_message: None,
            publication_signature: None,
        })
    }

    /// Rebuild a binding from a persisted messaging secret
    pub fn from_stored_secret(
        wallet_address: Address,
        enrollment_phrase: &str,
        secret_hex: &str,
    ) -> CryptoResult<Self> {
        let raw = hex::decode(secret_hex.strip_prefix("0x").unwrap_or(secret_hex))
            .map_err(|_| crate::crypto::CryptoError::InvalidSecretKey)?;
        Ok(AccountBinding {
            wallet_address,
            keypair: MessagingKeypair::from_secret_bytes(&raw)?,
            enrollment_phrase: enrollment_phrase.to_string(),
            publication_message: None,
            publication_signature: None,
        })
    }

    /// The wallet this binding belongs to
    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }

    /// The derived messaging keypair
    pub fn keypair(&self) -> &MessagingKeypair {
        &self.keypair
    }

    /// The derived messaging address
    pub fn messaging_address(&self) -> Address {
        self.keypair.address()
    }

    /// The phrase the wallet signed to derive the key
    pub fn enrollment_phrase(&self) -> &str {
        &self.enrollment_phrase
    }

    /// The publication message this binding expects the wallet to sign
    pub fn expected_publication_message(&self) -> String {
        format!("{}{}", PUBLICATION_PREFIX, self.messaging_address())
    }

    /// Publication message, once signed or adopted
    pub fn publication_message(&self) -> Option<&str> {
        self.publication_message.as_deref()
    }

    /// Wallet signature over the publication message
    pub fn publication_signature(&self) -> Option<&str> {
        self.publication_signature.as_deref()
    }

    /// Attach the wallet's publication proof
    pub fn set_publication(&mut self, message: String, signature: String) {
        self.publication_message = Some(message);
        self.publication_signature = Some(signature);
    }

    /// Whether the publication proof is present locally
    pub fn has_publication(&self) -> bool {
        self.publication_message.is_some() && self.publication_signature.is_some()
    }

    /// Render the registry record for this binding
    ///
    /// `None` until the publication proof exists. The `phs` field is the
    /// messaging key's own signature over the phrase, proving possession
    /// of the derived key to anyone reading the registry.
    pub fn to_account_record(&self) -> CryptoResult<Option<AccountRecord>> {
        let (Some(msg), Some(sig)) = (&self.publication_message, &self.publication_signature)
        else {
            return Ok(None);
        };

        let phs = self
            .keypair
            .sign_digest(&hash::personal_digest(&self.enrollment_phrase))?;

        Ok(Some(AccountRecord {
            address: self.keypair.address(),
            msg: msg.clone(),
            pub_key: self.keypair.public_key().to_hex(),
            ph: self.enrollment_phrase.clone(),
            phs,
            signature: sig.clone(),
        }))
    }
}

impl std::fmt::Debug for AccountBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountBinding")
            .field("wallet", &self.wallet_address)
            .field("messaging", &self.keypair.address())
            .field("published", &self.has_publication())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MessagingKeypair;

    #[tokio::test]
    async fn test_enrollment_is_deterministic_across_sessions() {
        let signer = LocalSigner::random(SigningStyle::Personal);
        let wallet = signer.address();

        let sig1 = signer.sign(ENROLLMENT_PHRASE, &wallet).await.unwrap();
        let sig2 = signer.sign(ENROLLMENT_PHRASE, &wallet).await.unwrap();
        assert_eq!(sig1, sig2);

        let b1 = AccountBinding::from_enrollment_signature(wallet, ENROLLMENT_PHRASE, &sig1).unwrap();
        let b2 = AccountBinding::from_enrollment_signature(wallet, ENROLLMENT_PHRASE, &sig2).unwrap();
        assert_eq!(b1.messaging_address(), b2.messaging_address());
    }

    #[tokio::test]
    async fn test_stored_secret_rebuilds_same_identity() {
        let signer = LocalSigner::random(SigningStyle::Personal);
        let wallet = signer.address();
        let sig = signer.sign(ENROLLMENT_PHRASE, &wallet).await.unwrap();

        let binding =
            AccountBinding::from_enrollment_signature(wallet, ENROLLMENT_PHRASE, &sig).unwrap();
        let stored = hex::encode(binding.keypair().secret_bytes());

        let rebuilt =
            AccountBinding::from_stored_secret(wallet, ENROLLMENT_PHRASE, &stored).unwrap();
        assert_eq!(rebuilt.messaging_address(), binding.messaging_address());
    }

    #[tokio::test]
    async fn test_publication_message_embeds_messaging_address() {
        let signer = LocalSigner::random(SigningStyle::Personal);
        let wallet = signer.address();
        let sig = signer.sign(ENROLLMENT_PHRASE, &wallet).await.unwrap();

        let binding =
            AccountBinding::from_enrollment_signature(wallet, ENROLLMENT_PHRASE, &sig).unwrap();
        let message = binding.expected_publication_message();

        assert!(message.starts_with(PUBLICATION_PREFIX));
        assert!(message.ends_with(&binding.messaging_address().to_checksum_string()));
    }

    #[tokio::test]
    async fn test_record_requires_publication_proof() {
        let signer = LocalSigner::random(SigningStyle::Personal);
        let wallet = signer.address();
        let sig = signer.sign(ENROLLMENT_PHRASE, &wallet).await.unwrap();

        let mut binding =
            AccountBinding::from_enrollment_signature(wallet, ENROLLMENT_PHRASE, &sig).unwrap();
        assert!(binding.to_account_record().unwrap().is_none());

        let message = binding.expected_publication_message();
        let publication_sig = signer.sign(&message, &wallet).await.unwrap();
        binding.set_publication(message.clone(), publication_sig);

        let record = binding.to_account_record().unwrap().unwrap();
        assert_eq!(record.address, binding.messaging_address());
        assert_eq!(record.msg, message);
        assert_eq!(record.ph, ENROLLMENT_PHRASE);
    }

    #[tokio::test]
    async fn test_denying_signer_reports_denied() {
        let wallet = MessagingKeypair::generate().address();
        assert_eq!(
            DenyingSigner.sign("anything", &wallet).await,
            Err(SignerError::Denied)
        );
    }

    #[tokio::test]
    async fn test_local_signer_rejects_foreign_account() {
        let signer = LocalSigner::random(SigningStyle::Personal);
        let other = MessagingKeypair::generate().address();
        assert!(matches!(
            signer.sign("hello", &other).await,
            Err(SignerError::Unavailable(_))
        ));
    }
}

//! Content envelopes and the message schema
//!
//! Everything that crosses the room log is one of two envelopes:
//! - `keys`: announces membership and hands every participant a wrapped
//!   copy of a fresh symmetric room key
//! - `msg`: an AES-sealed message payload
//!
//! Unknown envelope types fail to decode and are skipped, which keeps the
//! wire format forward-compatible. Decrypted payloads are validated
//! against the message schema; a blob that decrypts but does not validate
//! is treated as not-a-message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::{
    ecies, random_bytes, Address, Cipher, CryptoError, MessagingPublicKey,
};
use crate::room::{KeySet, RoomId};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// The outgoing message failed schema validation
    #[error("Message failed schema validation")]
    InvalidMessage,

    /// A crypto primitive failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// A content envelope as stored in the room log
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Room key announcement
    #[serde(rename = "keys")]
    Keys(KeyAnnouncement),
    /// Encrypted message
    #[serde(rename = "msg")]
    Msg(SealedEnvelope),
}

/// A `keys` envelope: one wrapped copy of the room key per participant
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyAnnouncement {
    /// Wallet address of the announcing sender
    pub address: Address,
    /// Wrapped key entries, one per participant
    pub keys: Vec<WrappedRoomKey>,
}

/// One participant's wrapped copy of a room key
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedRoomKey {
    /// Participant's wallet address
    pub address: Address,
    /// Participant's messaging address
    pub messaging_address: Address,
    /// ECIES blob, hex-encoded, addressed to the participant's messaging key
    pub wrapped_key: String,
}

/// A `msg` envelope: an AES-sealed message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Wallet address of the sender
    pub address: Address,
    /// Base64 IV
    pub iv: String,
    /// Base64 ciphertext
    pub ciphertext: String,
}

/// A `msg` envelope carried outside the room log, e.g. in a link or QR
/// code, extended with the recipient's address
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutOfBandEnvelope {
    /// Always `"msg"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Wallet address of the sender
    pub address: Address,
    /// Wallet address of the recipient
    pub to: Address,
    /// Base64 IV
    pub iv: String,
    /// Base64 ciphertext
    pub ciphertext: String,
}

/// Hint that re-announces room keys inside a message payload
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecryptionHint {
    /// Hex room keys
    pub keys: Vec<String>,
    /// Room the keys belong to
    #[serde(rename = "roomId")]
    pub room_id: String,
}

/// A validated plaintext message
///
/// `created` is required; everything else is optional, and fields this
/// client does not know about survive a decode/encode cycle in `extra`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Sender-side creation time, Unix milliseconds
    pub created: u64,
    /// Text body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Media attachments, opaque to the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<Value>>,
    /// Optional key re-announcement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption: Option<DecryptionHint>,
    /// Fields outside the schema, tolerated and preserved
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A message as composed by the caller, before the codec stamps it
#[derive(Clone, Debug, Default)]
pub struct OutboundMessage {
    /// Text body
    pub content: Option<String>,
    /// Media attachments
    pub media: Option<Vec<Value>>,
    /// Optional key re-announcement
    pub decryption: Option<DecryptionHint>,
    /// Additional schema-tolerated fields
    pub extra: serde_json::Map<String, Value>,
}

impl OutboundMessage {
    /// A plain text message
    pub fn text(content: impl Into<String>) -> Self {
        OutboundMessage {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    fn into_message(mut self, created: u64) -> Message {
        for reserved in ["created", "content", "media", "decryption"] {
            self.extra.remove(reserved);
        }
        Message {
            created,
            content: self.content,
            media: self.media,
            decryption: self.decryption,
            extra: self.extra,
        }
    }
}

/// A decrypted message as surfaced to the caller
#[derive(Clone, Debug, Serialize)]
pub struct DecryptedMessage {
    /// The validated plaintext
    pub msg: Message,
    /// Room it arrived in
    pub room_id: RoomId,
    /// Log index it occupies
    pub index: u64,
    /// Wallet address of the sender
    pub sender_address: Address,
    /// Stable identifier: `roomId + "." + index`
    pub hash: String,
}

impl DecryptedMessage {
    /// The hash a message at this room and index carries
    pub fn hash_of(room: &RoomId, index: u64) -> String {
        format!("{}.{}", room.as_str(), index)
    }
}

/// A payload no known room key opens, surfaced on the still-encrypted
/// event stream so a UI can show a placeholder
#[derive(Clone, Debug)]
pub struct SealedRecord {
    /// Room it arrived in
    pub room_id: RoomId,
    /// Log index it occupies
    pub index: u64,
    /// Wallet address of the sender
    pub sender_address: Address,
    /// Base64 IV, as received
    pub iv: String,
    /// Base64 ciphertext, as received
    pub ciphertext: String,
    /// Stable identifier: `roomId + "." + index`
    pub hash: String,
}

/// Outcome of running a `msg` envelope through the room's key set
#[derive(Debug)]
pub enum MessageOutcome {
    /// A key opened it and the payload validates
    Decrypted(Message),
    /// A key opened it but the payload is not a valid message
    Invalid,
    /// No key opened it
    Undecryptable,
}

/// Mint a fresh room key and wrap it for every participant
///
/// Returns the announcement and the plaintext key so the sender can adopt
/// it once the announcement is accepted by the server.
pub fn encode_key_announcement(
    sender: Address,
    recipients: &[(Address, MessagingPublicKey)],
) -> CodecResult<(KeyAnnouncement, [u8; 32])> {
    let room_key = random_bytes::<32>();

    let mut keys = Vec::with_capacity(recipients.len());
    for (wallet, public) in recipients {
        let blob = ecies::wrap_key(public, &room_key)?;
        keys.push(WrappedRoomKey {
            address: *wallet,
            messaging_address: public.address(),
            wrapped_key: hex::encode(blob),
        });
    }

    Ok((KeyAnnouncement { address: sender, keys }, room_key))
}

/// Recover the room keys addressed to us from an announcement
///
/// Entries addressed to other wallets are ignored; unwrap failures are
/// skipped since announcements legitimately contain entries we cannot
/// open.
pub fn decode_key_announcement(
    announcement: &KeyAnnouncement,
    own_wallet: &Address,
    messaging_secret: &[u8; 32],
) -> Vec<[u8; 32]> {
    let mut recovered = Vec::new();
    for entry in &announcement.keys {
        if entry.address != *own_wallet {
            continue;
        }
        let Ok(blob) = hex::decode(&entry.wrapped_key) else {
            continue;
        };
        match ecies::unwrap_key(messaging_secret, &blob) {
            Ok(key) if key.len() == 32 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&key);
                recovered.push(arr);
            }
            _ => continue,
        }
    }
    recovered
}

/// Stamp, validate, serialize and seal an outgoing message
///
/// Returns the envelope together with the stamped message so the sender
/// can surface its own copy without re-decrypting.
pub fn encode_message(
    sender: Address,
    outbound: OutboundMessage,
    key: &[u8; 32],
    created: u64,
) -> CodecResult<(SealedEnvelope, Message)> {
    let message = outbound.into_message(created);

    // Round-trip through the schema so anything a caller smuggled into
    // `extra` that breaks validation aborts here, not at the peer.
    let value = serde_json::to_value(&message).map_err(|_| CodecError::InvalidMessage)?;
    if serde_json::from_value::<Message>(value.clone()).is_err() {
        return Err(CodecError::InvalidMessage);
    }

    let sealed = Cipher::seal(key, &canonical_json(&value));
    Ok((
        SealedEnvelope {
            address: sender,
            iv: sealed.iv,
            ciphertext: sealed.ciphertext,
        },
        message,
    ))
}

/// Try every room key in insertion order against a sealed envelope
pub fn decode_message(sealed: &SealedEnvelope, keys: &KeySet) -> MessageOutcome {
    for key in keys.iter() {
        match Cipher::open(key, &sealed.iv, &sealed.ciphertext) {
            Ok(plaintext) => {
                return match serde_json::from_str::<Message>(&plaintext) {
                    Ok(message) => MessageOutcome::Decrypted(message),
                    Err(_) => MessageOutcome::Invalid,
                };
            }
            Err(_) => continue,
        }
    }
    MessageOutcome::Undecryptable
}

/// Key-sorted JSON serialization
///
/// Signers and verifiers must agree on the exact bytes, so objects are
/// rendered with their keys in sorted order at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string keys always serialize"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => serde_json::to_string(other).expect("scalar values always serialize"),
    }
}

/// The exact text a sender signs for a log entry
pub fn entry_signing_text(room: &RoomId, index: u64, content: &Value) -> String {
    canonical_json(&serde_json::json!({
        "content": content,
        "conversationId": room.as_str(),
        "conversationIndex": index,
    }))
}

/// Current Unix time in milliseconds
pub fn current_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MessagingKeypair;

    fn keypair_and_wallet() -> (MessagingKeypair, Address) {
        let wallet = MessagingKeypair::generate().address();
        (MessagingKeypair::generate(), wallet)
    }

    #[test]
    fn test_envelope_wire_format() {
        let (messaging, wallet) = keypair_and_wallet();
        let (announcement, _) =
            encode_key_announcement(wallet, &[(wallet, *messaging.public_key())]).unwrap();

        let value = serde_json::to_value(Envelope::Keys(announcement)).unwrap();
        assert_eq!(value["type"], "keys");
        assert_eq!(value["keys"][0]["address"], wallet.to_checksum_string());
        assert!(value["keys"][0]["wrappedKey"].is_string());

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert!(matches!(back, Envelope::Keys(_)));
    }

    #[test]
    fn test_unknown_envelope_type_fails_decode() {
        let result = serde_json::from_value::<Envelope>(serde_json::json!({
            "type": "presence",
            "address": "0x0000000000000000000000000000000000000000",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_key_announcement_roundtrip_for_self() {
        let (messaging, wallet) = keypair_and_wallet();
        let (announcement, room_key) =
            encode_key_announcement(wallet, &[(wallet, *messaging.public_key())]).unwrap();

        let recovered =
            decode_key_announcement(&announcement, &wallet, messaging.secret_bytes());
        assert_eq!(recovered, vec![room_key]);
    }

    #[test]
    fn test_key_announcement_ignores_other_recipients() {
        let (peer_messaging, peer_wallet) = keypair_and_wallet();
        let own_messaging = MessagingKeypair::generate();
        let own_wallet = MessagingKeypair::generate().address();

        let (announcement, _) =
            encode_key_announcement(peer_wallet, &[(peer_wallet, *peer_messaging.public_key())])
                .unwrap();

        let recovered =
            decode_key_announcement(&announcement, &own_wallet, own_messaging.secret_bytes());
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_message_roundtrip_preserves_structure() {
        let sender = MessagingKeypair::generate().address();
        let key = [5u8; 32];
        let mut outbound = OutboundMessage::text("hi");
        outbound
            .extra
            .insert("clientTag".into(), Value::String("v2".into()));

        let (sealed, stamped) = encode_message(sender, outbound, &key, 1_700_000_000_000).unwrap();
        assert_eq!(stamped.created, 1_700_000_000_000);

        let mut keys = KeySet::default();
        keys.add(key);
        match decode_message(&sealed, &keys) {
            MessageOutcome::Decrypted(message) => {
                assert_eq!(message, stamped);
                assert_eq!(message.content.as_deref(), Some("hi"));
                assert_eq!(message.extra["clientTag"], "v2");
            }
            other => panic!("expected decrypt, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_tries_keys_in_insertion_order() {
        let sender = MessagingKeypair::generate().address();
        let old_key = [1u8; 32];
        let new_key = [2u8; 32];

        let (sealed, _) =
            encode_message(sender, OutboundMessage::text("ratcheted"), &new_key, 1).unwrap();

        let mut keys = KeySet::default();
        keys.add(old_key);
        keys.add(new_key);
        assert!(matches!(
            decode_message(&sealed, &keys),
            MessageOutcome::Decrypted(_)
        ));
    }

    #[test]
    fn test_wrong_key_is_undecryptable() {
        let sender = MessagingKeypair::generate().address();
        let (sealed, _) =
            encode_message(sender, OutboundMessage::text("hidden"), &[1u8; 32], 1).unwrap();

        let mut keys = KeySet::default();
        keys.add([2u8; 32]);
        assert!(matches!(
            decode_message(&sealed, &keys),
            MessageOutcome::Undecryptable
        ));
    }

    #[test]
    fn test_schema_invalid_payload_is_not_a_message() {
        let key = [9u8; 32];
        let sealed_text = Cipher::seal(&key, r#"{"note":"no created field"}"#);
        let sealed = SealedEnvelope {
            address: MessagingKeypair::generate().address(),
            iv: sealed_text.iv,
            ciphertext: sealed_text.ciphertext,
        };

        let mut keys = KeySet::default();
        keys.add(key);
        assert!(matches!(decode_message(&sealed, &keys), MessageOutcome::Invalid));
    }

    #[test]
    fn test_schema_rejects_wrong_field_types() {
        let key = [9u8; 32];
        let sealed_text = Cipher::seal(&key, r#"{"created":"soon","content":"x"}"#);
        let sealed = SealedEnvelope {
            address: MessagingKeypair::generate().address(),
            iv: sealed_text.iv,
            ciphertext: sealed_text.ciphertext,
        };

        let mut keys = KeySet::default();
        keys.add(key);
        assert!(matches!(decode_message(&sealed, &keys), MessageOutcome::Invalid));
    }

    #[test]
    fn test_canonical_json_sorts_keys_at_every_depth() {
        let value = serde_json::json!({
            "zebra": 1,
            "alpha": {"inner_b": [3, 2], "inner_a": true},
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":{"inner_a":true,"inner_b":[3,2]},"zebra":1}"#
        );
    }

    #[test]
    fn test_entry_signing_text_is_stable() {
        let a = MessagingKeypair::generate().address();
        let b = MessagingKeypair::generate().address();
        let room = RoomId::between(&a, &b);
        let content = serde_json::json!({"type": "msg", "iv": "aa", "ciphertext": "bb", "address": a});

        let text = entry_signing_text(&room, 3, &content);
        assert!(text.starts_with(r#"{"content":{"address":"#));
        assert!(text.contains(r#""conversationIndex":3"#));
        assert_eq!(text, entry_signing_text(&room, 3, &content));
    }

    #[test]
    fn test_hash_format() {
        let a = MessagingKeypair::generate().address();
        let b = MessagingKeypair::generate().address();
        let room = RoomId::between(&a, &b);
        assert_eq!(
            DecryptedMessage::hash_of(&room, 7),
            format!("{}.7", room.as_str())
        );
    }
}

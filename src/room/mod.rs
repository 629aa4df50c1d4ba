//! Rooms and their key material
//!
//! A room is the channel between a set of wallet addresses. Its
//! identifier is canonical - participants' checksummed addresses sorted
//! and joined with `-` - so both ends of a pairwise conversation derive
//! the same id independently. Each room carries an insertion-ordered,
//! deduplicated set of symmetric keys: the first key seals outgoing
//! messages, every key is tried on decrypt.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::DecryptedMessage;
use crate::crypto::{Address, CryptoError, CryptoResult};

/// Canonical room identifier
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// The room between two participants
    pub fn between(a: &Address, b: &Address) -> Self {
        Self::of_participants(&[*a, *b])
    }

    /// The room for an arbitrary participant set
    ///
    /// Addresses are rendered checksummed, sorted, and joined with `-`;
    /// duplicates collapse.
    pub fn of_participants(participants: &[Address]) -> Self {
        let mut names: Vec<String> = participants
            .iter()
            .map(Address::to_checksum_string)
            .collect();
        names.sort();
        names.dedup();
        RoomId(names.join("-"))
    }

    /// The raw identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The participants encoded in this identifier
    pub fn participants(&self) -> Vec<Address> {
        self.0.split('-').filter_map(|part| part.parse().ok()).collect()
    }

    /// Whether a caller-supplied string names a room rather than a wallet
    pub fn is_room_reference(s: &str) -> bool {
        s.contains('-')
    }
}

impl std::str::FromStr for RoomId {
    type Err = CryptoError;

    /// Parse and canonicalize a room identifier
    ///
    /// Every `-`-separated segment must be a valid address; the result is
    /// re-sorted and re-checksummed so lookups are case-insensitive.
    fn from_str(s: &str) -> CryptoResult<Self> {
        let parts: Vec<Address> = s
            .split('-')
            .map(|part| part.parse())
            .collect::<CryptoResult<_>>()?;
        if parts.len() < 2 {
            return Err(CryptoError::InvalidAddress(s.to_string()));
        }
        Ok(Self::of_participants(&parts))
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoomId({})", self.0)
    }
}

impl Serialize for RoomId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Insertion-ordered, deduplicated set of 32-byte room keys
#[derive(Default, Clone)]
pub struct KeySet {
    keys: Vec<[u8; 32]>,
}

impl KeySet {
    /// Add a key; no-op when already present
    ///
    /// Returns whether the key was new.
    pub fn add(&mut self, key: [u8; 32]) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    /// The key new outgoing messages are sealed under
    pub fn primary(&self) -> Option<&[u8; 32]> {
        self.keys.first()
    }

    /// All keys in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.keys.iter()
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys yet
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeySet({} keys)", self.keys.len())
    }
}

/// Local state for one room
///
/// `message_count` is one past the highest log index seen, whether or not
/// that entry decrypted; the decrypted message map is sparse-tolerant.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    keys: KeySet,
    messages: BTreeMap<u64, DecryptedMessage>,
    message_count: u64,
}

impl Room {
    /// Create an empty room
    pub fn new(id: RoomId) -> Self {
        Room {
            id,
            keys: KeySet::default(),
            messages: BTreeMap::new(),
            message_count: 0,
        }
    }

    /// The room identifier
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// The symmetric key set
    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    /// Add a symmetric key; returns whether it was new
    pub fn add_key(&mut self, key: [u8; 32]) -> bool {
        self.keys.add(key)
    }

    /// One past the highest log index seen
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Highest ingested log index, `None` for a virgin room
    pub fn last_index(&self) -> Option<u64> {
        self.message_count.checked_sub(1)
    }

    /// Record that the log reaches at least `index`
    pub fn note_index(&mut self, index: u64) {
        self.message_count = self.message_count.max(index + 1);
    }

    /// Store a decrypted message at its log index
    pub fn record_message(&mut self, message: DecryptedMessage) {
        self.note_index(message.index);
        self.messages.insert(message.index, message);
    }

    /// Drop decrypted messages and counters ahead of a bulk reload
    pub fn clear_log(&mut self) {
        self.messages.clear();
        self.message_count = 0;
    }

    /// Decrypted messages in ascending index order
    pub fn messages(&self) -> impl Iterator<Item = &DecryptedMessage> {
        self.messages.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MessagingKeypair;

    fn addr() -> Address {
        MessagingKeypair::generate().address()
    }

    #[test]
    fn test_room_id_is_commutative() {
        let a = addr();
        let b = addr();
        assert_eq!(RoomId::between(&a, &b), RoomId::between(&b, &a));
    }

    #[test]
    fn test_room_id_sorted_ascending() {
        let a = addr();
        let b = addr();
        let id = RoomId::between(&a, &b).to_string();
        let (left, right) = id.split_once('-').unwrap();
        assert!(left < right);
    }

    #[test]
    fn test_room_id_parse_canonicalizes_case() {
        let a = addr();
        let b = addr();
        let id = RoomId::between(&a, &b);
        let lowered = id.as_str().to_lowercase();

        let parsed: RoomId = lowered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_room_id_rejects_junk() {
        assert!("".parse::<RoomId>().is_err());
        assert!("0x1-0x2".parse::<RoomId>().is_err());
        assert!(addr().to_checksum_string().parse::<RoomId>().is_err());
    }

    #[test]
    fn test_room_reference_detection() {
        let a = addr();
        let b = addr();
        assert!(RoomId::is_room_reference(RoomId::between(&a, &b).as_str()));
        assert!(!RoomId::is_room_reference(&a.to_checksum_string()));
    }

    #[test]
    fn test_key_set_deduplicates_preserving_order() {
        let mut set = KeySet::default();
        assert!(set.add([1u8; 32]));
        assert!(set.add([2u8; 32]));
        assert!(!set.add([1u8; 32]));

        assert_eq!(set.len(), 2);
        assert_eq!(set.primary(), Some(&[1u8; 32]));
        let order: Vec<_> = set.iter().copied().collect();
        assert_eq!(order, vec![[1u8; 32], [2u8; 32]]);
    }

    #[test]
    fn test_message_count_tracks_highest_index() {
        let mut room = Room::new(RoomId::between(&addr(), &addr()));
        assert_eq!(room.message_count(), 0);
        assert_eq!(room.last_index(), None);

        room.note_index(0);
        room.note_index(4);
        room.note_index(2);

        assert_eq!(room.message_count(), 5);
        assert_eq!(room.last_index(), Some(4));
    }
}

//! Key-server transport abstraction
//!
//! This module moves envelopes and registry records between the engine
//! and a key server:
//! - In-memory server (for testing and simulations)
//! - HTTP + WebSocket client against a real key server
//!
//! # Design
//!
//! The transport layer never touches plaintext - it ships opaque sealed
//! envelopes, registry records, and log metadata. Encryption and log
//! reconciliation live above it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::crypto::Address;
use crate::room::RoomId;

pub mod http;
pub use http::HttpKeyServer;

/// WebSocket close code for a deliberate shutdown
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A request failed before producing a status code
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The server already holds an entry at the posted index
    #[error("Log index conflict")]
    IndexConflict,

    /// The server answered with an unexpected status code
    #[error("Server returned status {0}")]
    ServerStatus(u16),

    /// A frame or body could not be decoded
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One record in a room's append-only log
///
/// Indices are server-assigned, dense, and start at 0 per room.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Room the entry belongs to
    pub conversation_id: RoomId,
    /// Position in the room log
    pub conversation_index: u64,
    /// The JSON content envelope (`keys` or `msg`)
    pub content: serde_json::Value,
    /// Sender's signature over the canonical entry JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// One item on a live subscription feed
#[derive(Clone, Debug)]
pub enum FeedEvent {
    /// A freshly appended log entry
    Entry(LogEntry),
    /// The feed closed with the given WebSocket close code
    Closed {
        /// Close code; anything but 1000 triggers the reconnect policy
        code: u16,
    },
}

/// Summary row from the conversation listing endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationHead {
    /// Room identifier
    pub id: RoomId,
    /// Number of entries in the room log
    pub count: u64,
}

/// The registry record a key server holds per wallet address
///
/// `phs` is the messaging key's own signature over the enrollment phrase
/// (proof of possession); `signature` is the wallet's signature over the
/// publication message and is what binds the two identities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountRecord {
    /// The derived messaging address
    pub address: Address,
    /// Publication message (`prefix + messaging address`)
    pub msg: String,
    /// Messaging public key, tagless hex
    pub pub_key: String,
    /// The enrollment phrase this deployment uses
    pub ph: String,
    /// Messaging key's signature over `ph`
    pub phs: String,
    /// Wallet's signature over `msg`
    pub signature: String,
}

/// Abstract key server
///
/// The server stores per-room append-only logs and per-wallet registry
/// records, and fans appended entries out to live subscribers. It sees
/// only ciphertext and membership metadata.
#[async_trait]
pub trait KeyServer: Send + Sync {
    /// Fetch the registry record for a wallet; `None` when not enrolled
    async fn fetch_account(&self, wallet: &Address) -> TransportResult<Option<AccountRecord>>;

    /// Publish a registry record under a wallet address
    async fn publish_account(
        &self,
        wallet: &Address,
        record: &AccountRecord,
    ) -> TransportResult<()>;

    /// Fetch a room's full log in ascending index order
    async fn fetch_log(&self, room: &RoomId) -> TransportResult<Vec<LogEntry>>;

    /// Append an entry at `entry.conversation_index`
    ///
    /// Fails with [`TransportError::IndexConflict`] when the slot is
    /// already taken.
    async fn append_entry(&self, entry: &LogEntry) -> TransportResult<()>;

    /// List the rooms a wallet participates in
    async fn conversations(&self, wallet: &Address) -> TransportResult<Vec<ConversationHead>>;

    /// Open a live feed of entries for every room this wallet is in
    async fn subscribe(&self, wallet: &Address) -> TransportResult<mpsc::Receiver<FeedEvent>>;
}

/// In-memory key server for tests
///
/// Behaves like the real thing: dense per-room indices with 409-style
/// conflicts, per-wallet fan-out of appended entries, and a handle to
/// sever live feeds with an arbitrary close code.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory key server state
    #[derive(Default)]
    pub struct MemoryKeyServer {
        state: Mutex<ServerState>,
    }

    #[derive(Default)]
    struct ServerState {
        accounts: HashMap<String, AccountRecord>,
        logs: HashMap<String, Vec<LogEntry>>,
        feeds: HashMap<String, Vec<mpsc::Sender<FeedEvent>>>,
    }

    impl MemoryKeyServer {
        /// Create an empty server
        pub fn new() -> Self {
            Self::default()
        }

        /// Close every live feed with the given code
        ///
        /// Simulates a server-side disconnect; subscribers must apply
        /// their reconnect policy.
        pub fn drop_feeds(&self, code: u16) {
            let mut state = self.state.lock().expect("server lock");
            for senders in state.feeds.values() {
                for tx in senders {
                    let _ = tx.try_send(FeedEvent::Closed { code });
                }
            }
            state.feeds.clear();
        }

        /// Append bypassing the index check
        ///
        /// Lets tests fabricate the out-of-order deliveries a real
        /// network can produce.
        pub fn inject_feed_entry(&self, entry: LogEntry) {
            let state = self.state.lock().expect("server lock");
            fan_out(&state, &entry);
        }

        /// Number of stored entries for a room
        pub fn log_len(&self, room: &RoomId) -> usize {
            let state = self.state.lock().expect("server lock");
            state.logs.get(room.as_str()).map_or(0, Vec::len)
        }
    }

    fn fan_out(state: &ServerState, entry: &LogEntry) {
        for participant in entry.conversation_id.participants() {
            let key = participant.to_checksum_string();
            if let Some(senders) = state.feeds.get(&key) {
                for tx in senders {
                    let _ = tx.try_send(FeedEvent::Entry(entry.clone()));
                }
            }
        }
    }

    #[async_trait]
    impl KeyServer for MemoryKeyServer {
        async fn fetch_account(&self, wallet: &Address) -> TransportResult<Option<AccountRecord>> {
            let state = self.state.lock().expect("server lock");
            Ok(state.accounts.get(&wallet.to_checksum_string()).cloned())
        }

        async fn publish_account(
            &self,
            wallet: &Address,
            record: &AccountRecord,
        ) -> TransportResult<()> {
            let mut state = self.state.lock().expect("server lock");
            state
                .accounts
                .insert(wallet.to_checksum_string(), record.clone());
            Ok(())
        }

        async fn fetch_log(&self, room: &RoomId) -> TransportResult<Vec<LogEntry>> {
            let state = self.state.lock().expect("server lock");
            Ok(state.logs.get(room.as_str()).cloned().unwrap_or_default())
        }

        async fn append_entry(&self, entry: &LogEntry) -> TransportResult<()> {
            let mut state = self.state.lock().expect("server lock");
            let log = state
                .logs
                .entry(entry.conversation_id.as_str().to_string())
                .or_default();

            if entry.conversation_index != log.len() as u64 {
                return Err(TransportError::IndexConflict);
            }
            log.push(entry.clone());

            fan_out(&state, entry);
            Ok(())
        }

        async fn conversations(&self, wallet: &Address) -> TransportResult<Vec<ConversationHead>> {
            let state = self.state.lock().expect("server lock");
            let mut heads: Vec<ConversationHead> = state
                .logs
                .iter()
                .filter_map(|(id, log)| {
                    let room: RoomId = id.parse().ok()?;
                    room.participants()
                        .contains(wallet)
                        .then(|| ConversationHead {
                            id: room,
                            count: log.len() as u64,
                        })
                })
                .collect();
            heads.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
            Ok(heads)
        }

        async fn subscribe(&self, wallet: &Address) -> TransportResult<mpsc::Receiver<FeedEvent>> {
            let (tx, rx) = mpsc::channel(64);
            let mut state = self.state.lock().expect("server lock");
            state
                .feeds
                .entry(wallet.to_checksum_string())
                .or_default()
                .push(tx);
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryKeyServer;
    use super::*;
    use crate::crypto::MessagingKeypair;

    fn wallets() -> (Address, Address) {
        (
            MessagingKeypair::generate().address(),
            MessagingKeypair::generate().address(),
        )
    }

    fn entry(room: &RoomId, index: u64) -> LogEntry {
        LogEntry {
            conversation_id: room.clone(),
            conversation_index: index,
            content: serde_json::json!({"type": "msg"}),
            signature: None,
        }
    }

    #[tokio::test]
    async fn test_append_enforces_dense_indices() {
        let (a, b) = wallets();
        let room = RoomId::between(&a, &b);
        let server = MemoryKeyServer::new();

        server.append_entry(&entry(&room, 0)).await.unwrap();
        assert_eq!(
            server.append_entry(&entry(&room, 0)).await,
            Err(TransportError::IndexConflict)
        );
        assert_eq!(
            server.append_entry(&entry(&room, 5)).await,
            Err(TransportError::IndexConflict)
        );
        server.append_entry(&entry(&room, 1)).await.unwrap();

        let log = server.fetch_log(&room).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].conversation_index, 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_room_entries() {
        let (a, b) = wallets();
        let room = RoomId::between(&a, &b);
        let server = MemoryKeyServer::new();

        let mut feed_a = server.subscribe(&a).await.unwrap();
        let mut feed_b = server.subscribe(&b).await.unwrap();

        server.append_entry(&entry(&room, 0)).await.unwrap();

        for feed in [&mut feed_a, &mut feed_b] {
            match feed.recv().await {
                Some(FeedEvent::Entry(e)) => assert_eq!(e.conversation_index, 0),
                other => panic!("expected entry, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_outsiders_receive_nothing() {
        let (a, b) = wallets();
        let outsider = MessagingKeypair::generate().address();
        let room = RoomId::between(&a, &b);
        let server = MemoryKeyServer::new();

        let mut feed = server.subscribe(&outsider).await.unwrap();
        server.append_entry(&entry(&room, 0)).await.unwrap();

        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_feeds_delivers_close_code() {
        let (a, _) = wallets();
        let server = MemoryKeyServer::new();
        let mut feed = server.subscribe(&a).await.unwrap();

        server.drop_feeds(1006);

        match feed.recv().await {
            Some(FeedEvent::Closed { code }) => assert_eq!(code, 1006),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_conversation_listing_is_per_wallet() {
        let (a, b) = wallets();
        let c = MessagingKeypair::generate().address();
        let server = MemoryKeyServer::new();

        server
            .append_entry(&entry(&RoomId::between(&a, &b), 0))
            .await
            .unwrap();
        server
            .append_entry(&entry(&RoomId::between(&b, &c), 0))
            .await
            .unwrap();

        assert_eq!(server.conversations(&a).await.unwrap().len(), 1);
        assert_eq!(server.conversations(&b).await.unwrap().len(), 2);

        let heads = server.conversations(&b).await.unwrap();
        assert!(heads.iter().all(|h| h.count == 1));
    }
}

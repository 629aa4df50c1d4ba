//! Ordered ingestion of room logs
//!
//! Two inputs feed a room: a bulk fetch of its whole log and a live
//! per-wallet feed of appended entries. The live path accepts an entry
//! only at the next expected index; anything else - an unknown room, a
//! duplicate, a forward gap - triggers a bulk reload that replaces the
//! room's log state wholesale. Emission is deduplicated by message hash,
//! so a reload never re-announces messages the caller already saw.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::codec::{
    decode_key_announcement, decode_message, entry_signing_text, DecryptedMessage, Envelope,
    MessageOutcome, SealedRecord,
};
use crate::crypto::{hash::personal_digest, recover_address, Address};
use crate::room::{Room, RoomId};
use crate::transport::{FeedEvent, LogEntry, NORMAL_CLOSE_CODE};

use super::{Event, Shared, State};

/// Drive a live feed until it closes normally or the epoch moves on
pub(crate) async fn run(
    shared: Arc<Shared>,
    epoch: u64,
    wallet: Address,
    mut feed: mpsc::Receiver<FeedEvent>,
) {
    loop {
        let item = feed.recv().await;
        if stale(&shared, epoch).await {
            break;
        }

        match item {
            Some(FeedEvent::Entry(entry)) => {
                handle_live_entry(&shared, epoch, entry).await;
            }
            Some(FeedEvent::Closed { code }) if code == NORMAL_CLOSE_CODE => {
                info!(%wallet, "live feed closed normally");
                break;
            }
            Some(FeedEvent::Closed { code }) => {
                warn!(%wallet, code, "live feed dropped");
                if !reconnect(&shared, epoch, &wallet, &mut feed).await {
                    break;
                }
            }
            None => {
                warn!(%wallet, "live feed ended without a close frame");
                if !reconnect(&shared, epoch, &wallet, &mut feed).await {
                    break;
                }
            }
        }
    }
}

async fn stale(shared: &Shared, epoch: u64) -> bool {
    shared.state.lock().await.epoch != epoch
}

/// Re-establish the feed after the configured delay
///
/// Resubscribes first, then bulk-reloads every room in the refreshed
/// conversation list, so entries appended during the outage are caught
/// either by the reload or by the new feed's gap handling. Keeps
/// retrying until it succeeds or the account switches.
async fn reconnect(
    shared: &Arc<Shared>,
    epoch: u64,
    wallet: &Address,
    feed: &mut mpsc::Receiver<FeedEvent>,
) -> bool {
    loop {
        sleep(shared.reconnect_delay).await;
        if stale(shared, epoch).await {
            return false;
        }

        let heads = match shared.server.conversations(wallet).await {
            Ok(heads) => heads,
            Err(err) => {
                warn!(%wallet, %err, "conversation listing failed during reconnect");
                continue;
            }
        };
        let new_feed = match shared.server.subscribe(wallet).await {
            Ok(new_feed) => new_feed,
            Err(err) => {
                warn!(%wallet, %err, "resubscribe failed during reconnect");
                continue;
            }
        };

        {
            let mut state = shared.state.lock().await;
            if state.epoch != epoch {
                return false;
            }
            for head in &heads {
                state
                    .rooms
                    .entry(head.id.clone())
                    .or_insert_with(|| Room::new(head.id.clone()));
            }
        }
        for head in &heads {
            bulk_load(shared, epoch, &head.id).await;
        }

        *feed = new_feed;
        info!(%wallet, rooms = heads.len(), "live feed re-established");
        return true;
    }
}

/// Apply one live entry, or fall back to a bulk reload
async fn handle_live_entry(shared: &Arc<Shared>, epoch: u64, entry: LogEntry) {
    let room_id = entry.conversation_id.clone();
    let envelope: Option<Envelope> = serde_json::from_value(entry.content.clone()).ok();
    let verified = verify_entry(shared, &entry, envelope.as_ref()).await;

    let mut state = shared.state.lock().await;
    if state.epoch != epoch {
        return;
    }

    let expected = state.rooms.get(&room_id).map(Room::message_count);
    match expected {
        None => {
            // First contact from a new peer: pull the whole room
            drop(state);
            debug!(room = %room_id, "entry for unknown room; loading log");
            bulk_load(shared, epoch, &room_id).await;
        }
        Some(expected) if entry.conversation_index == expected => {
            apply_entry(&mut state, &entry, envelope, verified, &shared.events);
        }
        Some(expected) => {
            warn!(
                room = %room_id,
                index = entry.conversation_index,
                expected,
                "log discontinuity; resynchronizing"
            );
            drop(state);
            bulk_load(shared, epoch, &room_id).await;
        }
    }
}

/// Replace a room's log state from a full fetch
///
/// Entries run through the same verification and codec path as live
/// ones; already-emitted hashes are re-recorded without re-emitting.
/// Concurrent loads across rooms share the engine's permit pool.
pub(crate) async fn bulk_load(shared: &Arc<Shared>, epoch: u64, room_id: &RoomId) {
    let Ok(_permit) = shared.bulk_permits.clone().acquire_owned().await else {
        return;
    };

    let mut entries = match shared.server.fetch_log(room_id).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(room = %room_id, %err, "bulk load failed");
            return;
        }
    };
    entries.sort_by_key(|entry| entry.conversation_index);

    let mut prepared = Vec::with_capacity(entries.len());
    for entry in entries {
        let envelope: Option<Envelope> = serde_json::from_value(entry.content.clone()).ok();
        let verified = verify_entry(shared, &entry, envelope.as_ref()).await;
        prepared.push((entry, envelope, verified));
    }

    let mut state = shared.state.lock().await;
    if state.epoch != epoch {
        return;
    }

    state
        .rooms
        .entry(room_id.clone())
        .or_insert_with(|| Room::new(room_id.clone()))
        .clear_log();

    for (entry, envelope, verified) in prepared {
        apply_entry(&mut state, &entry, envelope, verified, &shared.events);
    }
    debug!(room = %room_id, "room log replaced from bulk fetch");
}

/// Check a signed entry against the sender's registry identity
///
/// The signature covers the canonical JSON of the entry; the recovered
/// address must equal the messaging address the sender's wallet
/// published. Unsigned entries pass - the historical log predates entry
/// signing - but are noted.
async fn verify_entry(shared: &Arc<Shared>, entry: &LogEntry, envelope: Option<&Envelope>) -> bool {
    let Some(signature) = &entry.signature else {
        debug!(
            room = %entry.conversation_id,
            index = entry.conversation_index,
            "accepting unsigned entry"
        );
        return true;
    };
    // An undecodable envelope is skipped later regardless of its signature
    let Some(envelope) = envelope else {
        return true;
    };

    let sender = match envelope {
        Envelope::Keys(announcement) => announcement.address,
        Envelope::Msg(sealed) => sealed.address,
    };
    let Some(registry_entry) = shared.registry.lookup(&sender).await else {
        warn!(%sender, "signed entry from a wallet with no registry identity; dropping");
        return false;
    };

    let text = entry_signing_text(
        &entry.conversation_id,
        entry.conversation_index,
        &entry.content,
    );
    match recover_address(&personal_digest(&text), signature) {
        Ok(signer) if signer == registry_entry.messaging_address => true,
        Ok(signer) => {
            warn!(
                %sender,
                %signer,
                expected = %registry_entry.messaging_address,
                "entry signature recovered to the wrong key; dropping"
            );
            false
        }
        Err(err) => {
            warn!(%sender, %err, "unverifiable entry signature; dropping");
            false
        }
    }
}

/// Apply one in-sequence entry to engine state
///
/// Always advances the room's index bounds - the entry occupies its log
/// slot whether or not its content is usable - then processes the
/// content: `keys` envelopes feed the key set, `msg` envelopes decrypt
/// into emissions, undecodable or unverified content is skipped.
fn apply_entry(
    state: &mut State,
    entry: &LogEntry,
    envelope: Option<Envelope>,
    verified: bool,
    events: &broadcast::Sender<Event>,
) {
    let room_id = entry.conversation_id.clone();
    let index = entry.conversation_index;

    let Some(room) = state.rooms.get_mut(&room_id) else {
        return;
    };
    room.note_index(index);

    if !verified {
        return;
    }
    let Some(envelope) = envelope else {
        debug!(room = %room_id, index, "ignoring unknown envelope type");
        return;
    };

    match envelope {
        Envelope::Keys(announcement) => {
            let Some(binding) = state.binding.as_ref() else {
                return;
            };
            let recovered = decode_key_announcement(
                &announcement,
                &binding.wallet_address(),
                binding.keypair().secret_bytes(),
            );
            for key in recovered {
                if room.add_key(key) {
                    debug!(room = %room_id, index, "room key recovered from announcement");
                }
            }
        }
        Envelope::Msg(sealed) => match decode_message(&sealed, room.keys()) {
            MessageOutcome::Decrypted(msg) => {
                let hash = DecryptedMessage::hash_of(&room_id, index);
                let message = DecryptedMessage {
                    msg,
                    room_id: room_id.clone(),
                    index,
                    sender_address: sealed.address,
                    hash: hash.clone(),
                };
                room.record_message(message.clone());
                if state.emitted.insert(hash) {
                    let _ = events.send(Event::Message(message));
                }
            }
            MessageOutcome::Invalid => {
                debug!(room = %room_id, index, "decrypted payload failed the schema; dropped");
            }
            MessageOutcome::Undecryptable => {
                let hash = DecryptedMessage::hash_of(&room_id, index);
                if state.emitted_sealed.insert(hash.clone()) {
                    let _ = events.send(Event::Undecryptable(SealedRecord {
                        room_id: room_id.clone(),
                        index,
                        sender_address: sealed.address,
                        iv: sealed.iv,
                        ciphertext: sealed.ciphertext,
                        hash,
                    }));
                }
            }
        },
    }
}

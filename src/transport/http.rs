//! HTTP + WebSocket key-server client
//!
//! REST endpoints carry registry records and room logs; a persistent
//! WebSocket at `/message-events/<wallet>` streams appended entries as
//! JSON frames. The client is connection-oriented only at the stream:
//! every REST call is stateless.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{
    AccountRecord, ConversationHead, FeedEvent, KeyServer, LogEntry, TransportError,
    TransportResult,
};
use crate::crypto::Address;
use crate::room::RoomId;

/// Close code reported when the stream dies without a close frame
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Close code reported when a close frame carries no code
const NO_STATUS_CLOSE_CODE: u16 = 1005;

#[derive(Serialize)]
struct AccountPost<'a> {
    signature: &'a str,
    data: AccountData<'a>,
}

#[derive(Serialize)]
struct AccountData<'a> {
    address: &'a Address,
    msg: &'a str,
    pub_key: &'a str,
    ph: &'a str,
    phs: &'a str,
}

#[derive(Serialize)]
struct EntryPost<'a> {
    content: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<&'a str>,
}

/// Client for a key server speaking the HTTP + WebSocket protocol
pub struct HttpKeyServer {
    http: reqwest::Client,
    base: String,
    stream_base: String,
}

impl HttpKeyServer {
    /// Build a client for a key server base URL
    ///
    /// The stream URL is derived by swapping the scheme to `ws`/`wss`.
    /// Rejects empty or non-HTTP URLs up front.
    pub fn new(base_url: &str) -> TransportResult<Self> {
        let base = base_url.trim().trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(TransportError::ConnectionFailed(
                "key server URL is missing".to_string(),
            ));
        }

        let parsed = reqwest::Url::parse(&base)
            .map_err(|err| TransportError::ConnectionFailed(format!("bad key server URL: {err}")))?;
        let stream_base = match parsed.scheme() {
            "http" => format!("ws{}", &base["http".len()..]),
            "https" => format!("wss{}", &base["https".len()..]),
            other => {
                return Err(TransportError::ConnectionFailed(format!(
                    "unsupported key server scheme: {other}"
                )))
            }
        };

        Ok(HttpKeyServer {
            http: reqwest::Client::new(),
            base,
            stream_base,
        })
    }
}

#[async_trait]
impl KeyServer for HttpKeyServer {
    async fn fetch_account(&self, wallet: &Address) -> TransportResult<Option<AccountRecord>> {
        let response = self
            .http
            .get(format!("{}/accounts/{}", self.base, wallet))
            .send()
            .await
            .map_err(|err| TransportError::RequestFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Ok(None);
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|err| TransportError::InvalidData(err.to_string()))
    }

    async fn publish_account(
        &self,
        wallet: &Address,
        record: &AccountRecord,
    ) -> TransportResult<()> {
        let body = AccountPost {
            signature: &record.signature,
            data: AccountData {
                address: &record.address,
                msg: &record.msg,
                pub_key: &record.pub_key,
                ph: &record.ph,
                phs: &record.phs,
            },
        };

        let response = self
            .http
            .post(format!("{}/accounts/{}", self.base, wallet))
            .json(&body)
            .send()
            .await
            .map_err(|err| TransportError::RequestFailed(err.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::ServerStatus(response.status().as_u16()))
        }
    }

    async fn fetch_log(&self, room: &RoomId) -> TransportResult<Vec<LogEntry>> {
        let response = self
            .http
            .get(format!("{}/messages/{}", self.base, room))
            .send()
            .await
            .map_err(|err| TransportError::RequestFailed(err.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|err| TransportError::InvalidData(err.to_string())),
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(TransportError::ServerStatus(status.as_u16())),
        }
    }

    async fn append_entry(&self, entry: &LogEntry) -> TransportResult<()> {
        let body = EntryPost {
            content: &entry.content,
            signature: entry.signature.as_deref(),
        };

        let response = self
            .http
            .post(format!(
                "{}/messages/{}/{}",
                self.base, entry.conversation_id, entry.conversation_index
            ))
            .json(&body)
            .send()
            .await
            .map_err(|err| TransportError::RequestFailed(err.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(TransportError::IndexConflict),
            status => Err(TransportError::ServerStatus(status.as_u16())),
        }
    }

    async fn conversations(&self, wallet: &Address) -> TransportResult<Vec<ConversationHead>> {
        let response = self
            .http
            .get(format!("{}/conversations/{}", self.base, wallet))
            .send()
            .await
            .map_err(|err| TransportError::RequestFailed(err.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|err| TransportError::InvalidData(err.to_string())),
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(TransportError::ServerStatus(status.as_u16())),
        }
    }

    async fn subscribe(&self, wallet: &Address) -> TransportResult<mpsc::Receiver<FeedEvent>> {
        let url = format!("{}/message-events/{}", self.stream_base, wallet);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let (mut write, mut read) = ws.split();
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<LogEntry>(&text) {
                        Ok(entry) => {
                            if tx.send(FeedEvent::Entry(entry)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => debug!(%err, "skipping undecodable stream frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame
                            .map(|frame| u16::from(frame.code))
                            .unwrap_or(NO_STATUS_CLOSE_CODE);
                        let _ = tx.send(FeedEvent::Closed { code }).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(%err, "stream read failed");
                        let _ = tx
                            .send(FeedEvent::Closed {
                                code: ABNORMAL_CLOSE_CODE,
                            })
                            .await;
                        break;
                    }
                    None => {
                        let _ = tx
                            .send(FeedEvent::Closed {
                                code: ABNORMAL_CLOSE_CODE,
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}

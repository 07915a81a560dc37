//! Real-time session transport: at most one live WebSocket connection,
//! bound to one credential and one channel.
//!
//! Each connection gets a fresh [`ConnectionId`]. Its reader task tags every
//! inbound frame with that id before handing it to the router, so frames
//! that race with a close or a channel switch can be recognised as stale.

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use super::chat_types::{ChatChannel, Credential, InboundFrame, OutboundFrame};
use crate::error::{ChatError, Result};

/// Identity of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when the live connection drops without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Re-issue `connect` with the same credential and channel.
    Reconnect,
    /// Stay closed and report `TransportClosed`; the user must log in again.
    SurfaceAndRequireRelogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Transport notifications, each tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame {
        connection: ConnectionId,
        frame: InboundFrame,
    },
    Rejected {
        connection: ConnectionId,
        error: ChatError,
    },
    Closed {
        connection: ConnectionId,
        reason: String,
    },
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChatError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An opened duplex text link.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens links. The WebSocket implementation is [`WsConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, credential: &Credential, channel: &ChatChannel) -> Result<Link>;
}

// ── WebSocket connector ────────────────────────────────────────

pub struct WsConnector {
    endpoint: Url,
}

impl WsConnector {
    /// `endpoint` is the bare socket URL, e.g. `wss://host/ws`.
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }

    fn handshake_url(&self, credential: &Credential, channel: &ChatChannel) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("token", &credential.token)
            .append_pair("chat_name", channel.as_str());
        url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, credential: &Credential, channel: &ChatChannel) -> Result<Link> {
        let url = self.handshake_url(credential, channel);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChatError::TransportClosed(format!("WebSocket connect: {}", e)))?;
        let (write, read) = ws_stream.split();

        let sink = write
            .with(|text: String| async move {
                Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Text(text))
            })
            .sink_map_err(|e| ChatError::TransportClosed(format!("WebSocket send: {}", e)));

        let stream = read.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Close(frame)) => {
                    log::info!("WebSocket closed by server: {:?}", frame);
                    None
                }
                // Ping/pong are answered by tungstenite; binary is not part of the protocol.
                Ok(_) => None,
                Err(e) => Some(Err(ChatError::TransportClosed(e.to_string()))),
            }
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

// ── Session transport ──────────────────────────────────────────

struct ActiveConnection {
    id: ConnectionId,
    credential: Credential,
    channel: ChatChannel,
    outbound: mpsc::Sender<String>,
    reader: JoinHandle<()>,
}

struct TransportInner {
    state: TransportState,
    active: Option<ActiveConnection>,
    /// Bumped by every `close`/`connect`; a pending reconnect that sees a
    /// different value gives up.
    epoch: u64,
}

pub struct SessionTransport {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    max_reconnect_attempts: u32,
    outbound_buffer: usize,
    events: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<TransportInner>,
}

impl SessionTransport {
    /// Returns the transport and the receiver of its tagged events.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        max_reconnect_attempts: u32,
        outbound_buffer: usize,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            connector,
            policy,
            max_reconnect_attempts,
            outbound_buffer: outbound_buffer.max(1),
            events,
            inner: Mutex::new(TransportInner {
                state: TransportState::Disconnected,
                active: None,
                epoch: 0,
            }),
        };
        (transport, rx)
    }

    pub async fn state(&self) -> TransportState {
        self.inner.lock().await.state
    }

    pub async fn active_id(&self) -> Option<ConnectionId> {
        self.inner.lock().await.active.as_ref().map(|a| a.id)
    }

    pub async fn active_channel(&self) -> Option<ChatChannel> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.channel.clone())
    }

    /// Channel of `connection` if it is the live one.
    pub async fn channel_for(&self, connection: ConnectionId) -> Option<ChatChannel> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .filter(|a| a.id == connection)
            .map(|a| a.channel.clone())
    }

    pub async fn is_active(&self, connection: ConnectionId) -> bool {
        self.channel_for(connection).await.is_some()
    }

    /// Open a connection for `channel`, closing any existing one first.
    pub async fn connect(
        &self,
        credential: Credential,
        channel: ChatChannel,
    ) -> Result<ConnectionId> {
        let mut inner = self.inner.lock().await;
        Self::close_locked(&mut inner);
        self.open_locked(&mut inner, credential, channel).await
    }

    /// Close the live connection, if any. Its reader stops immediately.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        Self::close_locked(&mut inner);
    }

    pub async fn send(&self, frame: &OutboundFrame) -> Result<()> {
        let payload = frame.encode()?;
        let outbound = {
            let inner = self.inner.lock().await;
            match (&inner.state, &inner.active) {
                (TransportState::Connected, Some(active)) => active.outbound.clone(),
                _ => {
                    return Err(ChatError::TransportClosed(
                        "no live connection".to_string(),
                    ))
                }
            }
        };
        outbound
            .send(payload)
            .await
            .map_err(|_| ChatError::TransportClosed("connection writer stopped".to_string()))
    }

    /// Apply the close policy to an unexpected close of `connection`.
    ///
    /// Returns `Ok(None)` for a connection that is no longer live or when a
    /// `close`/`connect` supersedes the reconnect, `Ok(Some(id))` after a
    /// successful reconnect, and `TransportClosed` when the policy surfaces
    /// the failure or reconnecting gave up. The lock is not held while
    /// waiting between attempts.
    pub async fn handle_close(
        &self,
        connection: ConnectionId,
        reason: &str,
    ) -> Result<Option<ConnectionId>> {
        let (credential, channel, epoch) = {
            let mut inner = self.inner.lock().await;
            let dropped = match inner.active.take() {
                Some(active) if active.id == connection => active,
                other => {
                    inner.active = other;
                    return Ok(None);
                }
            };
            inner.state = TransportState::Closed;
            log::warn!(
                "Connection {} to {} dropped: {}",
                dropped.id,
                dropped.channel,
                reason
            );
            (dropped.credential, dropped.channel, inner.epoch)
        };

        match self.policy {
            ReconnectPolicy::SurfaceAndRequireRelogin => {
                Err(ChatError::TransportClosed(reason.to_string()))
            }
            ReconnectPolicy::Reconnect => {
                let mut last_error = ChatError::TransportClosed(reason.to_string());
                for attempt in 0..self.max_reconnect_attempts {
                    let delay = reconnect_backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let mut inner = self.inner.lock().await;
                    if inner.epoch != epoch {
                        log::info!("Reconnect to {} superseded", channel);
                        return Ok(None);
                    }
                    match self
                        .open_locked(&mut inner, credential.clone(), channel.clone())
                        .await
                    {
                        Ok(id) => return Ok(Some(id)),
                        Err(e) => {
                            log::warn!(
                                "Reconnect {}/{} to {} failed: {}",
                                attempt + 1,
                                self.max_reconnect_attempts,
                                channel,
                                e
                            );
                            last_error = e;
                        }
                    }
                }
                Err(last_error)
            }
        }
    }

    fn close_locked(inner: &mut TransportInner) {
        inner.epoch += 1;
        if let Some(active) = inner.active.take() {
            active.reader.abort();
            // Dropping `outbound` lets the writer flush and close the socket.
            drop(active.outbound);
            log::info!("Closed connection {} to {}", active.id, active.channel);
        }
        if inner.state != TransportState::Disconnected {
            inner.state = TransportState::Closed;
        }
    }

    async fn open_locked(
        &self,
        inner: &mut TransportInner,
        credential: Credential,
        channel: ChatChannel,
    ) -> Result<ConnectionId> {
        inner.state = TransportState::Connecting;
        let link = match self.connector.open(&credential, &channel).await {
            Ok(link) => link,
            Err(e) => {
                inner.state = TransportState::Closed;
                return Err(match e {
                    ChatError::TransportClosed(_) => e,
                    other => ChatError::TransportClosed(other.to_string()),
                });
            }
        };

        let id = ConnectionId::new();
        let (outbound, outbound_rx) = mpsc::channel(self.outbound_buffer);
        tokio::spawn(write_loop(id, link.sink, outbound_rx));
        let reader = tokio::spawn(read_loop(id, link.stream, self.events.clone()));

        log::info!(
            "Connected {} as {} to {}",
            id,
            credential.username,
            channel
        );
        inner.active = Some(ActiveConnection {
            id,
            credential,
            channel,
            outbound,
            reader,
        });
        inner.state = TransportState::Connected;
        Ok(id)
    }
}

/// 0s, 1s, 2s, 4s, then capped at 8s.
fn reconnect_backoff(attempt: u32) -> Duration {
    let secs = match attempt {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 4,
        _ => 8,
    };
    Duration::from_secs(secs)
}

async fn write_loop(id: ConnectionId, mut sink: FrameSink, mut rx: mpsc::Receiver<String>) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = sink.send(payload).await {
            log::error!("Connection {} write failed: {}", id, e);
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    id: ConnectionId,
    mut stream: FrameStream,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(raw)) => {
                let event = match InboundFrame::decode(&raw) {
                    Ok(frame) => TransportEvent::Frame {
                        connection: id,
                        frame,
                    },
                    Err(error) => TransportEvent::Rejected {
                        connection: id,
                        error,
                    },
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed by server".to_string(),
        }
    };
    let _ = events.send(TransportEvent::Closed {
        connection: id,
        reason,
    });
}

//! Turns tagged transport events into [`ChatEvent`]s.
//!
//! Events are handled one at a time in arrival order. Anything tagged with
//! a connection other than the live one is dropped.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use super::chat_transport::{SessionTransport, TransportEvent};
use super::chat_types::{
    ChatEvent, ChatMessage, InboundFrame, MessageBody, MessageKind, WireMessage,
};
use crate::crypto::cipher::{self, ChatKey};
use crate::crypto::key_manager::KeyManager;

/// Usernames currently online. Every snapshot replaces the whole set.
#[derive(Clone, Default)]
pub struct PresenceSet {
    users: Arc<RwLock<BTreeSet<String>>>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set and return the new contents, sorted.
    pub async fn replace(&self, users: Vec<String>) -> Vec<String> {
        let mut guard = self.users.write().await;
        *guard = users.into_iter().collect();
        guard.iter().cloned().collect()
    }

    pub async fn users(&self) -> Vec<String> {
        self.users.read().await.iter().cloned().collect()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.users.read().await.contains(username)
    }

    pub async fn clear(&self) {
        self.users.write().await.clear();
    }
}

pub struct MessageRouter {
    transport: Arc<SessionTransport>,
    keys: Arc<KeyManager>,
    presence: PresenceSet,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl MessageRouter {
    pub fn new(
        transport: Arc<SessionTransport>,
        keys: Arc<KeyManager>,
        presence: PresenceSet,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Self {
        Self {
            transport,
            keys,
            presence,
            events,
        }
    }

    /// Drain transport events until the transport side goes away.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            self.route(event).await;
        }
        log::debug!("Message router stopped");
    }

    pub async fn route(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame { connection, frame } => {
                let Some(channel) = self.transport.channel_for(connection).await else {
                    log::debug!("Dropping frame from stale connection {}", connection);
                    return;
                };
                match frame {
                    InboundFrame::PresenceSnapshot { users } => {
                        let users = self.presence.replace(users).await;
                        self.emit(ChatEvent::PresenceChanged { users });
                    }
                    InboundFrame::Message(wire) => {
                        let message = self.decode_live(&wire).await;
                        // Key lookup may have suspended across a switch.
                        if !self.transport.is_active(connection).await {
                            log::debug!("Connection {} closed while decoding; dropped", connection);
                            return;
                        }
                        self.emit(ChatEvent::Message { channel, message });
                    }
                }
            }
            TransportEvent::Rejected { connection, error } => {
                if self.transport.is_active(connection).await {
                    log::warn!("Rejected frame on {}: {}", connection, error);
                    self.emit(ChatEvent::FrameRejected {
                        error: error.to_string(),
                    });
                }
            }
            TransportEvent::Closed { connection, reason } => {
                let Some(channel) = self.transport.channel_for(connection).await else {
                    return;
                };
                match self.transport.handle_close(connection, &reason).await {
                    Ok(Some(_)) => self.emit(ChatEvent::Reconnected { channel }),
                    Ok(None) => {}
                    Err(e) => {
                        self.presence.clear().await;
                        self.emit(ChatEvent::ConnectionLost {
                            channel,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Decode a page of history, fetching the key at most once.
    pub async fn decode_history(&self, page: &[WireMessage]) -> Vec<ChatMessage> {
        let needs_key = page.iter().any(|m| m.kind == MessageKind::Text);
        let key = if needs_key { self.key_or_report().await } else { None };
        page.iter().map(|m| decode_with(m, key.as_ref())).collect()
    }

    async fn decode_live(&self, wire: &WireMessage) -> ChatMessage {
        let key = match wire.kind {
            MessageKind::Text => self.key_or_report().await,
            MessageKind::File => None,
        };
        decode_with(wire, key.as_ref())
    }

    async fn key_or_report(&self) -> Option<ChatKey> {
        match self.keys.get_key().await {
            Ok(key) => Some(key),
            Err(e) => {
                log::error!("No chat key for decryption: {}", e);
                self.emit(ChatEvent::KeyUnavailable {
                    error: e.to_string(),
                });
                None
            }
        }
    }

    fn emit(&self, event: ChatEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Chat event receiver dropped");
        }
    }
}

fn decode_with(wire: &WireMessage, key: Option<&ChatKey>) -> ChatMessage {
    let body = match (wire.kind, key) {
        (MessageKind::File, _) => MessageBody::File(wire.text.clone()),
        (MessageKind::Text, None) => MessageBody::Undecryptable,
        (MessageKind::Text, Some(key)) => match cipher::decrypt_text(&wire.text, key) {
            Ok(text) => MessageBody::Text(text),
            Err(e) => {
                log::warn!("Message from {} did not decrypt: {}", wire.username, e);
                MessageBody::Undecryptable
            }
        },
    };
    ChatMessage {
        sender: wire.username.clone(),
        timestamp: wire.timestamp(),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_manager::{derive_key, KeySource};
    use crate::crypto::key_store::SessionKeyCache;
    use crate::error::ChatError;
    use crate::services::chat_api::MockChatApi;
    use crate::services::chat_transport::testing::MemoryConnector;
    use crate::services::chat_transport::{ConnectionId, ReconnectPolicy};
    use crate::services::chat_types::{ChatChannel, Credential};

    const SEED: &str = "router-test-seed";

    struct Harness {
        transport: Arc<SessionTransport>,
        keys: Arc<KeyManager>,
        presence: PresenceSet,
        router: MessageRouter,
        events: mpsc::UnboundedReceiver<ChatEvent>,
    }

    async fn harness(policy: ReconnectPolicy) -> Harness {
        let connector = Arc::new(MemoryConnector::default());
        let (transport, _rx) = SessionTransport::new(connector, policy, 1, 8);
        let transport = Arc::new(transport);
        let keys = Arc::new(KeyManager::new(
            KeySource::Derived {
                seed: SEED.to_string(),
            },
            Arc::new(MockChatApi::new()),
            SessionKeyCache::new(),
        ));
        keys.attach(Credential::new("tok", "alice")).await;
        let presence = PresenceSet::new();
        let (tx, events) = mpsc::unbounded_channel();
        let router = MessageRouter::new(transport.clone(), keys.clone(), presence.clone(), tx);
        Harness {
            transport,
            keys,
            presence,
            router,
            events,
        }
    }

    async fn connect(h: &Harness, channel: ChatChannel) -> ConnectionId {
        h.transport
            .connect(Credential::new("tok", "alice"), channel)
            .await
            .unwrap()
    }

    fn text_frame(connection: ConnectionId, from: &str, body: &str) -> TransportEvent {
        let envelope = cipher::encrypt_text(body, &derive_key(SEED)).unwrap();
        let raw = serde_json::json!({"type": "text", "username": from, "text": envelope});
        TransportEvent::Frame {
            connection,
            frame: InboundFrame::decode(&raw.to_string()).unwrap(),
        }
    }

    fn presence_frame(connection: ConnectionId, users: &[&str]) -> TransportEvent {
        TransportEvent::Frame {
            connection,
            frame: InboundFrame::PresenceSnapshot {
                users: users.iter().map(|u| u.to_string()).collect(),
            },
        }
    }

    #[tokio::test]
    async fn test_presence_is_replaced_not_merged() {
        let mut h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let id = connect(&h, ChatChannel::global()).await;

        h.router.route(presence_frame(id, &["b", "a"])).await;
        h.router.route(presence_frame(id, &["a"])).await;

        assert_eq!(
            h.events.recv().await.unwrap(),
            ChatEvent::PresenceChanged {
                users: vec!["a".into(), "b".into()]
            }
        );
        assert_eq!(
            h.events.recv().await.unwrap(),
            ChatEvent::PresenceChanged {
                users: vec!["a".into()]
            }
        );
        assert_eq!(h.presence.users().await, vec!["a".to_string()]);
        assert!(!h.presence.contains("b").await);
    }

    #[tokio::test]
    async fn test_text_is_decrypted_and_order_preserved() {
        let mut h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let channel = ChatChannel::private("bob", "alice");
        let id = connect(&h, channel.clone()).await;

        h.router.route(text_frame(id, "bob", "first")).await;
        h.router.route(text_frame(id, "bob", "second")).await;

        for expected in ["first", "second"] {
            match h.events.recv().await.unwrap() {
                ChatEvent::Message { channel: c, message } => {
                    assert_eq!(c, channel);
                    assert_eq!(message.sender, "bob");
                    assert_eq!(message.body, MessageBody::Text(expected.to_string()));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_undecryptable_message_does_not_stop_processing() {
        let mut h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let id = connect(&h, ChatChannel::global()).await;

        let foreign = cipher::encrypt_text("secret", &ChatKey::generate()).unwrap();
        let raw = serde_json::json!({"type": "text", "username": "mallory", "text": foreign});
        h.router
            .route(TransportEvent::Frame {
                connection: id,
                frame: InboundFrame::decode(&raw.to_string()).unwrap(),
            })
            .await;
        h.router.route(text_frame(id, "bob", "after")).await;

        match h.events.recv().await.unwrap() {
            ChatEvent::Message { message, .. } => {
                assert_eq!(message.sender, "mallory");
                assert_eq!(message.body, MessageBody::Undecryptable);
            }
            other => panic!("unexpected {:?}", other),
        }
        match h.events.recv().await.unwrap() {
            ChatEvent::Message { message, .. } => {
                assert_eq!(message.body, MessageBody::Text("after".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_reference_passes_through() {
        let mut h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let id = connect(&h, ChatChannel::global()).await;
        let raw = r#"{"type":"file","username":"bob","text":"/uploads/cat.png"}"#;
        h.router
            .route(TransportEvent::Frame {
                connection: id,
                frame: InboundFrame::decode(raw).unwrap(),
            })
            .await;

        match h.events.recv().await.unwrap() {
            ChatEvent::Message { message, .. } => {
                assert_eq!(message.body, MessageBody::File("/uploads/cat.png".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_connection_frames_are_dropped() {
        let mut h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let old = connect(&h, ChatChannel::global()).await;
        let current = connect(&h, ChatChannel::private("alice", "bob")).await;

        h.router.route(text_frame(old, "carol", "late")).await;
        h.router.route(presence_frame(old, &["carol"])).await;
        h.router
            .route(TransportEvent::Rejected {
                connection: old,
                error: ChatError::InvalidFrame("x".into()),
            })
            .await;
        h.router.route(text_frame(current, "bob", "fresh")).await;

        match h.events.recv().await.unwrap() {
            ChatEvent::Message { channel, message } => {
                assert_eq!(channel.as_str(), "private_alice_bob");
                assert_eq!(message.body, MessageBody::Text("fresh".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.events.try_recv().is_err());
        assert!(h.presence.users().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_reports_key_unavailable() {
        let mut h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let id = connect(&h, ChatChannel::global()).await;
        h.keys.invalidate().await;

        h.router.route(text_frame(id, "bob", "hi")).await;

        assert!(matches!(
            h.events.recv().await.unwrap(),
            ChatEvent::KeyUnavailable { .. }
        ));
        match h.events.recv().await.unwrap() {
            ChatEvent::Message { message, .. } => {
                assert_eq!(message.body, MessageBody::Undecryptable)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_frame_surfaces_for_live_connection() {
        let mut h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let id = connect(&h, ChatChannel::global()).await;
        h.router
            .route(TransportEvent::Rejected {
                connection: id,
                error: ChatError::InvalidFrame("unknown frame type".into()),
            })
            .await;
        assert!(matches!(
            h.events.recv().await.unwrap(),
            ChatEvent::FrameRejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_surfaces_connection_lost() {
        let mut h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let id = connect(&h, ChatChannel::global()).await;
        h.presence.replace(vec!["bob".into()]).await;

        h.router
            .route(TransportEvent::Closed {
                connection: id,
                reason: "reset".into(),
            })
            .await;

        match h.events.recv().await.unwrap() {
            ChatEvent::ConnectionLost { channel, .. } => assert!(channel.is_global()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.presence.users().await.is_empty());
        assert!(h.transport.active_id().await.is_none());
    }

    #[tokio::test]
    async fn test_close_with_reconnect_policy() {
        let mut h = harness(ReconnectPolicy::Reconnect).await;
        let id = connect(&h, ChatChannel::global()).await;

        h.router
            .route(TransportEvent::Closed {
                connection: id,
                reason: "reset".into(),
            })
            .await;

        assert_eq!(
            h.events.recv().await.unwrap(),
            ChatEvent::Reconnected {
                channel: ChatChannel::global()
            }
        );
        let new_id = h.transport.active_id().await.unwrap();
        assert_ne!(new_id, id);
    }

    #[tokio::test]
    async fn test_history_decodes_with_one_key_lookup() {
        let h = harness(ReconnectPolicy::SurfaceAndRequireRelogin).await;
        let key = derive_key(SEED);
        let page: Vec<WireMessage> = vec![
            serde_json::from_value(serde_json::json!({
                "type": "text", "username": "bob",
                "text": cipher::encrypt_text("one", &key).unwrap(),
                "timestamp": "2024-03-01 10:00:00.0"
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "type": "file", "username": "alice", "text": "/uploads/doc.pdf"
            }))
            .unwrap(),
        ];

        let decoded = h.router.decode_history(&page).await;
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].body, MessageBody::Text("one".to_string()));
        assert!(decoded[0].timestamp.is_some());
        assert_eq!(decoded[1].body, MessageBody::File("/uploads/doc.pdf".to_string()));
    }
}

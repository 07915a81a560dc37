//! Session controller: login, channel switching, sending and logout.
//!
//! Owns the key manager, the transport and the router task. Channel
//! switches hold the channel lock for their whole close/history/connect
//! sequence, so a second switch starts only after the first is done.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::chat_api::ChatApi;
use super::chat_router::{MessageRouter, PresenceSet};
use super::chat_transport::{
    ConnectionId, Connector, ReconnectPolicy, SessionTransport, TransportState,
};
use super::chat_types::{ChatChannel, ChatEvent, Credential, OutboundFrame};
use super::config::ClientConfig;
use super::credential_store::CredentialStore;
use crate::crypto::cipher;
use crate::crypto::key_manager::{KeyManager, KeySource};
use crate::crypto::key_store::SessionKeyCache;
use crate::error::{ChatError, Result};

/// Tunables taken from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ChatServiceOptions {
    pub key_source: KeySource,
    pub reconnect_policy: ReconnectPolicy,
    pub max_reconnect_attempts: u32,
    pub outbound_buffer: usize,
}

impl ChatServiceOptions {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            key_source: config.key_source()?,
            reconnect_policy: config.reconnect_policy,
            max_reconnect_attempts: config.max_reconnect_attempts,
            outbound_buffer: config.outbound_buffer,
        })
    }
}

impl Default for ChatServiceOptions {
    fn default() -> Self {
        Self {
            key_source: KeySource::Server,
            reconnect_policy: ReconnectPolicy::SurfaceAndRequireRelogin,
            max_reconnect_attempts: 3,
            outbound_buffer: 64,
        }
    }
}

pub struct ChatService {
    api: Arc<dyn ChatApi>,
    keys: Arc<KeyManager>,
    transport: Arc<SessionTransport>,
    router: Arc<MessageRouter>,
    presence: PresenceSet,
    credentials: CredentialStore,
    session: RwLock<Option<Credential>>,
    /// Current channel. Held for the duration of a switch.
    channel: Mutex<ChatChannel>,
    events: mpsc::UnboundedSender<ChatEvent>,
    router_task: JoinHandle<()>,
}

impl ChatService {
    /// Build the service and start its router. Must be called inside a
    /// tokio runtime. The receiver yields every event for the UI.
    pub fn new(
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
        credentials: CredentialStore,
        options: ChatServiceOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let keys = Arc::new(KeyManager::new(
            options.key_source,
            api.clone(),
            SessionKeyCache::new(),
        ));
        let (transport, transport_rx) = SessionTransport::new(
            connector,
            options.reconnect_policy,
            options.max_reconnect_attempts,
            options.outbound_buffer,
        );
        let transport = Arc::new(transport);
        let presence = PresenceSet::new();
        let (events, events_rx) = mpsc::unbounded_channel();

        let router = Arc::new(MessageRouter::new(
            transport.clone(),
            keys.clone(),
            presence.clone(),
            events.clone(),
        ));
        let router_task = tokio::spawn(router.clone().run(transport_rx));

        let service = Self {
            api,
            keys,
            transport,
            router,
            presence,
            credentials,
            session: RwLock::new(None),
            channel: Mutex::new(ChatChannel::global()),
            events,
            router_task,
        };
        (service, events_rx)
    }

    /// Exchange username and password for a token, then start the session.
    pub async fn login(&self, username: &str, password: &str) -> Result<ConnectionId> {
        let token = self.api.fetch_token(username, password).await?;
        log::info!("Logged in as {}", username);
        self.establish(Credential::new(token, username)).await
    }

    /// Resume the saved session, if any. Returns `Ok(None)` when nothing is saved.
    pub async fn restore(&self) -> Result<Option<ConnectionId>> {
        let Some(credential) = self.credentials.load()? else {
            return Ok(None);
        };
        log::info!("Restoring session for {}", credential.username);
        self.establish(credential).await.map(Some)
    }

    async fn establish(&self, credential: Credential) -> Result<ConnectionId> {
        *self.session.write().await = Some(credential.clone());
        self.keys.attach(credential.clone()).await;

        if let Err(e) = self.keys.get_key().await {
            log::error!("Could not obtain chat key: {}", e);
            self.logout().await;
            return Err(e);
        }
        if let Err(e) = self.credentials.save(&credential) {
            log::warn!("Session will not survive restart: {}", e);
        }

        let channel = self.channel.lock().await.clone();
        self.switch_channel(channel).await
    }

    /// Tear down the current connection, load history for `target`, then
    /// connect to it.
    pub async fn switch_channel(&self, target: ChatChannel) -> Result<ConnectionId> {
        let mut current = self.channel.lock().await;
        let credential = self
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| ChatError::Auth("not logged in".to_string()))?;

        self.transport.close().await;
        *current = target.clone();
        log::info!("Switching to {}", target);

        self.load_history(&target, &credential).await;
        self.transport.connect(credential, target).await
    }

    /// Switch to the private room shared with `peer`.
    pub async fn open_private_chat(&self, peer: &str) -> Result<ConnectionId> {
        let me = self
            .username()
            .await
            .ok_or_else(|| ChatError::Auth("not logged in".to_string()))?;
        self.switch_channel(ChatChannel::private(&me, peer)).await
    }

    /// Encrypt and send on the live connection. Nothing is queued on failure.
    pub async fn send_text(&self, plaintext: &str) -> Result<()> {
        let key = self.keys.get_key().await?;
        let channel = self.live_channel().await?;
        let envelope = cipher::encrypt_text(plaintext, &key)?;
        self.transport
            .send(&OutboundFrame::text(envelope, &channel))
            .await
    }

    /// Send a file URL as-is.
    pub async fn send_file_reference(&self, url: &str) -> Result<()> {
        let channel = self.live_channel().await?;
        self.transport
            .send(&OutboundFrame::file(url.to_string(), &channel))
            .await
    }

    pub async fn logout(&self) {
        let mut current = self.channel.lock().await;
        self.keys.invalidate().await;
        self.transport.close().await;
        self.presence.clear().await;
        *current = ChatChannel::global();

        if let Some(credential) = self.session.write().await.take() {
            log::info!("Logged out {}", credential.username);
        }
        if let Err(e) = self.credentials.clear() {
            log::warn!("Could not remove saved credentials: {}", e);
        }
    }

    pub async fn current_channel(&self) -> ChatChannel {
        self.channel.lock().await.clone()
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.presence.users().await
    }

    pub async fn username(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|c| c.username.clone())
    }

    pub async fn transport_state(&self) -> TransportState {
        self.transport.state().await
    }

    async fn live_channel(&self) -> Result<ChatChannel> {
        self.transport
            .active_channel()
            .await
            .ok_or_else(|| ChatError::TransportClosed("not connected".to_string()))
    }

    async fn load_history(&self, channel: &ChatChannel, credential: &Credential) {
        let event = match self.api.fetch_history(channel, &credential.token).await {
            Ok(page) => ChatEvent::History {
                channel: channel.clone(),
                messages: self.router.decode_history(&page).await,
            },
            Err(e) => {
                log::warn!("History for {} unavailable: {}", channel, e);
                ChatEvent::HistoryFetchFailed {
                    channel: channel.clone(),
                    error: e.to_string(),
                }
            }
        };
        let _ = self.events.send(event);
    }
}

impl Drop for ChatService {
    fn drop(&mut self) {
        self.router_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::ChatKey;
    use crate::services::chat_api::MockChatApi;
    use crate::services::chat_transport::testing::{settle, MemoryConnector};
    use crate::services::chat_types::MessageBody;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        service: ChatService,
        events: mpsc::UnboundedReceiver<ChatEvent>,
        connector: Arc<MemoryConnector>,
        key: ChatKey,
        dir: TempDir,
    }

    fn mock_api(key: &ChatKey) -> MockChatApi {
        let mut api = MockChatApi::new();
        api.expect_fetch_token()
            .returning(|username, _| Ok(format!("tok-{}", username)));
        let served = key.clone();
        api.expect_fetch_key()
            .returning(move |_| Ok(served.clone()));
        api.expect_fetch_history().returning(|_, _| Ok(vec![]));
        api
    }

    fn harness_with(api: MockChatApi, key: ChatKey) -> Harness {
        harness_opts(api, key, ChatServiceOptions::default())
    }

    fn harness_opts(api: MockChatApi, key: ChatKey, options: ChatServiceOptions) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MemoryConnector::default());
        let (service, events) = ChatService::new(
            Arc::new(api),
            connector.clone(),
            CredentialStore::new(dir.path()).unwrap(),
            options,
        );
        Harness {
            service,
            events,
            connector,
            key,
            dir,
        }
    }

    fn harness() -> Harness {
        let key = ChatKey::generate();
        harness_with(mock_api(&key), key)
    }

    async fn next_event(h: &mut Harness) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(2), h.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_login_connects_to_global_with_history_first() {
        let mut h = harness();
        h.service.login("alice", "pw").await.unwrap();

        assert_eq!(
            next_event(&mut h).await,
            ChatEvent::History {
                channel: ChatChannel::global(),
                messages: vec![]
            }
        );
        assert_eq!(h.service.transport_state().await, TransportState::Connected);
        assert_eq!(h.service.username().await.as_deref(), Some("alice"));

        let links = h.connector.links.lock().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].credential.token, "tok-alice");
        assert!(links[0].channel.is_global());
        drop(links);

        let saved = CredentialStore::new(h.dir.path()).unwrap().load().unwrap();
        assert_eq!(saved, Some(Credential::new("tok-alice", "alice")));
    }

    #[tokio::test]
    async fn test_send_text_is_encrypted_for_live_channel() {
        let h = harness();
        h.service.login("alice", "pw").await.unwrap();
        h.service.send_text("hello bob").await.unwrap();
        settle().await;

        let sent = h.connector.sent(0);
        assert_eq!(sent.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["type"], "text");
        assert_eq!(frame["chat_name"], "global");
        let envelope = frame["text"].as_str().unwrap();
        assert!(!envelope.contains("hello bob"));
        assert_eq!(cipher::decrypt_text(envelope, &h.key).unwrap(), "hello bob");
    }

    #[tokio::test]
    async fn test_send_file_reference_is_unmodified() {
        let h = harness();
        h.service.login("alice", "pw").await.unwrap();
        h.service
            .send_file_reference("/uploads/report.pdf")
            .await
            .unwrap();
        settle().await;

        let frame: serde_json::Value = serde_json::from_str(&h.connector.sent(0)[0]).unwrap();
        assert_eq!(frame["type"], "file");
        assert_eq!(frame["text"], "/uploads/report.pdf");
    }

    #[tokio::test]
    async fn test_send_fails_without_dependencies() {
        let h = harness();
        assert!(matches!(
            h.service.send_text("hi").await,
            Err(ChatError::KeyUnavailable(_))
        ));

        h.service.login("alice", "pw").await.unwrap();
        h.service.transport.close().await;
        assert!(matches!(
            h.service.send_text("hi").await,
            Err(ChatError::TransportClosed(_))
        ));
        assert!(matches!(
            h.service.send_file_reference("/uploads/x").await,
            Err(ChatError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_switches_are_serialized() {
        let h = harness();
        h.service.login("alice", "pw").await.unwrap();

        let x = ChatChannel::private("alice", "bob");
        let y = ChatChannel::private("alice", "carol");
        let (first, second) = tokio::join!(
            h.service.switch_channel(x.clone()),
            h.service.switch_channel(y.clone())
        );
        let first = first.unwrap();
        let second = second.unwrap();
        settle().await;

        assert_eq!(h.service.current_channel().await, y);
        assert!(!h.service.transport.is_active(first).await);
        assert!(h.service.transport.is_active(second).await);
        assert_eq!(h.connector.opened(), 3);
        assert_eq!(h.connector.live_count(), 1);
    }

    #[tokio::test]
    async fn test_open_private_chat_uses_canonical_id() {
        let h = harness();
        h.service.login("bob", "pw").await.unwrap();
        h.service.open_private_chat("alice").await.unwrap();

        assert_eq!(h.service.current_channel().await.as_str(), "private_alice_bob");
        let links = h.connector.links.lock().unwrap();
        assert_eq!(links[1].channel.as_str(), "private_alice_bob");
    }

    #[tokio::test]
    async fn test_inbound_message_reaches_events() {
        let mut h = harness();
        h.service.login("alice", "pw").await.unwrap();
        let _history = next_event(&mut h).await;

        let envelope = cipher::encrypt_text("hi alice", &h.key).unwrap();
        let raw = serde_json::json!({"type": "text", "username": "bob", "text": envelope});
        h.connector.push(0, &raw.to_string());
        h.connector
            .push(0, r#"{"type":"online_users","users":["alice","bob"]}"#);

        match next_event(&mut h).await {
            ChatEvent::Message { message, .. } => {
                assert_eq!(message.body, MessageBody::Text("hi alice".to_string()))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            next_event(&mut h).await,
            ChatEvent::PresenceChanged { .. }
        ));
        assert_eq!(
            h.service.online_users().await,
            vec!["alice".to_string(), "bob".to_string()]
        );
    }

    #[tokio::test]
    async fn test_logout_resets_session() {
        let mut h = harness();
        h.service.login("alice", "pw").await.unwrap();
        h.service.open_private_chat("bob").await.unwrap();
        h.connector.push(1, r#"{"type":"online_users","users":["bob"]}"#);
        while !matches!(next_event(&mut h).await, ChatEvent::PresenceChanged { .. }) {}

        h.service.logout().await;

        assert_eq!(h.service.current_channel().await, ChatChannel::global());
        assert!(h.service.online_users().await.is_empty());
        assert_eq!(h.service.transport_state().await, TransportState::Closed);
        assert!(h.service.username().await.is_none());
        assert!(CredentialStore::new(h.dir.path())
            .unwrap()
            .load()
            .unwrap()
            .is_none());
        assert!(matches!(
            h.service.send_text("still there?").await,
            Err(ChatError::KeyUnavailable(_))
        ));

        // Idempotent.
        h.service.logout().await;
    }

    #[tokio::test]
    async fn test_logout_while_reconnecting_is_prompt() {
        let key = ChatKey::generate();
        let mut h = harness_opts(
            mock_api(&key),
            key,
            ChatServiceOptions {
                reconnect_policy: ReconnectPolicy::Reconnect,
                max_reconnect_attempts: 3,
                ..ChatServiceOptions::default()
            },
        );
        h.service.login("alice", "pw").await.unwrap();
        next_event(&mut h).await;

        h.connector
            .refuse
            .store(1, std::sync::atomic::Ordering::SeqCst);
        h.connector.links.lock().unwrap()[0].hang_up();
        // Immediate retry is refused; the router is now waiting out the backoff.
        settle().await;

        let started = std::time::Instant::now();
        h.service.logout().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(h.service.transport_state().await, TransportState::Closed);

        // The backoff expires without a reconnect.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(h.service.transport_state().await, TransportState::Closed);
        assert_eq!(h.connector.opened(), 1);
        assert!(!matches!(
            h.events.try_recv(),
            Ok(ChatEvent::Reconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_failure_does_not_block_connect() {
        let key = ChatKey::generate();
        let mut api = MockChatApi::new();
        api.expect_fetch_token()
            .returning(|_, _| Ok("tok".to_string()));
        let served = key.clone();
        api.expect_fetch_key()
            .returning(move |_| Ok(served.clone()));
        api.expect_fetch_history()
            .returning(|_, _| Err(ChatError::HistoryFetchFailed("HTTP 500".to_string())));
        let mut h = harness_with(api, key);

        h.service.login("alice", "pw").await.unwrap();
        assert!(matches!(
            next_event(&mut h).await,
            ChatEvent::HistoryFetchFailed { .. }
        ));
        assert_eq!(h.service.transport_state().await, TransportState::Connected);
    }

    #[tokio::test]
    async fn test_login_without_key_logs_out() {
        let mut api = MockChatApi::new();
        api.expect_fetch_token()
            .returning(|_, _| Ok("tok".to_string()));
        api.expect_fetch_key()
            .returning(|_| Err(ChatError::Auth("HTTP 401".to_string())));
        let h = harness_with(api, ChatKey::generate());

        let err = h.service.login("alice", "pw").await.unwrap_err();
        assert!(matches!(err, ChatError::KeyUnavailable(_)));
        assert_eq!(h.connector.opened(), 0);
        assert!(h.service.username().await.is_none());
    }

    #[tokio::test]
    async fn test_restore_uses_saved_credential() {
        let h = harness();
        assert_eq!(h.service.restore().await.unwrap(), None);

        CredentialStore::new(h.dir.path())
            .unwrap()
            .save(&Credential::new("saved-token", "alice"))
            .unwrap();
        assert!(h.service.restore().await.unwrap().is_some());

        let links = h.connector.links.lock().unwrap();
        assert_eq!(links[0].credential.token, "saved-token");
    }

    #[tokio::test]
    async fn test_switch_requires_login() {
        let h = harness();
        assert!(matches!(
            h.service.switch_channel(ChatChannel::global()).await,
            Err(ChatError::Auth(_))
        ));
    }
}

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::services::{
    ChatEvent, ChatService, ChatServiceOptions, ClientConfig, CredentialStore, HttpChatApi,
    WsConnector,
};

/// Application state assembled from configuration.
pub struct AppState {
    pub config: ClientConfig,
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// Wire the HTTP API, WebSocket connector and credential store into a
    /// [`ChatService`]. Must be called inside a tokio runtime.
    pub fn from_config(config: ClientConfig) -> Result<(Self, mpsc::UnboundedReceiver<ChatEvent>)> {
        config.validate()?;
        let data_dir = config.data_dir();

        log::info!(
            "Initializing chat client: server={}, key_mode={:?}, reconnect={:?}, data_dir={}",
            config.server_url,
            config.key_mode,
            config.reconnect_policy,
            data_dir.display()
        );

        let api = HttpChatApi::new(config.api_base()?, config.request_timeout())?;
        let connector = WsConnector::new(config.ws_url()?);
        let credentials = CredentialStore::new(&data_dir)?;
        let options = ChatServiceOptions::from_config(&config)?;

        let (chat, events) =
            ChatService::new(Arc::new(api), Arc::new(connector), credentials, options);

        Ok((
            Self {
                config,
                chat: Arc::new(chat),
            },
            events,
        ))
    }
}

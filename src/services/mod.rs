// Service layer - HTTP collaborators, transport, routing and the session controller

pub mod chat_api;
pub mod chat_router;
pub mod chat_service;
pub mod chat_transport;
pub mod chat_types;
pub mod config;
pub mod credential_store;

pub use chat_api::{ChatApi, HttpChatApi};
pub use chat_router::{MessageRouter, PresenceSet};
pub use chat_service::{ChatService, ChatServiceOptions};
pub use chat_transport::{
    ConnectionId, Connector, Link, ReconnectPolicy, SessionTransport, TransportEvent,
    TransportState, WsConnector,
};
pub use chat_types::{
    ChatChannel, ChatEvent, ChatMessage, Credential, InboundFrame, MessageBody, MessageKind,
    OutboundFrame, WireMessage,
};
pub use config::{ClientConfig, KeyMode};
pub use credential_store::CredentialStore;

use thiserror::Error;

/// Errors produced by the chat client core.
///
/// Variants carry string context so a single failure can be cloned and
/// handed to every caller waiting on a shared key fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// No credential, key fetch failed, or the key was invalidated.
    #[error("Chat key unavailable: {0}")]
    KeyUnavailable(String),

    /// Wrong key, tampered ciphertext, or malformed envelope.
    #[error("Message could not be decrypted")]
    DecryptionFailed,

    /// The real-time connection is gone (or was never opened).
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("History fetch failed: {0}")]
    HistoryFetchFailed(String),

    /// Login rejected by the server.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Inbound frame that does not match the wire protocol.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

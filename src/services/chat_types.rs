use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

// ── Channels & credentials ─────────────────────────────────────

/// Logical room identifier: `"global"` or a canonical private-pair id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatChannel(String);

impl ChatChannel {
    pub const GLOBAL: &'static str = "global";
    const PRIVATE_PREFIX: &'static str = "private_";

    pub fn global() -> Self {
        Self(Self::GLOBAL.to_string())
    }

    /// Private channel for two users. Both sides compute the same id
    /// regardless of who opens the chat.
    pub fn private(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}{}_{}", Self::PRIVATE_PREFIX, lo, hi))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0 == Self::GLOBAL
    }
}

impl Default for ChatChannel {
    fn default() -> Self {
        Self::global()
    }
}

impl std::fmt::Display for ChatChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bearer token plus the username it was issued for.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub username: String,
}

impl Credential {
    pub fn new(token: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            username: username.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("username", &self.username)
            .finish()
    }
}

// ── Wire protocol types ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
}

/// A chat message as carried on the socket and in history responses.
///
/// `text` holds the envelope JSON for text messages and the file URL for
/// file messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub username: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
}

impl WireMessage {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// Inbound socket frame, decoded into a closed set of variants.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    PresenceSnapshot { users: Vec<String> },
    Message(WireMessage),
}

#[derive(Deserialize)]
struct PresenceFrame {
    users: Vec<String>,
}

impl InboundFrame {
    /// Decode a raw JSON frame. Unknown or missing discriminants are rejected.
    pub fn decode(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ChatError::InvalidFrame(format!("not JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let discriminant = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ChatError::InvalidFrame("missing \"type\"".to_string()))?
            .to_string();

        match discriminant.as_str() {
            "online_users" => {
                let frame: PresenceFrame = serde_json::from_value(value)
                    .map_err(|e| ChatError::InvalidFrame(format!("online_users: {}", e)))?;
                Ok(InboundFrame::PresenceSnapshot { users: frame.users })
            }
            "text" | "file" => {
                let msg: WireMessage = serde_json::from_value(value)
                    .map_err(|e| ChatError::InvalidFrame(format!("{}: {}", discriminant, e)))?;
                Ok(InboundFrame::Message(msg))
            }
            other => Err(ChatError::InvalidFrame(format!(
                "unknown frame type \"{}\"",
                other
            ))),
        }
    }
}

/// Frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub text: String,
    pub chat_name: String,
}

impl OutboundFrame {
    pub fn text(envelope_json: String, channel: &ChatChannel) -> Self {
        Self {
            kind: MessageKind::Text,
            text: envelope_json,
            chat_name: channel.as_str().to_string(),
        }
    }

    pub fn file(url: String, channel: &ChatChannel) -> Self {
        Self {
            kind: MessageKind::File,
            text: url,
            chat_name: channel.as_str().to_string(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ChatError::InvalidFrame(format!("encode outbound: {}", e)))
    }
}

/// Parse a server timestamp: epoch milliseconds, RFC 3339, or the server's
/// naive UTC `YYYY-MM-DD HH:MM:SS.ffffff`.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        serde_json::Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

// ── Events delivered to the rendering layer ────────────────────

/// What a decoded message shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum MessageBody {
    Text(String),
    File(String),
    /// Placeholder for a text message that failed authentication.
    Undecryptable,
}

/// A message ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum ChatEvent {
    PresenceChanged {
        users: Vec<String>,
    },
    Message {
        channel: ChatChannel,
        message: ChatMessage,
    },
    History {
        channel: ChatChannel,
        messages: Vec<ChatMessage>,
    },
    HistoryFetchFailed {
        channel: ChatChannel,
        error: String,
    },
    /// The key could not be obtained while decrypting; callers usually log out.
    KeyUnavailable {
        error: String,
    },
    FrameRejected {
        error: String,
    },
    Reconnected {
        channel: ChatChannel,
    },
    /// Connection dropped and the close policy requires a fresh login.
    ConnectionLost {
        channel: ChatChannel,
        error: String,
    },
}

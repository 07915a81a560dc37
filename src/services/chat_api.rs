//! Typed wrappers over the chat server's HTTP endpoints.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::chat_types::{ChatChannel, WireMessage};
use crate::crypto::cipher::ChatKey;
use crate::error::{ChatError, Result};

/// HTTP collaborators consumed by the session core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /login/` → bearer token.
    async fn fetch_token(&self, username: &str, password: &str) -> Result<String>;

    /// `GET /chat/key`. Rejected credentials surface as [`ChatError::Auth`].
    async fn fetch_key(&self, token: &str) -> Result<ChatKey>;

    /// `GET /messages/?chat_id=<channel>`.
    async fn fetch_history(&self, channel: &ChatChannel, token: &str) -> Result<Vec<WireMessage>>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct KeyResponse {
    key: Option<String>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    messages: Vec<serde_json::Value>,
}

/// reqwest-backed [`ChatApi`].
pub struct HttpChatApi {
    base: Url,
    client: reqwest::Client,
}

impl HttpChatApi {
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Http(format!("HTTP client: {}", e)))?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| ChatError::Http(format!("bad endpoint {}: {}", path, e)))
    }
}

fn is_auth_failure(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_token(&self, username: &str, password: &str) -> Result<String> {
        let url = self.endpoint("login/")?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("username", username)
            .append_pair("password", password)
            .finish();

        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| ChatError::Http(format!("Login: {}", e)))?;

        if is_auth_failure(resp.status()) {
            return Err(ChatError::Auth("invalid username or password".to_string()));
        }
        if !resp.status().is_success() {
            return Err(ChatError::Http(format!("Login failed: HTTP {}", resp.status())));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::Http(format!("Parse login response: {}", e)))?;
        Ok(token.access_token)
    }

    async fn fetch_key(&self, token: &str) -> Result<ChatKey> {
        let url = self.endpoint("chat/key")?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ChatError::Http(format!("Key fetch: {}", e)))?;

        if is_auth_failure(resp.status()) {
            return Err(ChatError::Auth(format!("key fetch: HTTP {}", resp.status())));
        }
        if !resp.status().is_success() {
            return Err(ChatError::Http(format!(
                "Key fetch failed: HTTP {}",
                resp.status()
            )));
        }

        let body: KeyResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::Http(format!("Parse key response: {}", e)))?;
        let encoded = body
            .key
            .ok_or_else(|| ChatError::KeyUnavailable("no key received from server".to_string()))?;
        ChatKey::from_base64(&encoded).ok_or_else(|| {
            ChatError::KeyUnavailable("server key is not 32 bytes of base64".to_string())
        })
    }

    async fn fetch_history(&self, channel: &ChatChannel, token: &str) -> Result<Vec<WireMessage>> {
        let mut url = self.endpoint("messages/")?;
        url.query_pairs_mut().append_pair("chat_id", channel.as_str());

        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ChatError::HistoryFetchFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ChatError::HistoryFetchFailed(format!(
                "HTTP {}",
                resp.status()
            )));
        }

        let body: HistoryResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::HistoryFetchFailed(format!("parse: {}", e)))?;

        // Skip entries that do not decode instead of failing the whole page.
        let messages = body
            .messages
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<WireMessage>(raw) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    log::warn!("Skipping malformed history entry in {}: {}", channel, e);
                    None
                }
            })
            .collect();
        Ok(messages)
    }
}

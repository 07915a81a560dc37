//! Client configuration: defaults, optional TOML file, `SECURECHAT_*` env overrides.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use super::chat_transport::ReconnectPolicy;
use crate::crypto::key_manager::KeySource;
use crate::error::{ChatError, Result};

/// Where the shared chat key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// Fetched per deployment from `GET /chat/key`.
    Server,
    /// SHA-256 of a configured constant. Offers no secrecy between
    /// deployments that share the constant.
    Derived,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP base URL of the chat server.
    pub server_url: String,
    pub key_mode: KeyMode,
    /// Required when `key_mode = "derived"`.
    pub derivation_seed: Option<String>,
    pub reconnect_policy: ReconnectPolicy,
    pub max_reconnect_attempts: u32,
    /// Timeout applied to login, key and history requests.
    pub request_timeout_secs: u64,
    /// Durable storage for the saved credential. Defaults to the OS data dir.
    pub data_dir: Option<PathBuf>,
    /// Capacity of the per-connection outbound frame queue.
    pub outbound_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            key_mode: KeyMode::Server,
            derivation_seed: None,
            reconnect_policy: ReconnectPolicy::SurfaceAndRequireRelogin,
            max_reconnect_attempts: 3,
            request_timeout_secs: 10,
            data_dir: None,
            outbound_buffer: 64,
        }
    }
}

// Custom Debug implementation to prevent seed leakage
impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("key_mode", &self.key_mode)
            .field(
                "derivation_seed",
                &self.derivation_seed.as_ref().map(|_| "[REDACTED]"),
            )
            .field("reconnect_policy", &self.reconnect_policy)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("data_dir", &self.data_dir)
            .field("outbound_buffer", &self.outbound_buffer)
            .finish()
    }
}

impl ClientConfig {
    /// Load configuration: defaults, then the TOML file at `path` if it
    /// exists, then `SECURECHAT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) if path.exists() => Self::from_toml_file(path)?,
            _ => Self::default(),
        };
        cfg.apply_env(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("read {}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| ChatError::Config(format!("parse {}: {}", path.display(), e)))
    }

    /// Override fields from `SECURECHAT_<FIELD>` variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("SECURECHAT_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("SECURECHAT_KEY_MODE") {
            self.key_mode = parse_enum("SECURECHAT_KEY_MODE", &v)?;
        }
        if let Some(v) = var("SECURECHAT_DERIVATION_SEED") {
            self.derivation_seed = Some(v);
        }
        if let Some(v) = var("SECURECHAT_RECONNECT_POLICY") {
            self.reconnect_policy = parse_enum("SECURECHAT_RECONNECT_POLICY", &v)?;
        }
        if let Some(v) = var("SECURECHAT_MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = parse_number("SECURECHAT_MAX_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("SECURECHAT_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_number("SECURECHAT_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("SECURECHAT_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("SECURECHAT_OUTBOUND_BUFFER") {
            self.outbound_buffer = parse_number("SECURECHAT_OUTBOUND_BUFFER", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.api_base()?;
        self.key_source()?;
        if self.request_timeout_secs == 0 {
            return Err(ChatError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ChatError::Config(
                "outbound_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn api_base(&self) -> Result<Url> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| ChatError::Config(format!("server_url: {}", e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ChatError::Config(format!(
                "server_url: unsupported scheme \"{}\"",
                other
            ))),
        }
    }

    /// WebSocket endpoint, `ws(s)://host/ws`.
    pub fn ws_url(&self) -> Result<Url> {
        let mut url = self
            .api_base()?
            .join("ws")
            .map_err(|e| ChatError::Config(format!("ws url: {}", e)))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::Config("ws url: cannot set scheme".to_string()))?;
        Ok(url)
    }

    pub fn key_source(&self) -> Result<KeySource> {
        match self.key_mode {
            KeyMode::Server => Ok(KeySource::Server),
            KeyMode::Derived => match self.derivation_seed.as_deref() {
                Some(seed) if !seed.is_empty() => Ok(KeySource::Derived {
                    seed: seed.to_string(),
                }),
                _ => Err(ChatError::Config(
                    "key_mode \"derived\" requires derivation_seed".to_string(),
                )),
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("securechat"))
                .unwrap_or_else(|| PathBuf::from(".securechat"))
        })
    }
}

fn parse_enum<T: DeserializeOwned>(name: &str, value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase()))
        .map_err(|_| ChatError::Config(format!("{}: unsupported value \"{}\"", name, value)))
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ChatError::Config(format!("{}: {}", name, e)))
}

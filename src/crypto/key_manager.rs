//! Lifecycle of the single shared chat key.
//!
//! Resolution order on [`KeyManager::get_key`]:
//!   1. in-memory cache
//!   2. session-scoped [`SessionKeyCache`]
//!   3. the configured [`KeySource`]: remote fetch with the attached
//!      credential, or local derivation from a configured constant
//!
//! Concurrent callers that miss both caches share one in-flight fetch.

use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::cipher::ChatKey;
use super::key_store::{SessionKeyCache, CHAT_KEY_ENTRY};
use crate::error::{ChatError, Result};
use crate::services::chat_api::ChatApi;
use crate::services::chat_types::Credential;

/// Where the key comes from when nothing is cached.
#[derive(Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Per-deployment key distributed by the server.
    Server,
    /// SHA-256 of a shared constant. Every installation using the same seed
    /// computes the same key, so this provides no secrecy between them.
    Derived { seed: String },
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Server => f.write_str("Server"),
            KeySource::Derived { .. } => f.write_str("Derived { seed: [REDACTED] }"),
        }
    }
}

/// Derive the fallback key from a constant.
pub fn derive_key(seed: &str) -> ChatKey {
    let digest = Sha256::digest(seed.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    ChatKey::from_bytes(key)
}

type KeyFetch = Shared<BoxFuture<'static, Result<ChatKey>>>;

struct KeyState {
    cached: Option<ChatKey>,
    credential: Option<Credential>,
    in_flight: Option<KeyFetch>,
    /// Bumped on every invalidate so a fetch that started earlier cannot
    /// repopulate the cache.
    generation: u64,
}

pub struct KeyManager {
    source: KeySource,
    api: Arc<dyn ChatApi>,
    session_cache: SessionKeyCache,
    state: Mutex<KeyState>,
}

impl KeyManager {
    pub fn new(source: KeySource, api: Arc<dyn ChatApi>, session_cache: SessionKeyCache) -> Self {
        if matches!(source, KeySource::Derived { .. }) {
            log::warn!(
                "Chat key is derived from a shared constant; messages are readable by any \
                 installation configured with the same seed"
            );
        }
        Self {
            source,
            api,
            session_cache,
            state: Mutex::new(KeyState {
                cached: None,
                credential: None,
                in_flight: None,
                generation: 0,
            }),
        }
    }

    /// Bind the credential used for remote fetches.
    pub async fn attach(&self, credential: Credential) {
        self.state.lock().await.credential = Some(credential);
    }

    pub async fn has_key(&self) -> bool {
        self.state.lock().await.cached.is_some() || self.session_cache.contains(CHAT_KEY_ENTRY)
    }

    pub async fn get_key(&self) -> Result<ChatKey> {
        let (fetch, generation) = {
            let mut state = self.state.lock().await;
            if let Some(key) = &state.cached {
                return Ok(key.clone());
            }
            let credential = state.credential.clone().ok_or_else(|| {
                ChatError::KeyUnavailable("no credential; log in first".to_string())
            })?;

            if let Some(key) = self.load_session_key() {
                state.cached = Some(key.clone());
                return Ok(key);
            }

            let fetch = match &state.in_flight {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = self.start_fetch(credential);
                    state.in_flight = Some(fetch.clone());
                    fetch
                }
            };
            (fetch, state.generation)
        };

        let result = fetch.await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            return Err(ChatError::KeyUnavailable(
                "key invalidated during fetch".to_string(),
            ));
        }
        state.in_flight = None;
        match result {
            Ok(key) => {
                if state.cached.is_none() {
                    if let Err(e) = self.session_cache.put(CHAT_KEY_ENTRY, key.as_bytes()) {
                        log::warn!("Could not cache chat key for the session: {}", e);
                    }
                    state.cached = Some(key.clone());
                }
                Ok(key)
            }
            Err(ChatError::Auth(reason)) => {
                log::warn!("Key fetch rejected credential; invalidating session key");
                self.clear_locked(&mut state);
                Err(ChatError::KeyUnavailable(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the cached key, the session copy and the credential. Idempotent.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        self.clear_locked(&mut state);
        log::info!("Chat key invalidated");
    }

    fn clear_locked(&self, state: &mut KeyState) {
        state.cached = None;
        state.credential = None;
        state.in_flight = None;
        state.generation += 1;
        if let Err(e) = self.session_cache.remove(CHAT_KEY_ENTRY) {
            log::warn!("Could not clear session key cache: {}", e);
        }
    }

    fn load_session_key(&self) -> Option<ChatKey> {
        match self.session_cache.get(CHAT_KEY_ENTRY) {
            Ok(Some(bytes)) => ChatKey::from_slice(&bytes),
            Ok(None) => None,
            Err(e) => {
                log::warn!("Session key cache unreadable: {}", e);
                None
            }
        }
    }

    fn start_fetch(&self, credential: Credential) -> KeyFetch {
        match &self.source {
            KeySource::Server => {
                let api = self.api.clone();
                async move {
                    log::info!("Fetching chat key for {}", credential.username);
                    api.fetch_key(&credential.token)
                        .await
                        .map_err(|e| match e {
                            ChatError::Auth(_) | ChatError::KeyUnavailable(_) => e,
                            other => ChatError::KeyUnavailable(other.to_string()),
                        })
                }
                .boxed()
                .shared()
            }
            KeySource::Derived { seed } => {
                let key = derive_key(seed);
                async move { Ok::<_, ChatError>(key) }.boxed().shared()
            }
        }
    }
}

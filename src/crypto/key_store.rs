use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

use crate::error::{ChatError, Result};

/// Entry name of the chat key inside the session cache.
pub const CHAT_KEY_ENTRY: &str = "chat_key";

/// Session-scoped secret cache.
///
/// Lives only in process memory and never touches disk. Entries are sealed
/// with AES-256-GCM under a wrapping key drawn at construction. Clones
/// share the same map.
#[derive(Clone)]
pub struct SessionKeyCache {
    inner: Arc<Mutex<CacheInner>>,
}

struct CacheInner {
    wrapping_key: Zeroizing<[u8; 32]>,
    entries: HashMap<String, Vec<u8>>,
}

impl Default for SessionKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionKeyCache {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                wrapping_key: Zeroizing::new(key),
                entries: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CacheInner>> {
        self.inner
            .lock()
            .map_err(|_| ChatError::Storage("session cache poisoned".to_string()))
    }

    // ── AES-256-GCM helpers ────────────────────────────────────

    #[allow(deprecated)]
    fn seal(wrapping_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(wrapping_key)
            .map_err(|e| ChatError::Storage(format!("AES init: {}", e)))?;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ChatError::Storage(format!("AES encrypt: {}", e)))?;

        // nonce || ciphertext
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    #[allow(deprecated)]
    fn open(wrapping_key: &[u8; 32], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if data.len() < 12 {
            return Err(ChatError::Storage("Sealed entry too short".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(wrapping_key)
            .map_err(|e| ChatError::Storage(format!("AES init: {}", e)))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| ChatError::Storage(format!("AES decrypt: {}", e)))
    }

    // ── Entries ────────────────────────────────────────────────

    pub fn put(&self, name: &str, secret: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        let sealed = Self::seal(&inner.wrapping_key, secret)?;
        inner.entries.insert(name.to_string(), sealed);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let inner = self.lock()?;
        match inner.entries.get(name) {
            Some(sealed) => Ok(Some(Self::open(&inner.wrapping_key, sealed)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.lock()?.entries.remove(name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock()
            .map(|inner| inner.entries.contains_key(name))
            .unwrap_or(false)
    }
}

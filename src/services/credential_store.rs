use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::chat_types::Credential;
use crate::error::{ChatError, Result};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredential {
    token: String,
    username: String,
    saved_at: DateTime<Utc>,
}

/// Durable login token, read on startup to restore the previous session.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)
            .map_err(|e| ChatError::Storage(format!("Create data dir: {}", e)))?;
        Ok(Self {
            path: base_dir.join("credentials.json"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing is saved. A corrupt file is discarded.
    pub fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| ChatError::Storage(format!("Read credentials: {}", e)))?;
        match serde_json::from_str::<StoredCredential>(&data) {
            Ok(stored) => {
                log::info!(
                    "Found saved session for {} from {}",
                    stored.username,
                    stored.saved_at
                );
                Ok(Some(Credential::new(stored.token, stored.username)))
            }
            Err(e) => {
                log::warn!("Discarding unreadable credentials file: {}", e);
                self.clear()?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, credential: &Credential) -> Result<()> {
        let stored = StoredCredential {
            token: credential.token.clone(),
            username: credential.username.clone(),
            saved_at: Utc::now(),
        };
        let data = serde_json::to_string_pretty(&stored)
            .map_err(|e| ChatError::Storage(format!("Serialize credentials: {}", e)))?;
        std::fs::write(&self.path, data)
            .map_err(|e| ChatError::Storage(format!("Write credentials: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)
                .map_err(|e| ChatError::Storage(format!("Set credentials permissions: {}", e)))?;
        }
        Ok(())
    }

    /// Remove the saved credential. Missing file is fine.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatError::Storage(format!("Remove credentials: {}", e))),
        }
    }
}

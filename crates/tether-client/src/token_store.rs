//! Signed-token persistence between connections.
//!
//! The client loads its token under `auth_token_name` before every
//! handshake, saves it when the server confirms a new one, and removes it on
//! deauthentication.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Token storage failure.
#[derive(Debug, Error)]
pub enum TokenStoreError {
    /// Filesystem error.
    #[error("token store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The store file is not valid JSON.
    #[error("token store is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where signed tokens are kept.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store `token` under `name`, replacing any previous value.
    async fn save(&self, name: &str, token: &str) -> Result<(), TokenStoreError>;

    /// Token stored under `name`.
    async fn load(&self, name: &str) -> Result<Option<String>, TokenStoreError>;

    /// Remove and return the token stored under `name`.
    async fn remove(&self, name: &str) -> Result<Option<String>, TokenStoreError>;
}

/// Process-local token store; tokens vanish with the client.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save(&self, name: &str, token: &str) -> Result<(), TokenStoreError> {
        let _ = self.tokens.lock().insert(name.to_string(), token.to_string());
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Option<String>, TokenStoreError> {
        Ok(self.tokens.lock().get(name).cloned())
    }

    async fn remove(&self, name: &str) -> Result<Option<String>, TokenStoreError> {
        Ok(self.tokens.lock().remove(name))
    }
}

/// Tokens kept in one JSON object file, written with mode 0o600.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileTokenStore {
    /// Store backed by `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, String>, TokenStoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, tokens: &HashMap<String, String>) -> Result<(), TokenStoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(tokens)?;
        tokio::fs::write(&self.path, json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = tokio::fs::set_permissions(&self.path, perms).await;
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, name: &str, token: &str) -> Result<(), TokenStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tokens = self.read_all().await?;
        let _ = tokens.insert(name.to_string(), token.to_string());
        self.write_all(&tokens).await
    }

    async fn load(&self, name: &str) -> Result<Option<String>, TokenStoreError> {
        Ok(self.read_all().await?.remove(name))
    }

    async fn remove(&self, name: &str) -> Result<Option<String>, TokenStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tokens = self.read_all().await?;
        let old = tokens.remove(name);
        if old.is_some() {
            self.write_all(&tokens).await?;
        }
        Ok(old)
    }
}

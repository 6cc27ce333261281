// src/core/keyring.rs

//! The local gossip keyring file: a JSON list of base64-encoded symmetric keys.
//! The first entry is the primary key used to encrypt outbound gossip; the rest
//! are accepted for decryption during rotation.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::core::errors::MusterError;

/// Gossip keys are fixed-size symmetric keys.
pub const KEY_LEN: usize = 32;

#[derive(Serialize, Deserialize, Debug, Default)]
struct KeyringFile {
    keys: Vec<String>,
}

/// An in-memory keyring bound to its backing file.
#[derive(Debug)]
pub struct Keyring {
    path: PathBuf,
    keys: Vec<Vec<u8>>,
}

impl Keyring {
    /// Loads the keyring, or starts empty when the file doesn't exist yet.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, MusterError> {
        let path = path.into();
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "keyring file not found; starting empty");
                return Ok(Self {
                    path,
                    keys: Vec::new(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let file: KeyringFile = serde_json::from_str(&contents)?;
        let mut keys = Vec::with_capacity(file.keys.len());
        for encoded in &file.keys {
            let key = BASE64
                .decode(encoded)
                .map_err(|e| MusterError::Encoding(format!("keyring entry: {e}")))?;
            if key.len() != KEY_LEN {
                return Err(MusterError::InvalidRequest(format!(
                    "keyring entry has {} bytes; expected {KEY_LEN}",
                    key.len()
                )));
            }
            keys.push(key);
        }
        info!(path = %path.display(), count = keys.len(), "loaded gossip keyring");
        Ok(Self { path, keys })
    }

    /// The primary (encryption) key, when one is installed.
    pub fn primary(&self) -> Option<&[u8]> {
        self.keys.first().map(|k| k.as_slice())
    }

    /// Every installed key, primary first.
    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    /// Installs a key. New keys join as secondaries; use [`Keyring::use_key`]
    /// to promote one to primary.
    pub async fn install(&mut self, key: Vec<u8>) -> Result<(), MusterError> {
        if key.len() != KEY_LEN {
            return Err(MusterError::InvalidRequest(format!(
                "key has {} bytes; expected {KEY_LEN}",
                key.len()
            )));
        }
        if self.keys.contains(&key) {
            return Ok(());
        }
        if self.keys.is_empty() {
            self.keys.push(key);
        } else {
            self.keys.insert(1, key);
        }
        self.persist().await
    }

    /// Promotes an installed key to primary.
    pub async fn use_key(&mut self, key: &[u8]) -> Result<(), MusterError> {
        let Some(pos) = self.keys.iter().position(|k| k == key) else {
            return Err(MusterError::NotFound("key not installed".into()));
        };
        let key = self.keys.remove(pos);
        self.keys.insert(0, key);
        self.persist().await
    }

    /// Removes a non-primary key.
    pub async fn remove(&mut self, key: &[u8]) -> Result<(), MusterError> {
        let Some(pos) = self.keys.iter().position(|k| k == key) else {
            return Err(MusterError::NotFound("key not installed".into()));
        };
        if pos == 0 {
            return Err(MusterError::InvalidRequest(
                "cannot remove the primary key".into(),
            ));
        }
        self.keys.remove(pos);
        self.persist().await
    }

    /// Rewrites the keyring file atomically (write-then-rename).
    async fn persist(&self) -> Result<(), MusterError> {
        let file = KeyringFile {
            keys: self.keys.iter().map(|k| BASE64.encode(k)).collect(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &contents).await?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            warn!(path = %self.path.display(), error = %e, "keyring rename failed");
            return Err(e.into());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

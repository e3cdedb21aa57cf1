//! Encrypted persistent key/value storage.
//!
//! Holds the few values that must outlive a session (the preferred project
//! id). Data is a JSON map sealed with AES-256-GCM; the key lives in the OS
//! keychain unless one is supplied directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::middleware::keyring;
use crate::middleware::session::KeyValueStore;

const KEYRING_ACCOUNT: &str = "store-encryption-key";
const STORE_FILE: &str = "flowkey-store.enc";
const NONCE_LEN: usize = 12;

/// Key of the preferred project id.
pub const PREFERRED_PROJECT_ID: &str = "preferredProjectId";

/// The data structure stored in the encrypted file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreData {
    #[serde(default)]
    pub values: HashMap<String, String>,
}

/// File-backed store encrypted with a 256-bit key.
pub struct EncryptedStore {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedStore {
    /// Open the store at its default location, creating the keychain key on
    /// first use.
    pub fn open_default() -> Result<Self> {
        let key = get_or_create_key()?;
        Ok(Self::with_key(default_store_path(), key))
    }

    /// Open a store at `path` sealed with `key`.
    pub fn with_key(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the store data. A missing file is an empty store.
    pub fn load(&self) -> Result<StoreData> {
        let sealed = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreData::default()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let plaintext = self.open(&sealed)?;
        serde_json::from_slice(&plaintext).context("store contents are not valid JSON")
    }

    /// Apply `f` to the stored data and write it back.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoreData),
    {
        let mut data = self.load()?;
        f(&mut data);

        let serialized = serde_json::to_vec(&data)?;
        let sealed = self.seal(&serialized)?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, sealed)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| anyhow::anyhow!("invalid key: {e}"))
    }

    /// Output layout: nonce || ciphertext.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce_bytes)
            .map_err(|e| anyhow::anyhow!("failed to generate nonce: {e}"))?;
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            anyhow::bail!("store file is truncated");
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))
    }
}

impl KeyValueStore for EncryptedStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.load() {
            Ok(mut data) => data.values.remove(key),
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read persistent store");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(e) = self.update(|d| {
            d.values.insert(key.to_string(), value.to_string());
        }) {
            tracing::warn!(key, error = %e, "Failed to write persistent store");
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.update(|d| {
            d.values.remove(key);
        }) {
            tracing::warn!(key, error = %e, "Failed to write persistent store");
        }
    }
}

/// Generate or retrieve the encryption key from the keychain.
fn get_or_create_key() -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    match keyring::load_secret(KEYRING_ACCOUNT) {
        Ok(key_hex) => {
            hex::decode_to_slice(&key_hex, &mut key)?;
        }
        Err(_) => {
            getrandom::fill(&mut key).map_err(|e| anyhow::anyhow!("failed to generate key: {e}"))?;
            keyring::store_secret(KEYRING_ACCOUNT, &hex::encode(key))?;
        }
    }
    Ok(key)
}

fn default_store_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flowkey")
        .join(STORE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> EncryptedStore {
        let path = std::env::temp_dir()
            .join(format!("flowkey-store-test-{}-{name}", std::process::id()))
            .join(STORE_FILE);
        let _ = std::fs::remove_file(&path);
        EncryptedStore::with_key(path, [7u8; 32])
    }

    #[test]
    fn missing_file_is_empty() {
        let store = temp_store("missing");
        assert!(store.load().unwrap().values.is_empty());
        assert!(store.get(PREFERRED_PROJECT_ID).is_none());
    }

    #[test]
    fn project_id_persists_across_instances() {
        let store = temp_store("persist");
        store.set(PREFERRED_PROJECT_ID, "proj-42");

        let reopened = EncryptedStore::with_key(store.path().to_path_buf(), [7u8; 32]);
        assert_eq!(reopened.get(PREFERRED_PROJECT_ID).as_deref(), Some("proj-42"));
        let _ = std::fs::remove_file(store.path());
    }

    #[test]
    fn file_is_not_plaintext() {
        let store = temp_store("sealed");
        store.set("secret-key", "visible-value");
        let raw = std::fs::read(store.path()).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("visible-value"));
        let _ = std::fs::remove_file(store.path());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let store = temp_store("wrong-key");
        store.set(PREFERRED_PROJECT_ID, "p");

        let other = EncryptedStore::with_key(store.path().to_path_buf(), [9u8; 32]);
        assert!(other.load().is_err());
        assert!(other.get(PREFERRED_PROJECT_ID).is_none());
        let _ = std::fs::remove_file(store.path());
    }
}

//! Session-scoped key/value state.
//!
//! The resolver and the account session read a handful of named flags that
//! live for one session only. They go through [`KeyValueStore`] so that tests
//! can swap in [`MemoryStore`] for whatever substrate backs the real session.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Key of the selected generation server.
pub const SELECTED_SERVER: &str = "selectedServer";
/// Key of the cached upgraded-tier master captcha token.
pub const CACHED_MASTER_TOKEN: &str = "master_recaptcha_token";
/// Key of the shared generation API key.
pub const SESSION_API_KEY: &str = "session_api_key";
/// Key prefix of the per-user upgraded-tier flag.
const UPGRADE_ACTIVE_PREFIX: &str = "token_ultra_active_";

/// Minimal string key/value interface.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory store; the default session substrate.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `entries`.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: RwLock::new(map),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }
}

/// Typed view over the named session flags.
#[derive(Clone)]
pub struct SessionState {
    store: Arc<dyn KeyValueStore>,
}

impl SessionState {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// A fresh, empty in-memory session.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Whether the upgraded tier is cached as active for `user_id`.
    pub fn upgrade_active(&self, user_id: &str) -> bool {
        self.store
            .get(&upgrade_key(user_id))
            .is_some_and(|v| v == "true")
    }

    pub fn set_upgrade_active(&self, user_id: &str, active: bool) {
        self.store
            .set(&upgrade_key(user_id), if active { "true" } else { "false" });
    }

    /// The cached master token, if present and non-blank.
    pub fn cached_master_token(&self) -> Option<String> {
        self.store
            .get(CACHED_MASTER_TOKEN)
            .filter(|v| !v.trim().is_empty())
    }

    /// Write the master token cache. Only the resolver calls this.
    pub(crate) fn cache_master_token(&self, token: &str) {
        self.store.set(CACHED_MASTER_TOKEN, token);
    }

    pub fn selected_server(&self) -> Option<String> {
        self.store
            .get(SELECTED_SERVER)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn set_selected_server(&self, server: &str) {
        self.store.set(SELECTED_SERVER, server);
    }

    pub fn session_api_key(&self) -> Option<String> {
        self.store
            .get(SESSION_API_KEY)
            .filter(|v| !v.trim().is_empty())
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState").finish_non_exhaustive()
    }
}

fn upgrade_key(user_id: &str) -> String {
    format!("{UPGRADE_ACTIVE_PREFIX}{user_id}")
}

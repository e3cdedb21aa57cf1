//! Local state layer of the flowkey service.
//!
//! This layer sits beneath the credential core, handling:
//! - **session**: session-scoped flags behind an injectable key/value interface
//! - **store**: encrypted storage for values that outlive the session
//! - **keyring**: OS keychain abstraction for the store's encryption key

pub mod keyring;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use session::{KeyValueStore, MemoryStore, SessionState};
pub use store::EncryptedStore;

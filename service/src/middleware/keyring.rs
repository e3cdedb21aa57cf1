//! OS keychain access for the store encryption key.
//!
//! Uses the `keyring` crate to provide a cross-platform interface to:
//! - macOS: Keychain
//! - Linux: Secret Service (GNOME Keyring / KWallet)
//! - Windows: Credential Manager

use anyhow::{Context, Result};

/// Keychain service name for every flowkey entry.
pub const KEYRING_SERVICE: &str = "flowkey";

/// Store a secret under `account`.
pub fn store_secret(account: &str, secret: &str) -> Result<()> {
    keyring::Entry::new(KEYRING_SERVICE, account)?
        .set_password(secret)
        .with_context(|| format!("failed to write keychain entry '{account}'"))
}

/// Read the secret stored under `account`.
pub fn load_secret(account: &str) -> Result<String> {
    keyring::Entry::new(KEYRING_SERVICE, account)?
        .get_password()
        .with_context(|| format!("failed to read keychain entry '{account}'"))
}

/// Remove the secret stored under `account`.
pub fn forget_secret(account: &str) -> Result<()> {
    // keyring 3.x uses delete_credential instead of delete_password
    keyring::Entry::new(KEYRING_SERVICE, account)?
        .delete_credential()
        .with_context(|| format!("failed to delete keychain entry '{account}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires actual keychain access
    fn keychain_roundtrip() {
        let account = "flowkey-test-account";

        store_secret(account, "s3cret").unwrap();
        assert_eq!(load_secret(account).unwrap(), "s3cret");

        forget_secret(account).unwrap();
        assert!(load_secret(account).is_err());
    }
}

//! Integration tests for keyring storage.

use flowkey_service::middleware::keyring;

#[test]
#[ignore] // Requires actual keychain access
fn test_keyring_store_and_load() {
    let account = "flowkey-it-store";

    keyring::store_secret(account, "first").unwrap();
    assert_eq!(keyring::load_secret(account).unwrap(), "first");

    // Overwrite in place.
    keyring::store_secret(account, "second").unwrap();
    assert_eq!(keyring::load_secret(account).unwrap(), "second");

    let _ = keyring::forget_secret(account);
}

#[test]
#[ignore] // Requires actual keychain access
fn test_keyring_forget() {
    let account = "flowkey-it-forget";

    keyring::store_secret(account, "secret").unwrap();
    keyring::forget_secret(account).unwrap();

    assert!(keyring::load_secret(account).is_err());
}

#[test]
#[ignore] // Requires actual keychain access
fn test_keyring_load_missing() {
    let result = keyring::load_secret("flowkey-it-never-written");
    assert!(result.is_err(), "Should fail to load a missing entry");
}

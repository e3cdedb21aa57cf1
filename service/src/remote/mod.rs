pub mod config;
pub mod http;

// Re-export for convenience
pub use config::ServiceConfig;
pub use http::HttpRemoteStore;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CredentialError;
use crate::model::{CredentialRecord, PooledEmail, UpgradeRegistration};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures at the remote credential store boundary.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The store answered but declined the request.
    #[error("{0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Http(e.to_string())
        }
    }
}

impl From<RemoteError> for CredentialError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Rejected(message) => CredentialError::ValidationRejected(message),
            other => CredentialError::RemoteUnavailable(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Common types
// ---------------------------------------------------------------------------

/// Verdict of the captcha key validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValidation {
    pub valid: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Boxed future alias used by the object-safe wrapper.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Behavioural contract of the backend that owns credential records.
///
/// Implementations only translate calls; they never retry and never cache.
pub trait RemoteCredentialStore: Send + Sync {
    /// Fetch the current record of `user_id`.
    fn fetch_record(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<CredentialRecord, RemoteError>> + Send;

    /// Save the personal auth token and return the updated record.
    fn save_auth_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> impl Future<Output = Result<CredentialRecord, RemoteError>> + Send;

    /// Save the captcha key and return the updated record.
    fn save_recaptcha_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> impl Future<Output = Result<CredentialRecord, RemoteError>> + Send;

    /// Fetch the upgraded-tier master captcha key. `Ok(None)` when the store
    /// has none to hand out.
    fn fetch_master_token(
        &self,
    ) -> impl Future<Output = Result<Option<String>, RemoteError>> + Send;

    /// Fetch the upgraded-tier registration of `user_id`, if any.
    fn fetch_upgrade_registration(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<UpgradeRegistration>, RemoteError>> + Send;

    /// Fetch the pooled account assigned under `code`.
    fn fetch_pooled_email(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<PooledEmail, RemoteError>> + Send;

    /// Ask the captcha provider whether `key` is usable.
    fn validate_captcha_key(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<KeyValidation, RemoteError>> + Send;

    /// Probe one generation service with `token`. Returns the probe's
    /// message on success, [`RemoteError::Rejected`] when the service
    /// refuses the token.
    fn probe_token(
        &self,
        service: &str,
        token: &str,
    ) -> impl Future<Output = Result<String, RemoteError>> + Send;
}

// ---------------------------------------------------------------------------
// Dyn-compatible wrapper
// ---------------------------------------------------------------------------

/// Object-safe version of [`RemoteCredentialStore`], using boxed futures.
///
/// Auto-implemented for every `T: RemoteCredentialStore + 'static`.
/// Use `Arc<dyn RemoteCredentialStoreDyn>` wherever you need to erase the
/// concrete type.
pub trait RemoteCredentialStoreDyn: Send + Sync {
    fn fetch_record_dyn<'a>(&'a self, user_id: &'a str) -> RemoteFuture<'a, CredentialRecord>;

    fn save_auth_token_dyn<'a>(
        &'a self,
        user_id: &'a str,
        token: &'a str,
    ) -> RemoteFuture<'a, CredentialRecord>;

    fn save_recaptcha_token_dyn<'a>(
        &'a self,
        user_id: &'a str,
        token: &'a str,
    ) -> RemoteFuture<'a, CredentialRecord>;

    fn fetch_master_token_dyn(&self) -> RemoteFuture<'_, Option<String>>;

    fn fetch_upgrade_registration_dyn<'a>(
        &'a self,
        user_id: &'a str,
    ) -> RemoteFuture<'a, Option<UpgradeRegistration>>;

    fn fetch_pooled_email_dyn<'a>(&'a self, code: &'a str) -> RemoteFuture<'a, PooledEmail>;

    fn validate_captcha_key_dyn<'a>(&'a self, key: &'a str) -> RemoteFuture<'a, KeyValidation>;

    fn probe_token_dyn<'a>(&'a self, service: &'a str, token: &'a str)
    -> RemoteFuture<'a, String>;
}

impl<T: RemoteCredentialStore + 'static> RemoteCredentialStoreDyn for T {
    fn fetch_record_dyn<'a>(&'a self, user_id: &'a str) -> RemoteFuture<'a, CredentialRecord> {
        Box::pin(self.fetch_record(user_id))
    }

    fn save_auth_token_dyn<'a>(
        &'a self,
        user_id: &'a str,
        token: &'a str,
    ) -> RemoteFuture<'a, CredentialRecord> {
        Box::pin(self.save_auth_token(user_id, token))
    }

    fn save_recaptcha_token_dyn<'a>(
        &'a self,
        user_id: &'a str,
        token: &'a str,
    ) -> RemoteFuture<'a, CredentialRecord> {
        Box::pin(self.save_recaptcha_token(user_id, token))
    }

    fn fetch_master_token_dyn(&self) -> RemoteFuture<'_, Option<String>> {
        Box::pin(self.fetch_master_token())
    }

    fn fetch_upgrade_registration_dyn<'a>(
        &'a self,
        user_id: &'a str,
    ) -> RemoteFuture<'a, Option<UpgradeRegistration>> {
        Box::pin(self.fetch_upgrade_registration(user_id))
    }

    fn fetch_pooled_email_dyn<'a>(&'a self, code: &'a str) -> RemoteFuture<'a, PooledEmail> {
        Box::pin(self.fetch_pooled_email(code))
    }

    fn validate_captcha_key_dyn<'a>(&'a self, key: &'a str) -> RemoteFuture<'a, KeyValidation> {
        Box::pin(self.validate_captcha_key(key))
    }

    fn probe_token_dyn<'a>(
        &'a self,
        service: &'a str,
        token: &'a str,
    ) -> RemoteFuture<'a, String> {
        Box::pin(self.probe_token(service, token))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_maps_to_validation_error() {
        let err: CredentialError = RemoteError::Rejected("bad key".to_string()).into();
        assert_eq!(err, CredentialError::ValidationRejected("bad key".to_string()));
    }

    #[test]
    fn transport_errors_map_to_unavailable() {
        let err: CredentialError = RemoteError::Status {
            status: 503,
            body: "down".to_string(),
        }
        .into();
        assert_eq!(
            err,
            CredentialError::RemoteUnavailable("HTTP 503: down".to_string())
        );
    }

    #[test]
    fn key_validation_deserialization() {
        let v: KeyValidation = serde_json::from_str(r#"{"valid": true}"#).unwrap();
        assert!(v.valid);
        assert!(v.error.is_none());

        let v: KeyValidation =
            serde_json::from_str(r#"{"valid": false, "error": "ERROR_KEY_DOES_NOT_EXIST"}"#)
                .unwrap();
        assert_eq!(v.error.as_deref(), Some("ERROR_KEY_DOES_NOT_EXIST"));
    }

    /// A store that answers every call the same way.
    struct StaticStore;

    impl RemoteCredentialStore for StaticStore {
        async fn fetch_record(&self, user_id: &str) -> Result<CredentialRecord, RemoteError> {
            Ok(CredentialRecord::new(user_id))
        }

        async fn save_auth_token(
            &self,
            user_id: &str,
            token: &str,
        ) -> Result<CredentialRecord, RemoteError> {
            Ok(CredentialRecord::new(user_id).with_auth_token(token))
        }

        async fn save_recaptcha_token(
            &self,
            user_id: &str,
            token: &str,
        ) -> Result<CredentialRecord, RemoteError> {
            Ok(CredentialRecord::new(user_id).with_recaptcha_token(token))
        }

        async fn fetch_master_token(&self) -> Result<Option<String>, RemoteError> {
            Ok(None)
        }

        async fn fetch_upgrade_registration(
            &self,
            _user_id: &str,
        ) -> Result<Option<UpgradeRegistration>, RemoteError> {
            Ok(None)
        }

        async fn fetch_pooled_email(&self, code: &str) -> Result<PooledEmail, RemoteError> {
            Err(RemoteError::Rejected(format!("unknown code {code}")))
        }

        async fn validate_captcha_key(&self, _key: &str) -> Result<KeyValidation, RemoteError> {
            Ok(KeyValidation {
                valid: true,
                error: None,
            })
        }

        async fn probe_token(&self, service: &str, _token: &str) -> Result<String, RemoteError> {
            Ok(format!("{service} ok"))
        }
    }

    #[tokio::test]
    async fn dyn_wrapper_forwards_calls() {
        let store: std::sync::Arc<dyn RemoteCredentialStoreDyn> = std::sync::Arc::new(StaticStore);
        let record = store.save_auth_token_dyn("u1", "tok").await.unwrap();
        assert_eq!(record.auth_token(), "tok");
        assert_eq!(store.probe_token_dyn("Veo", "tok").await.unwrap(), "Veo ok");
        assert!(store.fetch_pooled_email_dyn("c1").await.is_err());
    }
}

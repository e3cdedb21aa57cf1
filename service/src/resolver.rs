//! Layered lookup of the effective captcha credential.
//!
//! Tiers, first hit wins:
//! 1. the session's cached master token, when the upgraded tier is flagged
//!    active for the user;
//! 2. the remote master token (same condition), which is then cached;
//! 3. the user's own `recaptchaToken`.
//!
//! A tier that comes up empty, including a failed remote call, is a miss and
//! falls through. Nothing here retries; a fresh [`CredentialResolver::resolve`]
//! is the only retry.

use std::sync::Arc;

use crate::error::CredentialError;
use crate::middleware::SessionState;
use crate::model::{CredentialRecord, CredentialSource, ResolvedCredential};
use crate::remote::RemoteCredentialStoreDyn;

#[derive(Clone)]
pub struct CredentialResolver {
    remote: Arc<dyn RemoteCredentialStoreDyn>,
    session: SessionState,
}

impl CredentialResolver {
    pub fn new(remote: Arc<dyn RemoteCredentialStoreDyn>, session: SessionState) -> Self {
        Self { remote, session }
    }

    /// Compute the effective credential for `user`.
    pub async fn resolve(&self, user: &CredentialRecord) -> ResolvedCredential {
        let upgraded = self.session.upgrade_active(&user.user_id);

        if upgraded {
            match self.cached_tier() {
                Ok(value) => return ResolvedCredential::new(value, CredentialSource::Cached),
                Err(e) => log_miss(&user.user_id, &e),
            }
            match self.remote_master_tier().await {
                Ok(value) => {
                    return ResolvedCredential::new(value, CredentialSource::RemoteMaster);
                }
                Err(e) => log_miss(&user.user_id, &e),
            }
        }

        match user_record_tier(user) {
            Ok(value) => ResolvedCredential::new(value, CredentialSource::UserRecord),
            Err(e) => {
                log_miss(&user.user_id, &e);
                ResolvedCredential::none()
            }
        }
    }

    /// The value the captcha field should be compared against before saving:
    /// the cached master token while the upgraded tier is active, otherwise
    /// the user's own stored key.
    pub fn active_baseline(&self, user: &CredentialRecord) -> String {
        if self.session.upgrade_active(&user.user_id) {
            self.session.cached_master_token().unwrap_or_default()
        } else {
            user.captcha_key().to_string()
        }
    }

    fn cached_tier(&self) -> Result<String, CredentialError> {
        self.session
            .cached_master_token()
            .ok_or(CredentialError::ResolutionMiss {
                tier: CredentialSource::Cached,
            })
    }

    async fn remote_master_tier(&self) -> Result<String, CredentialError> {
        let token = self.remote.fetch_master_token_dyn().await?;
        match token.filter(|t| !t.trim().is_empty()) {
            Some(token) => {
                self.session.cache_master_token(&token);
                Ok(token)
            }
            None => Err(CredentialError::ResolutionMiss {
                tier: CredentialSource::RemoteMaster,
            }),
        }
    }
}

fn user_record_tier(user: &CredentialRecord) -> Result<String, CredentialError> {
    user.recaptcha_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .ok_or(CredentialError::ResolutionMiss {
            tier: CredentialSource::UserRecord,
        })
}

fn log_miss(user_id: &str, error: &CredentialError) {
    if error.is_silent() {
        tracing::debug!(user_id, error = %error, "Resolution miss, falling through");
    } else {
        tracing::warn!(user_id, error = %error, "Master token lookup failed, falling through");
    }
}

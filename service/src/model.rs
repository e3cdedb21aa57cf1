//! Data model shared across the credential core.

use serde::{Deserialize, Serialize};

/// Per-user credential record as owned by the remote store.
///
/// Equality is by value so that a wholesale replacement of the record with
/// identical fields is not mistaken for a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    #[serde(rename = "id")]
    pub user_id: String,
    #[serde(default)]
    pub personal_auth_token: Option<String>,
    #[serde(default)]
    pub recaptcha_token: Option<String>,
}

impl CredentialRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.personal_auth_token = Some(token.into());
        self
    }

    pub fn with_recaptcha_token(mut self, token: impl Into<String>) -> Self {
        self.recaptcha_token = Some(token.into());
        self
    }

    /// The stored auth token, or `""` when absent.
    pub fn auth_token(&self) -> &str {
        self.personal_auth_token.as_deref().unwrap_or("")
    }

    /// The stored captcha key, or `""` when absent.
    pub fn captcha_key(&self) -> &str {
        self.recaptcha_token.as_deref().unwrap_or("")
    }
}

/// Which resolution tier produced a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialSource {
    Cached,
    RemoteMaster,
    UserRecord,
    None,
}

/// The effective captcha credential for a user.
///
/// `source == None` exactly when `value` is empty; use the constructors to
/// keep that true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCredential {
    value: String,
    source: CredentialSource,
}

impl ResolvedCredential {
    /// A hit at `source`. Blank values collapse to [`ResolvedCredential::none`].
    pub fn new(value: impl Into<String>, source: CredentialSource) -> Self {
        let value = value.into();
        if value.trim().is_empty() || source == CredentialSource::None {
            return Self::none();
        }
        Self { value, source }
    }

    pub fn none() -> Self {
        Self {
            value: String::new(),
            source: CredentialSource::None,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn is_none(&self) -> bool {
        self.source == CredentialSource::None
    }
}

/// Outcome of a single validation probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    #[serde(alias = "service")]
    pub probe_name: String,
    pub success: bool,
    pub message: String,
}

impl TestResult {
    pub fn passed(probe_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            probe_name: probe_name.into(),
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(probe_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            probe_name: probe_name.into(),
            success: false,
            message: message.into(),
        }
    }
}

/// Registration of a user for the upgraded tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeRegistration {
    /// Code of the pooled account assigned to the user, if any.
    #[serde(default)]
    pub email_code: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Login of a pooled account handed out with an upgrade registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PooledEmail {
    pub email: String,
    pub password: String,
}

/// Everything shown about a user's upgraded-tier account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpgradeDetails {
    pub registration: Option<UpgradeRegistration>,
    pub pooled_email: Option<PooledEmail>,
}

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::model::{CredentialRecord, PooledEmail, UpgradeRegistration};
use crate::remote::{KeyValidation, RemoteCredentialStore, RemoteError, ServiceConfig};

/// JSON-over-HTTP client for the credential backend.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct RecordEnvelope {
    success: bool,
    #[serde(default)]
    user: Option<CredentialRecord>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MasterTokenEnvelope {
    success: bool,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationEnvelope {
    success: bool,
    #[serde(default)]
    registration: Option<UpgradeRegistration>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PooledEmailEnvelope {
    success: bool,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url =
            Url::parse(base_url).map_err(|e| RemoteError::Http(format!("invalid base URL: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, RemoteError> {
        Self::new(&config.base_url, config.request_timeout())
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Append `segments` to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Http(format!("base URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: Url,
        body: serde_json::Value,
    ) -> Result<T, RemoteError> {
        let response = self.client.post(url).json(&body).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn save_field(
        &self,
        user_id: &str,
        field: &str,
        token: &str,
    ) -> Result<CredentialRecord, RemoteError> {
        let url = self.endpoint(&["users", user_id, field])?;
        let envelope: RecordEnvelope = self
            .post_json(url, serde_json::json!({ "token": token }))
            .await?;
        record_from(envelope)
    }
}

fn record_from(envelope: RecordEnvelope) -> Result<CredentialRecord, RemoteError> {
    match envelope {
        RecordEnvelope {
            success: true,
            user: Some(user),
            ..
        } => Ok(user),
        RecordEnvelope {
            success: true,
            user: None,
            ..
        } => Err(RemoteError::Decode("response carries no user record".to_string())),
        RecordEnvelope { message, .. } => Err(RemoteError::Rejected(
            message.unwrap_or_else(|| "request declined".to_string()),
        )),
    }
}

impl RemoteCredentialStore for HttpRemoteStore {
    async fn fetch_record(&self, user_id: &str) -> Result<CredentialRecord, RemoteError> {
        let url = self.endpoint(&["users", user_id])?;
        let envelope: RecordEnvelope = self.get_json(url).await?;
        record_from(envelope)
    }

    async fn save_auth_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<CredentialRecord, RemoteError> {
        self.save_field(user_id, "personal-auth-token", token).await
    }

    async fn save_recaptcha_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<CredentialRecord, RemoteError> {
        self.save_field(user_id, "recaptcha-token", token).await
    }

    async fn fetch_master_token(&self) -> Result<Option<String>, RemoteError> {
        let url = self.endpoint(&["master-recaptcha-token"])?;
        let envelope: MasterTokenEnvelope = self.get_json(url).await?;
        if !envelope.success {
            return Ok(None);
        }
        Ok(envelope.api_key.filter(|k| !k.trim().is_empty()))
    }

    async fn fetch_upgrade_registration(
        &self,
        user_id: &str,
    ) -> Result<Option<UpgradeRegistration>, RemoteError> {
        let url = self.endpoint(&["users", user_id, "token-ultra-registration"])?;
        let envelope: RegistrationEnvelope = self.get_json(url).await?;
        if !envelope.success {
            return Err(RemoteError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| "registration lookup declined".to_string()),
            ));
        }
        Ok(envelope.registration)
    }

    async fn fetch_pooled_email(&self, code: &str) -> Result<PooledEmail, RemoteError> {
        let url = self.endpoint(&["email-pool", code])?;
        let envelope: PooledEmailEnvelope = self.get_json(url).await?;
        match envelope {
            PooledEmailEnvelope {
                success: true,
                email: Some(email),
                password: Some(password),
                ..
            } => Ok(PooledEmail { email, password }),
            PooledEmailEnvelope { message, .. } => Err(RemoteError::Rejected(
                message.unwrap_or_else(|| format!("no pooled account for code {code}")),
            )),
        }
    }

    async fn validate_captcha_key(&self, key: &str) -> Result<KeyValidation, RemoteError> {
        let url = self.endpoint(&["anti-captcha", "validate"])?;
        self.post_json(url, serde_json::json!({ "clientKey": key }))
            .await
    }

    async fn probe_token(&self, service: &str, token: &str) -> Result<String, RemoteError> {
        let url = self.endpoint(&["token-probes", service])?;
        let envelope: ProbeEnvelope = self
            .post_json(url, serde_json::json!({ "token": token }))
            .await?;
        let message = envelope.message.unwrap_or_default();
        if envelope.success {
            Ok(message)
        } else if message.is_empty() {
            Err(RemoteError::Rejected(format!("{service} rejected the token")))
        } else {
            Err(RemoteError::Rejected(message))
        }
    }
}

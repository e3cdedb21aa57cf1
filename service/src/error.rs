//! Error taxonomy shared by the resolver, the persisters and the test
//! orchestrator.

use thiserror::Error;

use crate::model::CredentialSource;

/// Failures surfaced (or deliberately swallowed) by the credential core.
///
/// Only [`CredentialError::ValidationRejected`] and
/// [`CredentialError::TestInProgress`] are meant for the user; the rest are
/// handled where they occur and at most logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// A resolution tier had nothing to offer. Degrade to the next tier.
    #[error("no credential at tier {tier:?}")]
    ResolutionMiss { tier: CredentialSource },
    /// Network or service failure on fetch or save.
    #[error("remote credential store unavailable: {0}")]
    RemoteUnavailable(String),
    /// A validator explicitly reported the credential as invalid.
    #[error("{0}")]
    ValidationRejected(String),
    /// The subject changed while the operation was in flight.
    #[error("operation cancelled: subject changed")]
    Cancelled,
    /// Another test pass is already running against this subject.
    #[error("a test is already running for {subject}")]
    TestInProgress { subject: String },
}

impl CredentialError {
    /// Whether the error should stay invisible to the user.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            CredentialError::ResolutionMiss { .. } | CredentialError::Cancelled
        )
    }
}

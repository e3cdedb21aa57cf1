//! FlowKey Service - credential core for the generation front end
//!
//! Keeps a user's generation credentials usable without manual bookkeeping:
//! - resolves the effective captcha key from the session cache, the shared
//!   master token or the user's own record
//! - auto-saves edited fields after a quiet period, one save at a time
//! - validates tokens and keys against every configured probe at once
//!
//! The remote credential store is reached through [`remote::RemoteCredentialStore`];
//! session flags and long-lived preferences go through
//! [`middleware::KeyValueStore`].

pub mod account;
pub mod error;
pub mod middleware;
pub mod model;
pub mod orchestrator;
pub mod persister;
pub mod remote;
pub mod resolver;

pub use account::{AccountSession, SubjectEvent};
pub use error::CredentialError;
pub use model::{CredentialRecord, CredentialSource, ResolvedCredential, TestResult};
pub use persister::{FieldPersister, PersisterConfig, SaveStatus};
pub use resolver::CredentialResolver;

//! Per-user credential context.
//!
//! [`AccountSession`] owns everything tied to the active user: the two field
//! persisters, the resolved captcha credential, upgraded-tier details and the
//! last test results. Every change of subject goes through
//! [`AccountSession::observe_user`], which compares records by value and
//! raises at most one [`SubjectEvent`].
//!
//! Work dispatched for one subject carries the subject epoch it started
//! under; results arriving after the epoch moved on are dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;

use crate::error::CredentialError;
use crate::middleware::store::PREFERRED_PROJECT_ID;
use crate::middleware::{KeyValueStore, MemoryStore, SessionState};
use crate::model::{CredentialRecord, ResolvedCredential, TestResult, UpgradeDetails};
use crate::orchestrator::{KeyTester, Probe, ProbeFuture, TestOrchestrator, TestState};
use crate::persister::{CommitFn, CommitFuture, FieldPersister, PersisterConfig, SaveStatus};
use crate::remote::{RemoteCredentialStoreDyn, ServiceConfig};
use crate::resolver::CredentialResolver;

/// Field id of the personal auth ("flow") token.
pub const AUTH_TOKEN_FIELD: &str = "auth-token";
/// Field id of the captcha provider key.
pub const CAPTCHA_KEY_FIELD: &str = "captcha-key";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SubjectEvent {
    /// A different user became active.
    UserChanged { user_id: String },
    /// The active user's record changed by value.
    RecordChanged { user_id: String },
    /// No user is active any more.
    Cleared,
    /// The selected generation server was re-read.
    ServerChanged { server: Option<String> },
    /// A field commit replaced the canonical record.
    RecordCommitted {
        field: String,
        record: CredentialRecord,
    },
}

/// Invoked with the updated record after every confirmed commit.
pub type RecordListener = Arc<dyn Fn(&CredentialRecord) + Send + Sync>;

#[derive(Clone, Copy)]
enum Field {
    AuthToken,
    CaptchaKey,
}

impl Field {
    fn id(self) -> &'static str {
        match self {
            Field::AuthToken => AUTH_TOKEN_FIELD,
            Field::CaptchaKey => CAPTCHA_KEY_FIELD,
        }
    }
}

struct Persisters {
    auth: FieldPersister,
    captcha: FieldPersister,
}

#[derive(Default)]
struct State {
    epoch: u64,
    /// Bumped on every resolution dispatch; only the latest may apply.
    resolve_seq: u64,
    record: Option<CredentialRecord>,
    persisters: Option<Persisters>,
    flow_token: String,
    captcha_key: String,
    resolved: Option<ResolvedCredential>,
    upgrade: UpgradeDetails,
    token_results: Vec<TestResult>,
}

struct Core {
    remote: Arc<dyn RemoteCredentialStoreDyn>,
    session: SessionState,
    persistent: Arc<dyn KeyValueStore>,
    resolver: CredentialResolver,
    orchestrator: TestOrchestrator,
    captcha_tester: KeyTester,
    persister_config: PersisterConfig,
    probe_services: Vec<String>,
    state: Mutex<State>,
    listener: Mutex<Option<RecordListener>>,
    events: broadcast::Sender<SubjectEvent>,
}

/// Dispatched follow-up work for a subject change.
struct Refresh {
    epoch: u64,
    seq: u64,
    record: CredentialRecord,
    load_upgrade: bool,
}

/// Handle to the active user's credential context. Cheap to clone.
#[derive(Clone)]
pub struct AccountSession {
    core: Arc<Core>,
}

impl AccountSession {
    pub fn new(
        remote: Arc<dyn RemoteCredentialStoreDyn>,
        session: SessionState,
        config: &ServiceConfig,
    ) -> Self {
        Self::with_persistent_store(remote, session, Arc::new(MemoryStore::new()), config)
    }

    /// Like [`AccountSession::new`], keeping long-lived preferences in
    /// `persistent` rather than in memory.
    pub fn with_persistent_store(
        remote: Arc<dyn RemoteCredentialStoreDyn>,
        session: SessionState,
        persistent: Arc<dyn KeyValueStore>,
        config: &ServiceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let core = Core {
            resolver: CredentialResolver::new(Arc::clone(&remote), session.clone()),
            captcha_tester: KeyTester::new(captcha_probe(Arc::clone(&remote)), config.tester()),
            orchestrator: TestOrchestrator::new(),
            persister_config: config.persister(),
            probe_services: config.probe_services.clone(),
            remote,
            session,
            persistent,
            state: Mutex::new(State::default()),
            listener: Mutex::new(None),
            events,
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// Register the callback told about records updated by a commit.
    pub fn on_user_update(&self, listener: RecordListener) {
        *self
            .core
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubjectEvent> {
        self.core.events.subscribe()
    }

    /// Make `user` the active subject and wait for the resulting resolution.
    ///
    /// Returns the raised event, or `None` when the record is unchanged.
    pub async fn observe_user(&self, user: Option<CredentialRecord>) -> Option<SubjectEvent> {
        self.core.observe(user).await
    }

    // --- Field edits --------------------------------------------------------

    /// Record an edit of the flow token field.
    pub fn edit_flow_token(&self, value: &str) {
        let mut state = self.core.lock();
        state.flow_token = value.to_string();
        let baseline = state
            .record
            .as_ref()
            .map(|r| r.auth_token().to_string())
            .unwrap_or_default();
        if let Some(persisters) = &state.persisters {
            persisters.auth.watch(value, &baseline);
        }
    }

    /// Record an edit of the captcha key field. Staleness is judged against
    /// whichever tier the resolver currently treats as active.
    ///
    /// A value equal to the active tier's key is never written, even after an
    /// earlier edit moved the persisted baseline elsewhere.
    pub fn edit_captcha_key(&self, value: &str) {
        let mut state = self.core.lock();
        state.captcha_key = value.to_string();
        let Some(record) = state.record.clone() else {
            return;
        };
        let baseline = self.core.resolver.active_baseline(&record);
        let Some(persisters) = &state.persisters else {
            return;
        };
        let trimmed = value.trim();
        if !trimmed.is_empty() && trimmed == baseline.trim() {
            persisters.captcha.discard_pending();
        } else {
            persisters.captcha.watch(value, &baseline);
        }
    }

    // --- Tests --------------------------------------------------------------

    /// Probe every configured generation service with the flow token.
    ///
    /// Uses the edited token when non-blank, else the stored one; with
    /// neither, nothing runs and `Ok(None)` is returned.
    pub async fn test_token(&self) -> Result<Option<Vec<TestResult>>, CredentialError> {
        let (epoch, user_id, token) = {
            let state = self.core.lock();
            let Some(record) = &state.record else {
                return Ok(None);
            };
            let edited = state.flow_token.trim();
            let token = if edited.is_empty() {
                record.auth_token().trim()
            } else {
                edited
            };
            if token.is_empty() {
                return Ok(None);
            }
            (state.epoch, record.user_id.clone(), token.to_string())
        };

        let probes = self.core.token_probes();
        let subject = format!("{AUTH_TOKEN_FIELD}:{user_id}");
        let results = self
            .core
            .orchestrator
            .run_probes(&subject, &token, &probes)
            .await?;

        let mut state = self.core.lock();
        if state.epoch != epoch {
            tracing::debug!(user_id, "Subject changed during token test, discarding results");
            return Err(CredentialError::Cancelled);
        }
        state.token_results = results.clone();
        Ok(Some(results))
    }

    /// Validate the captcha key field. A blank key is a no-op.
    pub async fn test_captcha_key(&self) -> Result<Option<TestResult>, CredentialError> {
        let key = self.core.lock().captcha_key.trim().to_string();
        if key.is_empty() {
            return Ok(None);
        }
        self.core.captcha_tester.test_one(&key).await.map(Some)
    }

    pub fn captcha_test_state(&self) -> TestState {
        self.core.captcha_tester.state()
    }

    pub fn token_results(&self) -> Vec<TestResult> {
        self.core.lock().token_results.clone()
    }

    // --- Reads --------------------------------------------------------------

    pub fn record(&self) -> Option<CredentialRecord> {
        self.core.lock().record.clone()
    }

    pub fn flow_token(&self) -> String {
        self.core.lock().flow_token.clone()
    }

    pub fn captcha_key(&self) -> String {
        self.core.lock().captcha_key.clone()
    }

    /// The last applied resolution, `None` until one completes.
    pub fn resolved(&self) -> Option<ResolvedCredential> {
        self.core.lock().resolved.clone()
    }

    pub fn upgrade_details(&self) -> UpgradeDetails {
        self.core.lock().upgrade.clone()
    }

    /// Save status of `field_id`; idle when no user is active.
    pub fn save_status(&self, field_id: &str) -> SaveStatus {
        let state = self.core.lock();
        let Some(persisters) = &state.persisters else {
            return SaveStatus::Idle;
        };
        match field_id {
            AUTH_TOKEN_FIELD => persisters.auth.status(),
            CAPTCHA_KEY_FIELD => persisters.captcha.status(),
            _ => SaveStatus::Idle,
        }
    }

    // --- Session surface ----------------------------------------------------

    pub fn current_server(&self) -> Option<String> {
        self.core.session.selected_server()
    }

    /// Re-read the selected server and tell subscribers.
    pub fn server_changed(&self) -> Option<String> {
        let server = self.current_server();
        tracing::info!(server = server.as_deref().unwrap_or(""), "Selected server changed");
        self.core.emit(SubjectEvent::ServerChanged {
            server: server.clone(),
        });
        server
    }

    pub fn server_display(&self) -> String {
        server_display(self.current_server().as_deref())
    }

    /// Whether the session holds the shared generation API key.
    pub fn shared_api_key_loaded(&self) -> bool {
        self.core.session.session_api_key().is_some()
    }

    pub fn preferred_project_id(&self) -> Option<String> {
        self.core
            .persistent
            .get(PREFERRED_PROJECT_ID)
            .filter(|v| !v.trim().is_empty())
    }

    /// Store the preferred captcha project id. Written at once, no debounce.
    pub fn set_preferred_project_id(&self, project_id: &str) {
        let project_id = project_id.trim();
        if project_id.is_empty() {
            self.core.persistent.remove(PREFERRED_PROJECT_ID);
        } else {
            self.core.persistent.set(PREFERRED_PROJECT_ID, project_id);
        }
    }
}

impl std::fmt::Debug for AccountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.lock();
        f.debug_struct("AccountSession")
            .field("user_id", &state.record.as_ref().map(|r| r.user_id.as_str()))
            .field("epoch", &state.epoch)
            .finish_non_exhaustive()
    }
}

/// Display form of a server URL: scheme stripped, upper-cased.
pub fn server_display(server: Option<&str>) -> String {
    match server.map(str::trim).filter(|s| !s.is_empty()) {
        Some(server) => server.replacen("https://", "", 1).to_uppercase(),
        None => "NOT CONFIGURED".to_string(),
    }
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SubjectEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn observe(self: &Arc<Self>, user: Option<CredentialRecord>) -> Option<SubjectEvent> {
        let (event, refresh) = self.apply_subject(user)?;
        self.emit(event.clone());
        if let Some(refresh) = refresh {
            self.refresh(refresh).await;
        }
        Some(event)
    }

    fn apply_subject(
        self: &Arc<Self>,
        user: Option<CredentialRecord>,
    ) -> Option<(SubjectEvent, Option<Refresh>)> {
        let mut state = self.lock();
        if state.record == user {
            return None;
        }

        let Some(user) = user else {
            tracing::info!("Active user cleared");
            self.teardown(&mut state);
            state.record = None;
            return Some((SubjectEvent::Cleared, None));
        };

        let same_user = state
            .record
            .as_ref()
            .is_some_and(|prev| prev.user_id == user.user_id);

        if same_user {
            let previous = state.record.replace(user.clone());
            let previous_token = previous
                .as_ref()
                .map(|r| r.auth_token().trim().to_string())
                .unwrap_or_default();
            // Only follow the record when the field holds no unsaved edit. A
            // value queued behind the commit that produced this record counts
            // as unsaved even when it matches the previous token.
            let waiting = state
                .persisters
                .as_ref()
                .is_some_and(|p| p.auth.has_pending());
            let clean = {
                let current = state.flow_token.trim();
                current.is_empty() || (current == previous_token && !waiting)
            };
            if clean && !user.auth_token().trim().is_empty() {
                state.flow_token = user.auth_token().to_string();
            }
            if let Some(persisters) = &state.persisters {
                persisters.auth.watch(&state.flow_token, user.auth_token());
            }
            tracing::debug!(user_id = %user.user_id, "Record changed, re-resolving");
            state.resolve_seq += 1;
            let refresh = Refresh {
                epoch: state.epoch,
                seq: state.resolve_seq,
                record: user.clone(),
                load_upgrade: false,
            };
            return Some((
                SubjectEvent::RecordChanged {
                    user_id: user.user_id,
                },
                Some(refresh),
            ));
        }

        tracing::info!(user_id = %user.user_id, "Active user changed");
        self.teardown(&mut state);
        let epoch = state.epoch;
        let persisters = Persisters {
            auth: self.persister(Field::AuthToken, &user.user_id, epoch),
            captcha: self.persister(Field::CaptchaKey, &user.user_id, epoch),
        };
        state.flow_token = user.auth_token().to_string();
        // First observations: loads, not edits.
        persisters.auth.watch(&state.flow_token, user.auth_token());
        persisters
            .captcha
            .watch(&state.captcha_key, &self.resolver.active_baseline(&user));
        state.persisters = Some(persisters);
        state.record = Some(user.clone());
        state.resolve_seq += 1;
        let refresh = Refresh {
            epoch,
            seq: state.resolve_seq,
            record: user.clone(),
            load_upgrade: true,
        };
        Some((
            SubjectEvent::UserChanged {
                user_id: user.user_id,
            },
            Some(refresh),
        ))
    }

    /// Drop everything bound to the current subject and open a new epoch.
    fn teardown(&self, state: &mut State) {
        // Dropping a persister cancels its timers without committing.
        state.persisters = None;
        state.epoch += 1;
        state.flow_token.clear();
        state.captcha_key.clear();
        state.resolved = None;
        state.upgrade = UpgradeDetails::default();
        state.token_results.clear();
        self.captcha_tester.reset();
    }

    async fn refresh(self: &Arc<Self>, refresh: Refresh) {
        let Refresh {
            epoch,
            seq,
            record,
            load_upgrade,
        } = refresh;

        let upgrade = async {
            if load_upgrade {
                Some(self.load_upgrade_details(&record.user_id).await)
            } else {
                None
            }
        };
        let (resolved, upgrade) = tokio::join!(self.resolver.resolve(&record), upgrade);

        let mut state = self.lock();
        if state.epoch != epoch {
            tracing::debug!(user_id = %record.user_id, "Subject changed mid-resolution, discarding");
            return;
        }
        if let Some(upgrade) = upgrade {
            state.upgrade = upgrade;
        }
        if state.resolve_seq != seq {
            return;
        }
        tracing::debug!(
            user_id = %record.user_id,
            source = ?resolved.source(),
            "Captcha credential resolved"
        );
        let previous = state
            .resolved
            .as_ref()
            .map(|r| r.value().to_string())
            .unwrap_or_default();
        let current = state.captcha_key.trim();
        if current.is_empty() || current == previous {
            state.captcha_key = resolved.value().to_string();
        }
        state.resolved = Some(resolved);
    }

    async fn load_upgrade_details(&self, user_id: &str) -> UpgradeDetails {
        let registration = match self.remote.fetch_upgrade_registration_dyn(user_id).await {
            Ok(registration) => registration,
            Err(e) => {
                tracing::debug!(user_id, error = %e, "No upgrade registration");
                return UpgradeDetails::default();
            }
        };

        let code = registration
            .as_ref()
            .and_then(|r| r.email_code.as_deref())
            .filter(|c| !c.trim().is_empty());
        let pooled_email = match code {
            Some(code) => match self.remote.fetch_pooled_email_dyn(code).await {
                Ok(email) => Some(email),
                Err(e) => {
                    tracing::debug!(user_id, code, error = %e, "Pooled email unavailable");
                    None
                }
            },
            None => None,
        };

        UpgradeDetails {
            registration,
            pooled_email,
        }
    }

    fn persister(self: &Arc<Self>, field: Field, user_id: &str, epoch: u64) -> FieldPersister {
        let persister = FieldPersister::new(
            field.id(),
            self.persister_config,
            commit_fn(Arc::clone(&self.remote), user_id.to_string(), field),
        );
        let core: Weak<Core> = Arc::downgrade(self);
        persister.set_listener(Arc::new(move |field_id: &str, record: &CredentialRecord| {
            if let Some(core) = core.upgrade() {
                core.record_committed(epoch, field_id, record.clone());
            }
        }));
        persister
    }

    fn record_committed(self: &Arc<Self>, epoch: u64, field: &str, record: CredentialRecord) {
        if self.lock().epoch != epoch {
            return;
        }
        self.emit(SubjectEvent::RecordCommitted {
            field: field.to_string(),
            record: record.clone(),
        });
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(&record);
        }

        // The committed record becomes the canonical one.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let core = Arc::clone(self);
        runtime.spawn(async move {
            let current = core.lock().epoch == epoch;
            if current {
                core.observe(Some(record)).await;
            }
        });
    }

    fn token_probes(&self) -> Vec<Probe> {
        self.probe_services
            .iter()
            .map(|service| {
                let remote = Arc::clone(&self.remote);
                let service_name = service.clone();
                Probe::new(service.clone(), move |token: String| -> ProbeFuture {
                    let remote = Arc::clone(&remote);
                    let service = service_name.clone();
                    Box::pin(async move {
                        remote
                            .probe_token_dyn(&service, &token)
                            .await
                            .map_err(CredentialError::from)
                    })
                })
            })
            .collect()
    }
}

fn commit_fn(remote: Arc<dyn RemoteCredentialStoreDyn>, user_id: String, field: Field) -> CommitFn {
    Arc::new(move |value: String| -> CommitFuture {
        let remote = Arc::clone(&remote);
        let user_id = user_id.clone();
        Box::pin(async move {
            match field {
                Field::AuthToken => remote.save_auth_token_dyn(&user_id, &value).await,
                Field::CaptchaKey => remote.save_recaptcha_token_dyn(&user_id, &value).await,
            }
        })
    })
}

fn captcha_probe(remote: Arc<dyn RemoteCredentialStoreDyn>) -> Probe {
    Probe::new(CAPTCHA_KEY_FIELD, move |key: String| -> ProbeFuture {
        Box::pin(check_captcha_key(Arc::clone(&remote), key))
    })
}

async fn check_captcha_key(
    remote: Arc<dyn RemoteCredentialStoreDyn>,
    key: String,
) -> Result<String, CredentialError> {
    let verdict = remote
        .validate_captcha_key_dyn(&key)
        .await
        .map_err(|e| CredentialError::RemoteUnavailable(e.to_string()))?;
    if verdict.valid {
        return Ok("API key is valid!".to_string());
    }
    Err(CredentialError::ValidationRejected(
        verdict
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "Invalid API key".to_string()),
    ))
}

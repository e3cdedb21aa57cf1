//! Validation of resolved credentials.
//!
//! [`TestOrchestrator::run_probes`] fans a credential out to several named
//! probes at once and collects one [`TestResult`] per probe; a failing probe
//! never hides its siblings. [`KeyTester`] is the single-credential variant
//! with a status that falls back to idle after a display window.
//!
//! Both refuse to start a second pass for a subject that is still being
//! tested, since validators may be rate-limited.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::CredentialError;
use crate::model::TestResult;

pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<String, CredentialError>> + Send>>;

/// One named check run against a credential. Resolves to a human-readable
/// message on success.
#[derive(Clone)]
pub struct Probe {
    name: String,
    invoke: Arc<dyn Fn(String) -> ProbeFuture + Send + Sync>,
}

impl Probe {
    pub fn new<F>(name: impl Into<String>, invoke: F) -> Self
    where
        F: Fn(String) -> ProbeFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            invoke: Arc::new(invoke),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, credential: String) -> TestResult {
        match (self.invoke)(credential).await {
            Ok(message) => TestResult::passed(&self.name, message),
            Err(e) => {
                tracing::debug!(probe = %self.name, error = %e, "Probe failed");
                TestResult::failed(&self.name, e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe").field("name", &self.name).finish()
    }
}

/// Marks a subject as under test until dropped.
struct InFlight {
    active: Arc<Mutex<HashSet<String>>>,
    subject: String,
}

impl InFlight {
    fn acquire(
        active: &Arc<Mutex<HashSet<String>>>,
        subject: &str,
    ) -> Result<Self, CredentialError> {
        let mut set = active.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(subject.to_string()) {
            return Err(CredentialError::TestInProgress {
                subject: subject.to_string(),
            });
        }
        Ok(Self {
            active: Arc::clone(active),
            subject: subject.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.subject);
    }
}

/// Runs probe sets, one pass per subject at a time.
#[derive(Debug, Clone, Default)]
pub struct TestOrchestrator {
    active: Arc<Mutex<HashSet<String>>>,
}

impl TestOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every probe against `credential` concurrently and wait for all of
    /// them. Results come back in probe order.
    pub async fn run_probes(
        &self,
        subject: &str,
        credential: &str,
        probes: &[Probe],
    ) -> Result<Vec<TestResult>, CredentialError> {
        let _guard = InFlight::acquire(&self.active, subject)?;
        tracing::info!(subject, probes = probes.len(), "Running credential probes");

        let results =
            join_all(probes.iter().map(|probe| probe.run(credential.to_string()))).await;

        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(subject, failed, "Credential probes finished");
        Ok(results)
    }

    pub fn is_testing(&self, subject: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(subject)
    }
}

// ---------------------------------------------------------------------------
// Single-credential tester
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Idle,
    Testing,
    Success,
    Error,
}

/// What the UI shows for a key test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestState {
    pub status: TestStatus,
    pub message: String,
}

impl TestState {
    fn idle() -> Self {
        Self {
            status: TestStatus::Idle,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TesterConfig {
    /// How long a verdict stays visible.
    pub result_display: Duration,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            result_display: Duration::from_millis(5000),
        }
    }
}

struct TesterInner {
    generation: u64,
    revert: Option<AbortHandle>,
    state_tx: watch::Sender<TestState>,
}

/// Tests one credential with one probe, tracking
/// `Idle -> Testing -> {Success, Error} -> Idle`.
pub struct KeyTester {
    probe: Probe,
    config: TesterConfig,
    inner: Arc<Mutex<TesterInner>>,
    state_rx: watch::Receiver<TestState>,
}

impl KeyTester {
    pub fn new(probe: Probe, config: TesterConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(TestState::idle());
        Self {
            probe,
            config,
            inner: Arc::new(Mutex::new(TesterInner {
                generation: 0,
                revert: None,
                state_tx,
            })),
            state_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TesterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TestState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TestState> {
        self.state_rx.clone()
    }

    /// Validate `credential`.
    ///
    /// Fails with [`CredentialError::TestInProgress`] while a test is running
    /// and with [`CredentialError::Cancelled`] when [`KeyTester::reset`] ran
    /// before the validator answered.
    pub async fn test_one(&self, credential: &str) -> Result<TestResult, CredentialError> {
        let generation = {
            let mut inner = self.lock();
            if inner.state_tx.borrow().status == TestStatus::Testing {
                return Err(CredentialError::TestInProgress {
                    subject: self.probe.name().to_string(),
                });
            }
            if let Some(revert) = inner.revert.take() {
                revert.abort();
            }
            inner.generation += 1;
            inner.state_tx.send_replace(TestState {
                status: TestStatus::Testing,
                message: "Testing API key...".to_string(),
            });
            inner.generation
        };

        let outcome = (self.probe.invoke)(credential.to_string()).await;

        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(CredentialError::Cancelled);
        }
        let result = match outcome {
            Ok(message) => TestResult::passed(self.probe.name(), message),
            Err(CredentialError::ValidationRejected(message)) => {
                TestResult::failed(self.probe.name(), message)
            }
            Err(e) => {
                tracing::warn!(probe = %self.probe.name(), error = %e, "Key test failed");
                TestResult::failed(self.probe.name(), "Test failed")
            }
        };
        inner.state_tx.send_replace(TestState {
            status: if result.success {
                TestStatus::Success
            } else {
                TestStatus::Error
            },
            message: result.message.clone(),
        });
        self.schedule_revert(&mut inner, generation);
        Ok(result)
    }

    /// Return to idle at once and discard any verdict still in flight.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if let Some(revert) = inner.revert.take() {
            revert.abort();
        }
        inner.generation += 1;
        inner.state_tx.send_replace(TestState::idle());
    }

    fn schedule_revert(&self, inner: &mut TesterInner, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let display = self.config.result_display;
        let shared = Arc::clone(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(display).await;
            let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.generation == generation {
                inner.revert = None;
                inner.state_tx.send_replace(TestState::idle());
            }
        });
        inner.revert = Some(handle.abort_handle());
    }
}

impl Drop for KeyTester {
    fn drop(&mut self) {
        if let Some(revert) = self.lock().revert.take() {
            revert.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    fn passing(name: &str) -> Probe {
        Probe::new(name, |credential: String| -> ProbeFuture {
            Box::pin(async move { Ok(format!("accepted {credential}")) })
        })
    }

    fn failing(name: &str, cause: &'static str) -> Probe {
        Probe::new(name, move |_: String| -> ProbeFuture {
            Box::pin(async move { Err(CredentialError::ValidationRejected(cause.to_string())) })
        })
    }

    fn gated(name: &str, gate: Arc<Notify>) -> Probe {
        Probe::new(name, move |_: String| -> ProbeFuture {
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                gate.notified().await;
                Ok("done".to_string())
            })
        })
    }

    #[tokio::test]
    async fn partial_failure_reports_every_probe() {
        let orchestrator = TestOrchestrator::new();
        let probes = vec![passing("A"), failing("B", "401 Unauthorized")];

        let results = orchestrator.run_probes("token", "tok", &probes).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], TestResult::passed("A", "accepted tok"));
        assert_eq!(results[1], TestResult::failed("B", "401 Unauthorized"));
        assert!(!orchestrator.is_testing("token"));
    }

    #[tokio::test]
    async fn probes_run_concurrently() {
        // Each probe waits for the other to start; sequential dispatch would hang.
        let a_started = Arc::new(Notify::new());
        let b_started = Arc::new(Notify::new());
        let (a_wait, a_signal) = (Arc::clone(&b_started), Arc::clone(&a_started));
        let (b_wait, b_signal) = (Arc::clone(&a_started), Arc::clone(&b_started));
        let probes = vec![
            Probe::new("A", move |_: String| -> ProbeFuture {
                let (wait, signal) = (Arc::clone(&a_wait), Arc::clone(&a_signal));
                Box::pin(async move {
                    signal.notify_one();
                    wait.notified().await;
                    Ok("a".to_string())
                })
            }),
            Probe::new("B", move |_: String| -> ProbeFuture {
                let (wait, signal) = (Arc::clone(&b_wait), Arc::clone(&b_signal));
                Box::pin(async move {
                    signal.notify_one();
                    wait.notified().await;
                    Ok("b".to_string())
                })
            }),
        ];

        let results = tokio::time::timeout(
            Duration::from_secs(5),
            TestOrchestrator::new().run_probes("token", "tok", &probes),
        )
        .await
        .expect("probes deadlocked")
        .unwrap();
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn overlapping_pass_for_same_subject_is_rejected() {
        let orchestrator = TestOrchestrator::new();
        let gate = Arc::new(Notify::new());
        let probes = vec![gated("A", Arc::clone(&gate))];

        let first = {
            let orchestrator = orchestrator.clone();
            let probes = probes.clone();
            tokio::spawn(async move { orchestrator.run_probes("token", "tok", &probes).await })
        };
        tokio::task::yield_now().await;
        assert!(orchestrator.is_testing("token"));

        let second = orchestrator.run_probes("token", "tok", &probes).await;
        assert_eq!(
            second,
            Err(CredentialError::TestInProgress {
                subject: "token".to_string()
            })
        );

        // Other subjects are unaffected.
        let other = orchestrator
            .run_probes("other", "tok", &[passing("C")])
            .await
            .unwrap();
        assert_eq!(other.len(), 1);

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert!(!orchestrator.is_testing("token"));
    }

    #[tokio::test(start_paused = true)]
    async fn key_test_success_reverts_to_idle() {
        let tester = KeyTester::new(passing("captcha"), TesterConfig::default());
        assert_eq!(tester.state().status, TestStatus::Idle);

        let result = tester.test_one("key").await.unwrap();
        assert!(result.success);
        assert_eq!(tester.state().status, TestStatus::Success);
        assert_eq!(tester.state().message, "accepted key");

        sleep(Duration::from_millis(4900)).await;
        assert_eq!(tester.state().status, TestStatus::Success);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(tester.state(), TestState::idle());
    }

    #[tokio::test(start_paused = true)]
    async fn key_test_rejection_shows_cause() {
        let tester = KeyTester::new(
            failing("captcha", "ERROR_KEY_DOES_NOT_EXIST"),
            TesterConfig::default(),
        );

        let result = tester.test_one("key").await.unwrap();
        assert!(!result.success);
        assert_eq!(tester.state().status, TestStatus::Error);
        assert_eq!(tester.state().message, "ERROR_KEY_DOES_NOT_EXIST");
    }

    #[tokio::test(start_paused = true)]
    async fn key_test_transport_failure_is_generic() {
        let probe = Probe::new("captcha", |_: String| -> ProbeFuture {
            Box::pin(async { Err(CredentialError::RemoteUnavailable("dns".to_string())) })
        });
        let tester = KeyTester::new(probe, TesterConfig::default());

        let result = tester.test_one("key").await.unwrap();
        assert_eq!(result, TestResult::failed("captcha", "Test failed"));
    }

    #[tokio::test]
    async fn key_test_rejects_overlap_and_honours_reset() {
        let gate = Arc::new(Notify::new());
        let tester = Arc::new(KeyTester::new(
            gated("captcha", Arc::clone(&gate)),
            TesterConfig::default(),
        ));

        let first = {
            let tester = Arc::clone(&tester);
            tokio::spawn(async move { tester.test_one("key").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(tester.state().status, TestStatus::Testing);

        assert!(matches!(
            tester.test_one("key").await,
            Err(CredentialError::TestInProgress { .. })
        ));

        tester.reset();
        gate.notify_one();
        assert_eq!(first.await.unwrap(), Err(CredentialError::Cancelled));
        assert_eq!(tester.state(), TestState::idle());
    }
}

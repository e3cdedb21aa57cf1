//! Debounced persistence of user-edited fields.
//!
//! A [`FieldPersister`] watches one field. Every observation of the field's
//! current value goes through [`FieldPersister::watch`]; once the trimmed
//! value has stayed put for the quiet period, exactly one commit is issued.
//!
//! Rules:
//! - the first observation after creation or teardown is a load, never a save;
//! - blank values and values equal to the baseline never arm a timer;
//! - each change of value restarts the quiet period (last write wins);
//! - at most one commit is in flight; an edit arriving meanwhile is compared
//!   against the value being written, queued when it differs, and re-armed
//!   once the commit resolves;
//! - the baseline only advances on a confirmed commit, and failures are never
//!   retried automatically;
//! - [`FieldPersister::cancel`] drops any scheduled value, and the result of a
//!   commit already in flight is discarded.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::model::CredentialRecord;
use crate::remote::RemoteError;

/// Timing of a persister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersisterConfig {
    /// Inactivity required before a commit.
    pub quiet_period: Duration,
    /// How long [`SaveStatus::Saved`] is shown before reverting to idle.
    pub saved_display: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(2000),
            saved_display: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaveStatus {
    Idle,
    Scheduled,
    Saving,
    Saved,
    Failed,
}

/// Snapshot of a persister's bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceTask {
    pub field_id: String,
    pub baseline_value: String,
    pub pending_value: Option<String>,
    pub status: SaveStatus,
    pub scheduled_at: Option<Instant>,
    pub quiet_period: Duration,
}

pub type CommitFuture = Pin<Box<dyn Future<Output = Result<CredentialRecord, RemoteError>> + Send>>;

/// Saves a settled value and returns the updated record.
pub type CommitFn = Arc<dyn Fn(String) -> CommitFuture + Send + Sync>;

/// Called with the field id and the updated record after every confirmed
/// commit.
pub type CommitListener = Arc<dyn Fn(&str, &CredentialRecord) + Send + Sync>;

struct Inner {
    task: PersistenceTask,
    hydrated: bool,
    /// Baseline last passed in by the caller; a change means the canonical
    /// record moved and is adopted.
    reported_baseline: Option<String>,
    /// Value of the commit currently in flight.
    in_flight: Option<String>,
    /// Bumped on every arm and teardown; stale timers compare against it.
    generation: u64,
    /// Bumped on teardown; in-flight commits compare against it.
    epoch: u64,
    timer: Option<AbortHandle>,
    revert: Option<AbortHandle>,
    listener: Option<CommitListener>,
    status_tx: watch::Sender<SaveStatus>,
}

impl Inner {
    fn set_status(&mut self, status: SaveStatus) {
        self.task.status = status;
        self.status_tx.send_replace(status);
    }

    /// Drop a scheduled value and its timer.
    fn unschedule(&mut self) {
        self.abort_timers();
        self.generation += 1;
        self.task.pending_value = None;
        self.task.scheduled_at = None;
        self.set_status(SaveStatus::Idle);
    }

    fn abort_timers(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(revert) = self.revert.take() {
            revert.abort();
        }
    }
}

struct Shared {
    field_id: String,
    config: PersisterConfig,
    commit: CommitFn,
    inner: Mutex<Inner>,
}

/// Debounced committer for a single field of a single subject.
pub struct FieldPersister {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<SaveStatus>,
}

impl FieldPersister {
    pub fn new(field_id: impl Into<String>, config: PersisterConfig, commit: CommitFn) -> Self {
        let field_id = field_id.into();
        let (status_tx, status_rx) = watch::channel(SaveStatus::Idle);
        let inner = Inner {
            task: PersistenceTask {
                field_id: field_id.clone(),
                baseline_value: String::new(),
                pending_value: None,
                status: SaveStatus::Idle,
                scheduled_at: None,
                quiet_period: config.quiet_period,
            },
            hydrated: false,
            reported_baseline: None,
            in_flight: None,
            generation: 0,
            epoch: 0,
            timer: None,
            revert: None,
            listener: None,
            status_tx,
        };
        Self {
            shared: Arc::new(Shared {
                field_id,
                config,
                commit,
                inner: Mutex::new(inner),
            }),
            status_rx,
        }
    }

    /// Register the callback invoked after each confirmed commit.
    pub fn set_listener(&self, listener: CommitListener) {
        self.shared.lock().listener = Some(listener);
    }

    pub fn field_id(&self) -> &str {
        &self.shared.field_id
    }

    /// Observe the field's current value against the caller's baseline.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch(&self, current: &str, baseline: &str) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        let baseline = baseline.trim();

        if inner.reported_baseline.as_deref() != Some(baseline) {
            inner.reported_baseline = Some(baseline.to_string());
            if inner.task.status != SaveStatus::Saving {
                inner.task.baseline_value = baseline.to_string();
            }
        }

        if !inner.hydrated {
            inner.hydrated = true;
            tracing::debug!(field = %shared.field_id, "First observation, treating as load");
            return;
        }

        let value = current.trim();
        if inner.task.status == SaveStatus::Saving {
            // The baseline is about to become the in-flight value.
            if value.is_empty() || inner.in_flight.as_deref() == Some(value) {
                inner.task.pending_value = None;
            } else {
                tracing::debug!(field = %shared.field_id, "Save in flight, queueing edit");
                inner.task.pending_value = Some(value.to_string());
            }
            return;
        }

        if value.is_empty() || value == inner.task.baseline_value {
            // Settled back on what is already persisted.
            if inner.task.status == SaveStatus::Scheduled {
                inner.unschedule();
            }
            return;
        }

        match inner.task.status {
            SaveStatus::Scheduled if inner.task.pending_value.as_deref() == Some(value) => {}
            _ => shared.arm(&mut inner, value.to_string()),
        }
    }

    /// Forget an edit that turned out not to need saving: a scheduled save is
    /// cancelled and an edit queued behind a save in flight is dropped.
    pub fn discard_pending(&self) {
        let mut inner = self.shared.lock();
        match inner.task.status {
            SaveStatus::Scheduled => inner.unschedule(),
            SaveStatus::Saving => inner.task.pending_value = None,
            _ => {}
        }
    }

    /// Whether an edit is waiting to be saved.
    pub fn has_pending(&self) -> bool {
        self.shared.lock().task.pending_value.is_some()
    }

    /// Tear down: cancel timers without committing and forget hydration.
    pub fn cancel(&self) {
        let mut inner = self.shared.lock();
        inner.abort_timers();
        inner.generation += 1;
        inner.epoch += 1;
        inner.hydrated = false;
        inner.reported_baseline = None;
        inner.in_flight = None;
        inner.task.pending_value = None;
        inner.task.scheduled_at = None;
        inner.set_status(SaveStatus::Idle);
    }

    pub fn status(&self) -> SaveStatus {
        *self.status_rx.borrow()
    }

    /// Receiver that follows every status transition.
    pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
        self.status_rx.clone()
    }

    pub fn snapshot(&self) -> PersistenceTask {
        self.shared.lock().task.clone()
    }

    pub fn baseline(&self) -> String {
        self.shared.lock().task.baseline_value.clone()
    }

    pub fn is_hydrated(&self) -> bool {
        self.shared.lock().hydrated
    }
}

impl Drop for FieldPersister {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for FieldPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldPersister")
            .field("field_id", &self.shared.field_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)start the quiet period for `value`.
    fn arm(self: &Arc<Self>, inner: &mut Inner, value: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(field = %self.field_id, "No Tokio runtime, edit not scheduled");
            return;
        };

        inner.abort_timers();
        inner.generation += 1;
        inner.task.pending_value = Some(value);
        inner.task.scheduled_at = Some(Instant::now());
        inner.set_status(SaveStatus::Scheduled);

        let generation = inner.generation;
        let quiet_period = self.config.quiet_period;
        let shared = Arc::clone(self);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(quiet_period).await;
            shared.fire(generation).await;
        });
        inner.timer = Some(handle.abort_handle());
    }

    async fn fire(self: Arc<Self>, generation: u64) {
        let (value, epoch) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            // Detach: teardown from here on must not abort the commit.
            inner.timer = None;
            let Some(value) = inner.task.pending_value.take() else {
                inner.set_status(SaveStatus::Idle);
                return;
            };
            inner.task.scheduled_at = None;
            inner.in_flight = Some(value.clone());
            inner.set_status(SaveStatus::Saving);
            (value, inner.epoch)
        };

        tracing::debug!(field = %self.field_id, "Quiet period elapsed, saving");
        let result = (self.commit)(value.clone()).await;

        let notify = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                tracing::debug!(field = %self.field_id, "Subject changed mid-save, discarding result");
                return;
            }
            inner.in_flight = None;

            let notify = match result {
                Ok(record) => {
                    metrics::counter!("flowkey_commits_total", "field" => self.field_id.clone())
                        .increment(1);
                    tracing::info!(field = %self.field_id, "Field saved");
                    inner.task.baseline_value = value;
                    inner.set_status(SaveStatus::Saved);
                    self.schedule_revert(&mut inner);
                    inner.listener.clone().map(|listener| (listener, record))
                }
                Err(e) => {
                    metrics::counter!(
                        "flowkey_commit_failures_total",
                        "field" => self.field_id.clone()
                    )
                    .increment(1);
                    tracing::warn!(field = %self.field_id, error = %e, "Auto-save failed");
                    inner.set_status(SaveStatus::Failed);
                    None
                }
            };

            if let Some(next) = inner.task.pending_value.take()
                && next != inner.task.baseline_value
            {
                self.arm(&mut inner, next);
            }
            notify
        };

        if let Some((listener, record)) = notify {
            listener(&self.field_id, &record);
        }
    }

    fn schedule_revert(self: &Arc<Self>, inner: &mut Inner) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let generation = inner.generation;
        let display = self.config.saved_display;
        let shared = Arc::clone(self);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(display).await;
            let mut inner = shared.lock();
            if inner.generation == generation && inner.task.status == SaveStatus::Saved {
                inner.revert = None;
                inner.set_status(SaveStatus::Idle);
            }
        });
        inner.revert = Some(handle.abort_handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::sleep;

    const QUIET: Duration = Duration::from_millis(2000);

    /// Scripted commit target.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl Recorder {
        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                gate: Some(gate),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn commit_fn(self: &Arc<Self>) -> CommitFn {
            let recorder = Arc::clone(self);
            Arc::new(move |value: String| -> CommitFuture {
                let recorder = Arc::clone(&recorder);
                Box::pin(async move {
                    recorder.calls.lock().unwrap().push(value.clone());
                    let now = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);
                    if let Some(gate) = &recorder.gate {
                        gate.notified().await;
                    }
                    recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
                    if recorder.fail.load(Ordering::SeqCst) {
                        Err(RemoteError::Http("connection reset".to_string()))
                    } else {
                        Ok(CredentialRecord::new("u1").with_auth_token(value))
                    }
                })
            })
        }
    }

    fn persister(recorder: &Arc<Recorder>) -> FieldPersister {
        FieldPersister::new("auth-token", PersisterConfig::default(), recorder.commit_fn())
    }

    #[tokio::test(start_paused = true)]
    async fn first_observation_never_saves() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);

        p.watch("pasted-token", "");
        sleep(QUIET * 2).await;

        assert!(recorder.calls().is_empty());
        assert_eq!(p.status(), SaveStatus::Idle);
        assert!(p.is_hydrated());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_coalesce_into_one_commit() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);
        p.watch("", "");

        p.watch("v1", "");
        sleep(Duration::from_millis(500)).await;
        p.watch("v2", "");
        sleep(Duration::from_millis(500)).await;
        p.watch("  v3 ", "");
        assert_eq!(p.status(), SaveStatus::Scheduled);

        sleep(Duration::from_millis(1900)).await;
        assert!(recorder.calls().is_empty(), "quiet period restarted on v3");

        sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.calls(), vec!["v3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_identical_observation_does_not_restart_timer() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);
        p.watch("", "");

        p.watch("abc", "");
        sleep(Duration::from_millis(1500)).await;
        p.watch("abc ", "");
        sleep(Duration::from_millis(600)).await;

        assert_eq!(recorder.calls(), vec!["abc"]);
    }

    #[tokio::test(start_paused = true)]
    async fn value_equal_to_baseline_is_a_noop() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);
        p.watch("saved", "saved");

        p.watch(" saved ", "saved");
        assert_eq!(p.status(), SaveStatus::Idle);
        assert!(p.snapshot().scheduled_at.is_none());

        p.watch("   ", "saved");
        assert_eq!(p.status(), SaveStatus::Idle);

        sleep(QUIET * 2).await;
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_back_to_baseline_cancels_schedule() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);
        p.watch("orig", "orig");

        p.watch("origx", "orig");
        assert_eq!(p.status(), SaveStatus::Scheduled);
        p.watch("orig", "orig");
        assert_eq!(p.status(), SaveStatus::Idle);

        sleep(QUIET * 2).await;
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_with_zero_quiet_period() {
        let recorder = Arc::new(Recorder::default());
        let config = PersisterConfig {
            quiet_period: Duration::ZERO,
            ..Default::default()
        };
        let p = FieldPersister::new("auth-token", config, recorder.commit_fn());
        p.watch("", "");

        p.watch("secret", "");
        sleep(Duration::from_millis(1)).await;

        assert_eq!(p.baseline(), "secret");
        assert_eq!(p.status(), SaveStatus::Saved);

        sleep(Duration::from_millis(3010)).await;
        assert_eq!(p.status(), SaveStatus::Idle);
        assert_eq!(recorder.calls(), vec!["secret"]);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_receives_updated_record() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        p.set_listener(Arc::new(move |field: &str, record: &CredentialRecord| {
            sink.lock()
                .unwrap()
                .push((field.to_string(), record.auth_token().to_string()));
        }));
        p.watch("", "");

        p.watch("tok", "");
        sleep(QUIET + Duration::from_millis(1)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("auth-token".to_string(), "tok".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_baseline_and_does_not_retry() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail.store(true, Ordering::SeqCst);
        let p = persister(&recorder);
        p.watch("old", "old");

        p.watch("new", "old");
        sleep(QUIET + Duration::from_millis(1)).await;
        assert_eq!(p.status(), SaveStatus::Failed);
        assert_eq!(p.baseline(), "old");

        sleep(QUIET * 5).await;
        assert_eq!(recorder.calls().len(), 1, "no automatic retry");

        recorder.fail.store(false, Ordering::SeqCst);
        p.watch("newer", "old");
        sleep(QUIET + Duration::from_millis(1)).await;
        assert_eq!(p.status(), SaveStatus::Saved);
        assert_eq!(recorder.calls(), vec!["new", "newer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_save_is_queued_not_overlapped() {
        let gate = Arc::new(Notify::new());
        let recorder = Recorder::gated(Arc::clone(&gate));
        let p = persister(&recorder);
        p.watch("", "");

        p.watch("first", "");
        sleep(QUIET + Duration::from_millis(1)).await;
        assert_eq!(p.status(), SaveStatus::Saving);

        p.watch("second", "");
        assert_eq!(p.status(), SaveStatus::Saving);
        assert_eq!(p.snapshot().pending_value.as_deref(), Some("second"));

        sleep(QUIET * 3).await;
        assert_eq!(recorder.calls(), vec!["first"], "second waits for the first");

        gate.notify_one();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(p.status(), SaveStatus::Scheduled);
        assert_eq!(p.baseline(), "first");

        sleep(QUIET).await;
        gate.notify_one();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(recorder.calls(), vec!["first", "second"]);
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(p.status(), SaveStatus::Saved);
        assert_eq!(p.baseline(), "second");
    }

    #[tokio::test(start_paused = true)]
    async fn revert_during_save_is_committed_after_it() {
        let gate = Arc::new(Notify::new());
        let recorder = Recorder::gated(Arc::clone(&gate));
        let p = persister(&recorder);
        p.watch("a", "a");

        p.watch("b", "a");
        sleep(QUIET + Duration::from_millis(1)).await;
        assert_eq!(p.status(), SaveStatus::Saving);

        // Back to the old baseline while "b" is being written.
        p.watch("a", "a");
        assert_eq!(p.snapshot().pending_value.as_deref(), Some("a"));
        // Typing the in-flight value again needs nothing further.
        p.watch("b", "a");
        assert!(!p.has_pending());
        p.watch(" a ", "a");
        assert!(p.has_pending());

        gate.notify_one();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(p.baseline(), "b");
        assert_eq!(p.status(), SaveStatus::Scheduled);

        sleep(QUIET).await;
        gate.notify_one();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(recorder.calls(), vec!["b", "a"]);
        assert_eq!(p.baseline(), "a");
        assert_eq!(p.status(), SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_pending_cancels_schedule_and_queue() {
        let gate = Arc::new(Notify::new());
        let recorder = Recorder::gated(Arc::clone(&gate));
        let p = persister(&recorder);
        p.watch("", "");

        p.watch("x", "");
        p.discard_pending();
        assert_eq!(p.status(), SaveStatus::Idle);
        sleep(QUIET * 2).await;
        assert!(recorder.calls().is_empty());

        p.watch("y", "");
        sleep(QUIET + Duration::from_millis(1)).await;
        p.watch("z", "");
        p.discard_pending();
        assert_eq!(p.status(), SaveStatus::Saving);
        assert!(!p.has_pending());

        gate.notify_one();
        sleep(QUIET * 2).await;
        assert_eq!(recorder.calls(), vec!["y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_scheduled_value() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);
        p.watch("", "");

        p.watch("unsaved", "");
        p.cancel();
        sleep(QUIET * 2).await;

        assert!(recorder.calls().is_empty());
        assert_eq!(p.status(), SaveStatus::Idle);
        assert!(!p.is_hydrated());

        // Re-observed fresh: the next value is a load again.
        p.watch("unsaved", "");
        sleep(QUIET * 2).await;
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_in_flight_result() {
        let gate = Arc::new(Notify::new());
        let recorder = Recorder::gated(Arc::clone(&gate));
        let p = persister(&recorder);
        let notified = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&notified);
        p.set_listener(Arc::new(move |_: &str, _: &CredentialRecord| {
            flag.store(true, Ordering::SeqCst);
        }));
        p.watch("", "");

        p.watch("value", "");
        sleep(QUIET + Duration::from_millis(1)).await;
        assert_eq!(p.status(), SaveStatus::Saving);

        p.cancel();
        gate.notify_one();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(recorder.calls(), vec!["value"], "in-flight call completes");
        assert!(!notified.load(Ordering::SeqCst));
        assert_eq!(p.status(), SaveStatus::Idle);
        assert_eq!(p.baseline(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn status_channel_reports_transitions() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);
        let mut rx = p.subscribe();
        p.watch("", "");

        p.watch("x", "");
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SaveStatus::Scheduled);

        sleep(QUIET + Duration::from_millis(1)).await;
        assert_eq!(*rx.borrow_and_update(), SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn external_baseline_change_is_adopted() {
        let recorder = Arc::new(Recorder::default());
        let p = persister(&recorder);
        p.watch("a", "a");

        // Another surface saved "b"; the field now shows it.
        p.watch("b", "b");
        assert_eq!(p.status(), SaveStatus::Idle);
        assert_eq!(p.baseline(), "b");

        sleep(QUIET * 2).await;
        assert!(recorder.calls().is_empty());
    }
}

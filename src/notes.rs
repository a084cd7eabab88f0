//! Note reconciliation between the local store and the commerce platform.
//!
//! Keeps the free-text order note consistent across a local SQLite store
//! and an external system that may be slow, rate-limited, or briefly
//! unavailable, while never losing the user's most recent keystroke and
//! never overwriting it with stale data.
//!
//! Per open order: hydrate from local storage once, pull the authoritative
//! value in the background (single-flight, 10s timeout), debounce local
//! edits into save-then-push, and retry failed pushes a bounded number of
//! times. Freshness is tracked with a monotonic per-session edit revision
//! so out-of-order network responses can never clobber newer local state.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::SystemOfRecord;
use crate::config::EngineConfig;
use crate::db::{self, DbState};
use crate::model::FulfillmentOrder;

/// Where the note stands relative to the external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Saving,
    Saved,
    PendingSync,
}

/// Serializable view of the sync state for the host UI.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSyncSnapshot {
    pub phase: SyncPhase,
    pub retry_attempt: u32,
    pub hydrated: bool,
    pub fresh_from_external: bool,
    /// True while the displayed value differs from the last confirmed one.
    pub dirty: bool,
}

struct NoteState {
    local_value: String,
    last_confirmed_value: Option<String>,
    phase: SyncPhase,
    retry_attempt: u32,
    hydrated: bool,
    fresh_from_external: bool,
    /// Bumps on every user edit. The freshness clock for pull/push results.
    revision: u64,
    /// Highest revision covered by a confirmed push or applied pull.
    confirmed_revision: u64,
    pull_in_flight: bool,
}

struct NoteShared {
    order_id: String,
    external_id: Option<String>,
    /// Cancelled order: hydrate/pull still run (read-only display), but
    /// edits, pushes, retries and manual resync are no-ops.
    frozen: bool,
    db: Arc<DbState>,
    external: Arc<dyn SystemOfRecord>,
    state: Mutex<NoteState>,
    /// Serializes pushes so no two run concurrently for this order.
    push_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    debounce: Duration,
    retry_delay: Duration,
    max_retries: u32,
    pull_timeout: Duration,
}

/// One note-reconciliation session per open order. Dropping the session
/// cancels all pending timers and background work.
pub struct NoteSession {
    shared: Arc<NoteShared>,
}

impl NoteSession {
    /// Hydrate from local storage and start the background pull.
    pub fn open(
        order: &FulfillmentOrder,
        db: Arc<DbState>,
        external: Arc<dyn SystemOfRecord>,
        config: &EngineConfig,
    ) -> Self {
        let shared = Arc::new(NoteShared {
            order_id: order.id.clone(),
            external_id: order.external_id.clone(),
            frozen: order.cancelled,
            db,
            external,
            state: Mutex::new(NoteState {
                local_value: String::new(),
                last_confirmed_value: None,
                phase: SyncPhase::Idle,
                retry_attempt: 0,
                hydrated: false,
                fresh_from_external: false,
                revision: 0,
                confirmed_revision: 0,
                pull_in_flight: false,
            }),
            push_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            debounce_task: Mutex::new(None),
            debounce: config.note_debounce(),
            retry_delay: config.note_retry_delay(),
            max_retries: config.note_max_retries,
            pull_timeout: config.note_pull_timeout(),
        });

        Self::hydrate(&shared, order.note.as_deref());
        Self::begin_pull(&shared, false);

        Self { shared }
    }

    /// Read the locally persisted note once per session. Skipped entirely
    /// when a background pull already supplied authoritative data.
    fn hydrate(shared: &Arc<NoteShared>, order_record_note: Option<&str>) {
        let local = match db::get_note(&shared.db, &shared.order_id) {
            Ok(note) => note,
            Err(e) => {
                warn!(order_id = %shared.order_id, error = %e, "note hydration read failed");
                None
            }
        };

        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.hydrated || state.fresh_from_external {
            return;
        }
        state.hydrated = true;
        if let Some(note) = local.or_else(|| order_record_note.map(str::to_string)) {
            state.local_value = note;
        }
        debug!(order_id = %shared.order_id, "note hydrated from local store");
    }

    /// Current displayed value.
    pub fn current_value(&self) -> String {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.local_value.clone()
    }

    pub fn snapshot(&self) -> NoteSyncSnapshot {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        NoteSyncSnapshot {
            phase: state.phase,
            retry_attempt: state.retry_attempt,
            hydrated: state.hydrated,
            fresh_from_external: state.fresh_from_external,
            dirty: state.last_confirmed_value.as_deref() != Some(state.local_value.as_str()),
        }
    }

    /// Record a user edit and (re)start the autosave debounce.
    pub fn edit(&self, text: &str) {
        if self.shared.frozen {
            debug!(order_id = %self.shared.order_id, "edit ignored, order is cancelled");
            return;
        }

        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.local_value = text.to_string();
            state.revision += 1;
            state.phase = SyncPhase::Idle;
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = tokio::time::sleep(shared.debounce) => {}
            }
            Self::flush(shared).await;
        });

        let mut slot = self
            .shared
            .debounce_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Debounce expiry: save locally, then push whatever is current.
    async fn flush(shared: Arc<NoteShared>) {
        let (value, revision) = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.last_confirmed_value.as_deref() == Some(state.local_value.as_str()) {
                return;
            }
            state.phase = SyncPhase::Saving;
            (state.local_value.clone(), state.revision)
        };

        // Local save first; synchronous and effectively infallible from the
        // operator's perspective. A storage-level failure is logged and the
        // push still proceeds.
        if let Err(e) = db::save_note(&shared.db, &shared.order_id, &value) {
            warn!(order_id = %shared.order_id, error = %e, "local note save failed");
        }

        Self::push_with_retries(shared, value, revision).await;
    }

    /// Push a value, retrying a bounded number of times. A newer edit
    /// supersedes any scheduled retry (checked by value at fire time).
    async fn push_with_retries(shared: Arc<NoteShared>, value: String, mut revision: u64) {
        let Some(external_id) = shared.external_id.clone() else {
            // No external ref: the local save is all the durability we get.
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if revision >= state.confirmed_revision {
                state.last_confirmed_value = Some(value);
                state.confirmed_revision = revision;
            }
            state.phase = SyncPhase::Saved;
            debug!(order_id = %shared.order_id, "note saved locally only (no external ref)");
            return;
        };

        loop {
            let result = {
                let _permit = shared.push_lock.lock().await;
                let idempotency_key = format!("{}:{}", shared.order_id, Uuid::new_v4());
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    r = shared
                        .external
                        .push_note(&external_id, &value, &idempotency_key) => r,
                }
            };

            match result {
                Ok(()) => {
                    {
                        let mut state =
                            shared.state.lock().unwrap_or_else(|e| e.into_inner());
                        // Never regress behind a newer confirmed value.
                        if revision >= state.confirmed_revision {
                            state.last_confirmed_value = Some(value.clone());
                            state.confirmed_revision = revision;
                        }
                        state.retry_attempt = 0;
                        state.phase = if state.revision == revision {
                            SyncPhase::Saved
                        } else {
                            // A newer edit is waiting on its own debounce.
                            SyncPhase::Idle
                        };
                    }
                    let _ = db::set_setting(
                        &shared.db,
                        "sync",
                        "last_confirmed_at",
                        &chrono::Utc::now().to_rfc3339(),
                    );
                    info!(order_id = %shared.order_id, "note push confirmed");
                    return;
                }
                Err(e) => {
                    let attempt = {
                        let mut state =
                            shared.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.phase = SyncPhase::PendingSync;
                        state.retry_attempt
                    };

                    if attempt >= shared.max_retries {
                        // Give up silently; pending_sync persists until the
                        // user edits again or forces a resync.
                        debug!(
                            order_id = %shared.order_id,
                            attempts = attempt + 1,
                            "note push retries exhausted"
                        );
                        return;
                    }

                    {
                        let mut state =
                            shared.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.retry_attempt += 1;
                    }
                    warn!(
                        order_id = %shared.order_id,
                        error = %e,
                        attempt = attempt + 1,
                        "note push failed, retry scheduled"
                    );

                    tokio::select! {
                        _ = shared.cancel.cancelled() => return,
                        _ = tokio::time::sleep(shared.retry_delay) => {}
                    }

                    // Value equality at retry time, not just elapsed time.
                    let superseded = {
                        let state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                        if state.local_value != value {
                            true
                        } else {
                            revision = state.revision;
                            false
                        }
                    };
                    if superseded {
                        debug!(order_id = %shared.order_id, "note retry superseded by newer edit");
                        return;
                    }
                }
            }
        }
    }

    /// Start the background pull of the authoritative note. Non-forced
    /// pulls are single-flight per order and skipped once fresh external
    /// data has arrived this session.
    fn begin_pull(shared: &Arc<NoteShared>, force: bool) {
        let Some(external_id) = shared.external_id.clone() else {
            return;
        };

        let revision_at_start = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if !force && (state.pull_in_flight || state.fresh_from_external) {
                debug!(order_id = %shared.order_id, "note pull skipped (in flight or already fresh)");
                return;
            }
            state.pull_in_flight = true;
            state.revision
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shared.cancel.cancelled() => {
                    // Order was closed; discard, the response no longer has
                    // a current order to apply to.
                    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.pull_in_flight = false;
                    return;
                }
                r = tokio::time::timeout(
                    shared.pull_timeout,
                    shared.external.pull_note(&external_id),
                ) => r,
            };

            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pull_in_flight = false;

            match result {
                Ok(Ok(note)) => {
                    if state.confirmed_revision > revision_at_start {
                        // A push confirmed newer data while the pull was in
                        // the air; the pulled value is stale.
                        debug!(order_id = %shared.order_id, "stale note pull discarded");
                        return;
                    }
                    state.fresh_from_external = true;
                    state.last_confirmed_value = Some(note.clone());
                    state.confirmed_revision = revision_at_start;
                    if state.revision == revision_at_start {
                        state.phase = if note.is_empty() {
                            SyncPhase::Idle
                        } else {
                            SyncPhase::Saved
                        };
                        state.local_value = note;
                        debug!(order_id = %shared.order_id, "note refreshed from external system");
                    } else {
                        debug!(
                            order_id = %shared.order_id,
                            "note pull completed after a local edit, keeping in-progress value"
                        );
                    }
                }
                Ok(Err(e)) => {
                    // Local/hydrated data stays authoritative on failure.
                    warn!(order_id = %shared.order_id, error = %e, "note pull failed");
                }
                Err(_) => {
                    warn!(order_id = %shared.order_id, "note pull timed out");
                }
            }
        });
    }

    /// Explicit operator refresh, bypassing the in-flight/freshness guards.
    pub fn force_resync(&self) {
        if self.shared.frozen {
            debug!(order_id = %self.shared.order_id, "resync ignored, order is cancelled");
            return;
        }
        info!(order_id = %self.shared.order_id, "manual note resync requested");
        Self::begin_pull(&self.shared, true);
    }

    /// Cancel all pending debounce/retry/pull work. Reopening the order
    /// later starts the full hydrate → pull sequence from scratch.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        let mut slot = self
            .shared
            .debounce_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        debug!(order_id = %self.shared.order_id, "note session closed");
    }
}

impl Drop for NoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShippingMethodClass;
    use crate::testkit::{sample_order, MockBackend};

    fn setup(backend: &Arc<MockBackend>) -> (Arc<DbState>, EngineConfig, FulfillmentOrder) {
        let db = Arc::new(db::init_in_memory().unwrap());
        let config = EngineConfig::default();
        let order = sample_order("ord-1", ShippingMethodClass::Standard, vec![]);
        let _ = backend;
        (db, config, order)
    }

    fn open(
        backend: &Arc<MockBackend>,
        db: &Arc<DbState>,
        config: &EngineConfig,
        order: &FulfillmentOrder,
    ) -> NoteSession {
        NoteSession::open(
            order,
            db.clone(),
            backend.clone() as Arc<dyn SystemOfRecord>,
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_collapses_to_the_latest_value() {
        let backend = Arc::new(MockBackend::new());
        let (db, config, order) = setup(&backend);
        let session = open(&backend, &db, &config, &order);

        session.edit("hem pinned");
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        session.edit("hem pinned, pressed");
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(
            backend.pushed_notes(),
            vec!["hem pinned, pressed".to_string()],
            "exactly one push, carrying the latest value"
        );
        assert_eq!(session.snapshot().phase, SyncPhase::Saved);
        assert_eq!(
            db::get_note(&db, "ord-1").unwrap().as_deref(),
            Some("hem pinned, pressed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pull_never_clobbers_an_in_progress_edit() {
        let backend = Arc::new(MockBackend::new());
        backend.set_remote_note("ord-1", "B");
        backend.set_pull_delay(Duration::from_millis(100));
        let (db, config, order) = setup(&backend);
        db::save_note(&db, "ord-1", "A").unwrap();

        let session = open(&backend, &db, &config, &order);
        assert_eq!(session.current_value(), "A", "hydrated from local store");

        // User types while the pull is still in the air.
        session.edit("C");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(session.current_value(), "C", "pull must not overwrite the edit");
        let snap = session.snapshot();
        assert!(snap.fresh_from_external);
        assert!(snap.dirty);

        // The subsequent debounced push carries "C", not "B".
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(backend.pushed_notes(), vec!["C".to_string()]);
        assert!(!session.snapshot().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_applies_cleanly_when_nothing_was_edited() {
        let backend = Arc::new(MockBackend::new());
        backend.set_remote_note("ord-1", "authoritative note");
        let (db, config, order) = setup(&backend);
        db::save_note(&db, "ord-1", "stale local").unwrap();

        let session = open(&backend, &db, &config, &order);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.current_value(), "authoritative note");
        let snap = session.snapshot();
        assert_eq!(snap.phase, SyncPhase::Saved);
        assert!(snap.fresh_from_external);
        assert!(!snap.dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_capped_then_go_silent() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_push_note(true);
        let (db, config, order) = setup(&backend);
        let session = open(&backend, &db, &config, &order);

        session.edit("wont sync");
        // Debounce (2s) + 3 retries spaced 5s apart.
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(backend.push_note_attempts(), 4, "1 initial + 3 retries");
        assert_eq!(session.snapshot().phase, SyncPhase::PendingSync);
        assert_eq!(session.snapshot().retry_attempt, 3);

        // No further automatic attempts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.push_note_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn a_newer_edit_supersedes_a_scheduled_retry() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_push_note(true);
        let (db, config, order) = setup(&backend);
        let session = open(&backend, &db, &config, &order);

        session.edit("old value");
        // First attempt fails at ~2s; a retry is scheduled for ~7s.
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(backend.push_note_attempts(), 1);

        backend.fail_push_note(false);
        session.edit("new value");
        tokio::time::sleep(Duration::from_secs(10)).await;

        let pushed = backend.pushed_notes();
        assert!(
            !pushed.contains(&"old value".to_string()),
            "stale retry must not fire: {pushed:?}"
        );
        assert_eq!(pushed.last().map(String::as_str), Some("new value"));
        assert_eq!(session.snapshot().phase, SyncPhase::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pull_is_skipped_but_failure_clears_the_guard() {
        let backend = Arc::new(MockBackend::new());
        backend.set_remote_note("ord-1", "remote");
        backend.set_pull_delay(Duration::from_millis(100));
        backend.fail_pull_note(true);
        let (db, config, order) = setup(&backend);
        db::save_note(&db, "ord-1", "local survives").unwrap();

        let session = open(&backend, &db, &config, &order);
        // A second pull while the first is outstanding is skipped.
        NoteSession::begin_pull(&session.shared, false);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(backend.pull_calls(), 1);
        assert_eq!(session.current_value(), "local survives");
        assert!(!session.snapshot().fresh_from_external);

        // The failure cleared the in-flight guard, so a later attempt runs.
        backend.fail_pull_note(false);
        session.force_resync();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.pull_calls(), 2);
        assert_eq!(session.current_value(), "remote");
    }

    #[tokio::test(start_paused = true)]
    async fn pull_timeout_leaves_local_data_authoritative() {
        let backend = Arc::new(MockBackend::new());
        backend.set_remote_note("ord-1", "remote");
        backend.set_pull_delay(Duration::from_secs(60));
        let (db, mut config, order) = setup(&backend);
        config.note_pull_timeout_ms = 500;
        db::save_note(&db, "ord-1", "local").unwrap();

        let session = open(&backend, &db, &config, &order);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(session.current_value(), "local");
        assert!(!session.snapshot().fresh_from_external);
    }

    #[tokio::test(start_paused = true)]
    async fn frozen_orders_ignore_edits_and_resync() {
        let backend = Arc::new(MockBackend::new());
        let (db, config, mut order) = setup(&backend);
        order.cancelled = true;
        db::save_note(&db, "ord-1", "read only").unwrap();

        let session = open(&backend, &db, &config, &order);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pulls_after_open = backend.pull_calls();

        session.edit("should be ignored");
        session.force_resync();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(session.current_value(), "read only");
        assert_eq!(backend.push_note_attempts(), 0);
        assert_eq!(backend.pull_calls(), pulls_after_open, "resync is disabled");
    }

    #[tokio::test(start_paused = true)]
    async fn closing_cancels_pending_debounce_and_push() {
        let backend = Arc::new(MockBackend::new());
        let (db, config, order) = setup(&backend);
        let session = open(&backend, &db, &config, &order);

        session.edit("never flushed");
        session.close();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(backend.push_note_attempts(), 0);
        assert_eq!(db::get_note(&db, "ord-1").unwrap(), None);
    }
}

//! Per-order packing session facade.
//!
//! Wires the verification counter, status machine, transition coordinator,
//! note reconciliation, and navigation cache behind one handle for the
//! presentation layer. At most one order is open at a time; opening another
//! order (or reopening the same one) cancels the previous session's timers
//! and background work and resets all per-order guards.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiError, CommerceClient, CurrentUser, OrderStore, SystemOfRecord};
use crate::cache::{self, NavigationCache};
use crate::config::EngineConfig;
use crate::db::{self, DbState, StoreError};
use crate::model::{FulfillmentOrder, LabelDefaults, OperationalStatus};
use crate::notes::{NoteSession, NoteSyncSnapshot};
use crate::status::{self, TransitionError};
use crate::transition::TransitionCoordinator;
use crate::verify::{SkuProgress, VerificationOutcome, VerificationSession};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("no order is open")]
    NoOpenOrder,
}

/// Everything the packing screen needs after opening an order.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub order: FulfillmentOrder,
    pub note: String,
    pub progress: Vec<SkuProgress>,
    /// Set when line items could not be fetched; the caller should offer a
    /// retry action (`retry_line_items`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_items_error: Option<String>,
}

/// Result of one scan event, including any auto-transition it triggered.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub outcome: VerificationOutcome,
    pub total_verified: u32,
    pub total_required: u32,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transitioned_to: Option<OperationalStatus>,
    /// Transition failures are surfaced here for the operator; guard
    /// rejections (in-flight, duplicate trigger) are absorbed silently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_error: Option<String>,
}

/// Combined sync status for status bars, in the shape the host polls.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub open_order_id: Option<String>,
    pub operational_status: Option<OperationalStatus>,
    pub total_verified: u32,
    pub total_required: u32,
    pub is_complete: bool,
    pub transition_in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<NoteSyncSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_confirmed_at: Option<String>,
}

struct OrderSession {
    order: FulfillmentOrder,
    verification: VerificationSession,
    notes: NoteSession,
    /// Completion auto-trigger fires at most once per order per session.
    auto_triggered: bool,
    line_items_error: Option<String>,
}

pub struct FulfillmentEngine {
    config: EngineConfig,
    db: Arc<DbState>,
    store: Arc<dyn OrderStore>,
    external: Arc<dyn SystemOfRecord>,
    cache: Arc<NavigationCache>,
    transitions: TransitionCoordinator,
    session: Mutex<Option<OrderSession>>,
    /// Monotonic navigation generation; rapid order switches collapse to
    /// the last requested target.
    nav_generation: AtomicU64,
}

impl FulfillmentEngine {
    pub fn new(
        config: EngineConfig,
        db: Arc<DbState>,
        store: Arc<dyn OrderStore>,
        external: Arc<dyn SystemOfRecord>,
        user: Arc<dyn CurrentUser>,
    ) -> Self {
        let cache = Arc::new(NavigationCache::new());
        let transitions = TransitionCoordinator::new(
            cache.clone(),
            store.clone(),
            external.clone(),
            user,
        );
        Self {
            config,
            db,
            store,
            external,
            cache,
            transitions,
            session: Mutex::new(None),
            nav_generation: AtomicU64::new(0),
        }
    }

    /// Convenience constructor: commerce client + on-disk database.
    pub fn connect(
        config: EngineConfig,
        data_dir: &Path,
        user: Arc<dyn CurrentUser>,
    ) -> Result<Self, EngineError> {
        let client = Arc::new(CommerceClient::new(&config)?);
        let db = Arc::new(db::init(data_dir)?);
        Ok(Self::new(
            config,
            db,
            client.clone() as Arc<dyn OrderStore>,
            client as Arc<dyn SystemOfRecord>,
            user,
        ))
    }

    pub fn cache(&self) -> &Arc<NavigationCache> {
        &self.cache
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    /// Open an order for packing. Returns `Ok(None)` when this navigation
    /// was superseded by a newer one inside the debounce window.
    ///
    /// `working_list` is the ordered list the operator is paging through;
    /// the neighbors of `id` are prefetched in the background.
    pub async fn open_order(
        &self,
        id: &str,
        working_list: &[String],
    ) -> Result<Option<OrderView>, EngineError> {
        let generation = self.nav_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let debounce = self.config.nav_debounce();
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
            if self.nav_generation.load(Ordering::SeqCst) != generation {
                debug!(order_id = %id, "navigation superseded inside debounce window");
                return Ok(None);
            }
        }

        // Leaving the previous order cancels its timers and guards.
        self.close_order();

        // Cache (and optimistic overlay) first; a miss is a normal fetch.
        let mut order = match self.transitions.resolve(id) {
            Some(order) => order,
            None => {
                let order = self.store.load_order(id).await?;
                self.cache.insert(order.clone());
                order
            }
        };

        // Line items may be sourced independently of the order record and
        // tolerate partial failure with a retryable error.
        let mut line_items_error = None;
        if order.line_items.is_empty() {
            if let Some(external_ref) = order.external_id.clone() {
                match self.store.load_line_items(&external_ref).await {
                    Ok(items) => {
                        order.line_items = items;
                        self.cache.insert(order.clone());
                    }
                    Err(e) => {
                        warn!(order_id = %id, error = %e, "line item fetch failed");
                        line_items_error = Some(e.to_string());
                    }
                }
            }
        }

        // A response for an abandoned navigation is discarded.
        if self.nav_generation.load(Ordering::SeqCst) != generation {
            debug!(order_id = %id, "navigation superseded during load, result discarded");
            return Ok(None);
        }

        if let Err(e) = db::save_snapshot(&self.db, &order) {
            warn!(order_id = %id, error = %e, "offline snapshot save failed");
        }

        let verification = VerificationSession::new(&order.line_items);
        let notes = NoteSession::open(&order, self.db.clone(), self.external.clone(), &self.config);

        cache::prefetch_neighbors(&self.cache, &self.store, working_list, id);

        let view = OrderView {
            order: order.clone(),
            note: notes.current_value(),
            progress: verification.progress(),
            line_items_error: line_items_error.clone(),
        };

        {
            let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
            if self.nav_generation.load(Ordering::SeqCst) != generation {
                notes.close();
                debug!(order_id = %id, "navigation superseded at install, session dropped");
                return Ok(None);
            }
            *guard = Some(OrderSession {
                order,
                verification,
                notes,
                auto_triggered: false,
                line_items_error,
            });
        }
        info!(order_id = %id, "order opened for packing");
        Ok(Some(view))
    }

    /// Close the open order, cancelling its timers and background work.
    pub fn close_order(&self) {
        let previous = {
            let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(session) = previous {
            session.notes.close();
            debug!(order_id = %session.order.id, "order session closed");
        }
    }

    /// Re-attempt the line item fetch after a partial open failure.
    pub async fn retry_line_items(&self) -> Result<Vec<SkuProgress>, EngineError> {
        let (order_id, external_ref) = {
            let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
            let session = guard.as_ref().ok_or(EngineError::NoOpenOrder)?;
            let external_ref =
                session
                    .order
                    .external_id
                    .clone()
                    .ok_or(TransitionError::MissingExternalRef {
                        order_id: session.order.id.clone(),
                    })?;
            (session.order.id.clone(), external_ref)
        };

        let items = self.store.load_line_items(&external_ref).await?;

        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let session = guard.as_mut().ok_or(EngineError::NoOpenOrder)?;
        if session.order.id != order_id {
            return Err(EngineError::NoOpenOrder);
        }
        session.order.line_items = items;
        session.verification = VerificationSession::new(&session.order.line_items);
        session.line_items_error = None;
        self.cache.insert(session.order.clone());
        Ok(session.verification.progress())
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    /// Record one scan event. When the scan completes verification, the
    /// completion auto-transition fires (once per order per session).
    ///
    /// The host should clear its scan input ~`config.scan_clear()` after
    /// each event to support continuous scanning; that timing is
    /// presentation policy, not counter state.
    pub async fn record_scan(&self, scanned: &str) -> Result<ScanResult, EngineError> {
        let (outcome, fire, order) = {
            let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
            let session = guard.as_mut().ok_or(EngineError::NoOpenOrder)?;

            let outcome = session.verification.record_scan(scanned);
            let mut fire = false;
            if session.verification.take_completion_signal()
                && !session.auto_triggered
                && !self.transitions.is_in_flight(&session.order.id)
            {
                session.auto_triggered = true;
                fire = true;
            }
            (outcome, fire, session.order.clone())
        };

        let mut transitioned_to = None;
        let mut transition_error = None;
        if fire {
            let target = status::completion_target(order.shipping_method_class);
            info!(
                order_id = %order.id,
                target = %target,
                "verification complete, auto-transition"
            );
            match self.transitions.apply_transition(&order, target).await {
                Ok(updated) => {
                    transitioned_to = Some(target);
                    self.adopt(updated);
                }
                Err(e) if e.is_silent_guard() => {
                    debug!(order_id = %order.id, guard = %e, "auto-transition absorbed");
                }
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "auto-transition failed");
                    transition_error = Some(e.to_string());
                }
            }
        }

        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let session = guard.as_ref().ok_or(EngineError::NoOpenOrder)?;
        Ok(ScanResult {
            outcome,
            total_verified: session.verification.total_verified(),
            total_required: session.verification.total_required(),
            is_complete: session.verification.is_complete(),
            transitioned_to,
            transition_error,
        })
    }

    /// Fold a committed order state back into the open session and the
    /// offline snapshot.
    fn adopt(&self, updated: FulfillmentOrder) {
        if let Err(e) = db::save_snapshot(&self.db, &updated) {
            warn!(order_id = %updated.id, error = %e, "offline snapshot save failed");
        }
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = guard.as_mut() {
            if session.order.id == updated.id {
                session.order = updated;
            }
        }
    }

    fn current_order(&self) -> Result<FulfillmentOrder, EngineError> {
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .map(|s| s.order.clone())
            .ok_or(EngineError::NoOpenOrder)
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    pub async fn mark_ready_for_pickup(&self) -> Result<FulfillmentOrder, EngineError> {
        let order = self.current_order()?;
        let updated = self.transitions.mark_ready_for_pickup(&order).await?;
        self.adopt(updated.clone());
        Ok(updated)
    }

    pub async fn confirm_delivery(&self) -> Result<FulfillmentOrder, EngineError> {
        let order = self.current_order()?;
        let updated = self.transitions.confirm_delivery(&order).await?;
        self.adopt(updated.clone());
        Ok(updated)
    }

    pub async fn create_shipping_label(
        &self,
        defaults: &LabelDefaults,
    ) -> Result<FulfillmentOrder, EngineError> {
        let order = self.current_order()?;
        let updated = self
            .transitions
            .create_shipping_label(&order, defaults)
            .await?;
        self.adopt(updated.clone());
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Notes
    // -----------------------------------------------------------------------

    pub fn edit_note(&self, text: &str) -> Result<(), EngineError> {
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let session = guard.as_ref().ok_or(EngineError::NoOpenOrder)?;
        session.notes.edit(text);
        Ok(())
    }

    pub fn current_note(&self) -> Result<String, EngineError> {
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let session = guard.as_ref().ok_or(EngineError::NoOpenOrder)?;
        Ok(session.notes.current_value())
    }

    pub fn force_note_resync(&self) -> Result<(), EngineError> {
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let session = guard.as_ref().ok_or(EngineError::NoOpenOrder)?;
        session.notes.force_resync();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn status(&self) -> EngineStatus {
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(session) => EngineStatus {
                open_order_id: Some(session.order.id.clone()),
                operational_status: Some(session.order.operational_status),
                total_verified: session.verification.total_verified(),
                total_required: session.verification.total_required(),
                is_complete: session.verification.is_complete(),
                transition_in_flight: self.transitions.is_in_flight(&session.order.id),
                note: Some(session.notes.snapshot()),
                last_confirmed_at: db::get_setting(&self.db, "sync", "last_confirmed_at"),
            },
            None => EngineStatus {
                open_order_id: None,
                operational_status: None,
                total_verified: 0,
                total_required: 0,
                is_complete: false,
                transition_in_flight: false,
                note: None,
                last_confirmed_at: db::get_setting(&self.db, "sync", "last_confirmed_at"),
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

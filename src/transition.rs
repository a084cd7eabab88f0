//! Optimistic status transition coordinator.
//!
//! Applies a status change locally first so dependent views observe it
//! without waiting on the network, commits it to the commerce platform in
//! the background of that call, and rolls back to authoritative state on
//! failure. At most one transition executes per order id at a time;
//! transitions for different orders run in parallel.
//!
//! Local state is two explicit layers: the authoritative `NavigationCache`
//! and a short-lived overlay of pending optimistic writes, reconciled
//! (commit or discard) when the external write settles.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{CurrentUser, OrderStore, SystemOfRecord};
use crate::cache::NavigationCache;
use crate::model::{FulfillmentOrder, LabelDefaults, OperationalStatus};
use crate::status::{self, TransitionError};

pub struct TransitionCoordinator {
    in_flight: Mutex<HashSet<String>>,
    overlay: Mutex<HashMap<String, FulfillmentOrder>>,
    cache: Arc<NavigationCache>,
    store: Arc<dyn OrderStore>,
    external: Arc<dyn SystemOfRecord>,
    user: Arc<dyn CurrentUser>,
}

/// RAII release of the per-order single-flight guard. Dropped on every
/// path out of a transition (success, failure, panic unwind).
struct FlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    order_id: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.order_id);
    }
}

impl TransitionCoordinator {
    pub fn new(
        cache: Arc<NavigationCache>,
        store: Arc<dyn OrderStore>,
        external: Arc<dyn SystemOfRecord>,
        user: Arc<dyn CurrentUser>,
    ) -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            overlay: Mutex::new(HashMap::new()),
            cache,
            store,
            external,
            user,
        }
    }

    /// Resolve an order through the optimistic overlay, falling back to the
    /// authoritative cache.
    pub fn resolve(&self, order_id: &str) -> Option<FulfillmentOrder> {
        {
            let overlay = self.overlay.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(order) = overlay.get(order_id) {
                return Some(order.clone());
            }
        }
        self.cache.get(order_id)
    }

    pub fn is_in_flight(&self, order_id: &str) -> bool {
        let set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(order_id)
    }

    fn try_acquire(&self, order_id: &str) -> Result<FlightGuard<'_>, TransitionError> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(order_id.to_string()) {
            return Err(TransitionError::AlreadyInFlight {
                order_id: order_id.to_string(),
            });
        }
        Ok(FlightGuard {
            set: &self.in_flight,
            order_id: order_id.to_string(),
        })
    }

    /// Apply a status transition: optimistic local publish, external
    /// commit, reconcile or rollback.
    pub async fn apply_transition(
        &self,
        order: &FulfillmentOrder,
        target: OperationalStatus,
    ) -> Result<FulfillmentOrder, TransitionError> {
        let _guard = self.try_acquire(&order.id)?;

        status::validate(order, target)?;

        let external_id = order
            .external_id
            .clone()
            .ok_or_else(|| TransitionError::MissingExternalRef {
                order_id: order.id.clone(),
            })?;

        // Optimistic next state, published immediately.
        let mut next = order.clone();
        next.operational_status = target;
        if target == OperationalStatus::ReadyToShip {
            next.packed_at = Some(Utc::now());
            next.packed_by = Some(self.user.display_name());
        }
        {
            let mut overlay = self.overlay.lock().unwrap_or_else(|e| e.into_inner());
            overlay.insert(order.id.clone(), next.clone());
        }
        info!(
            order_id = %order.id,
            from = %order.operational_status,
            to = %target,
            "optimistic transition published"
        );

        let idempotency_key = format!("{}:{}", order.id, Uuid::new_v4());
        let mut result = self
            .external
            .push_status(&external_id, target, &idempotency_key)
            .await;
        if result.is_ok() && target == OperationalStatus::Shipped {
            result = self.external.create_fulfillment(&external_id).await;
        }

        match result {
            Ok(()) => {
                // Reconcile: the optimistic value becomes authoritative
                // (replace, don't merge).
                {
                    let mut overlay = self.overlay.lock().unwrap_or_else(|e| e.into_inner());
                    overlay.remove(&order.id);
                }
                self.cache.insert(next.clone());
                info!(order_id = %order.id, status = %target, "transition committed");
                Ok(next)
            }
            Err(e) => {
                // Discard the optimistic value; the local cache is not
                // trustworthy after a failed external write, so re-fetch
                // authoritative state. No automatic retry: the operator
                // re-attempts the user-facing action.
                {
                    let mut overlay = self.overlay.lock().unwrap_or_else(|e| e.into_inner());
                    overlay.remove(&order.id);
                }
                warn!(
                    order_id = %order.id,
                    to = %target,
                    error = %e,
                    "transition commit failed, rolling back"
                );
                match self.store.load_order(&order.id).await {
                    Ok(fresh) => self.cache.insert(fresh),
                    Err(fetch_err) => {
                        warn!(
                            order_id = %order.id,
                            error = %fetch_err,
                            "authoritative re-fetch failed, invalidating cache entry"
                        );
                        self.cache.invalidate(&order.id);
                    }
                }
                Err(TransitionError::Commit(e))
            }
        }
    }

    /// Operator action: a pickup order is packed and waiting at the counter.
    pub async fn mark_ready_for_pickup(
        &self,
        order: &FulfillmentOrder,
    ) -> Result<FulfillmentOrder, TransitionError> {
        self.apply_transition(order, OperationalStatus::AwaitingPickup)
            .await
    }

    /// Operator action: the customer collected a pickup order.
    pub async fn confirm_delivery(
        &self,
        order: &FulfillmentOrder,
    ) -> Result<FulfillmentOrder, TransitionError> {
        self.apply_transition(order, OperationalStatus::Shipped)
            .await
    }

    /// Operator action: create a shipping label for a standard order.
    /// Attaches label metadata without a state change.
    pub async fn create_shipping_label(
        &self,
        order: &FulfillmentOrder,
        defaults: &LabelDefaults,
    ) -> Result<FulfillmentOrder, TransitionError> {
        if order.cancelled {
            return Err(TransitionError::Cancelled {
                order_id: order.id.clone(),
            });
        }
        if order.shipping_method_class != crate::model::ShippingMethodClass::Standard {
            return Err(TransitionError::LabelUnsupported);
        }
        if order.operational_status != OperationalStatus::ReadyToShip {
            return Err(TransitionError::NotReadyToShip {
                order_id: order.id.clone(),
                status: order.operational_status,
            });
        }
        if order.has_active_label() {
            return Err(TransitionError::LabelExists {
                order_id: order.id.clone(),
            });
        }
        let external_id = order
            .external_id
            .clone()
            .ok_or_else(|| TransitionError::MissingExternalRef {
                order_id: order.id.clone(),
            })?;

        let _guard = self.try_acquire(&order.id)?;

        let label = self
            .external
            .create_shipping_label(&external_id, defaults)
            .await?;

        let mut updated = order.clone();
        updated.shipping_label = Some(label);
        self.cache.insert(updated.clone());
        info!(
            order_id = %order.id,
            tracking = %updated.shipping_label.as_ref().map(|l| l.tracking_number.as_str()).unwrap_or(""),
            "shipping label attached"
        );
        Ok(updated)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

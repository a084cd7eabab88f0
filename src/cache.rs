//! Navigation cache with neighbor prefetch.
//!
//! Keeps a working set of orders keyed by id so paging between orders does
//! not re-fetch data already held. Entries are replaced on refetch; the
//! working set is operator sized, so no eviction policy beyond that.
//! This is the only state shared across order contexts.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::api::OrderStore;
use crate::model::FulfillmentOrder;

struct CachedEntry {
    order: FulfillmentOrder,
    fetched_at: DateTime<Utc>,
}

/// Shared order cache. Cheap to clone the handle via `Arc`.
#[derive(Default)]
pub struct NavigationCache {
    entries: Mutex<HashMap<String, CachedEntry>>,
}

impl NavigationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hit returns immediately; a miss is the caller's fetch to make.
    pub fn get(&self, id: &str) -> Option<FulfillmentOrder> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|e| e.order.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(id)
    }

    /// Insert or replace the cached snapshot for an order.
    pub fn insert(&self, order: FulfillmentOrder) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            order.id.clone(),
            CachedEntry {
                order,
                fetched_at: Utc::now(),
            },
        );
    }

    pub fn invalidate(&self, id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(id);
    }

    pub fn fetched_at(&self, id: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|e| e.fetched_at)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Prefetch
// ---------------------------------------------------------------------------

/// Spawn a best-effort background load of one order into the cache.
/// Failures are logged and never surfaced.
pub fn spawn_prefetch(cache: Arc<NavigationCache>, store: Arc<dyn OrderStore>, id: String) {
    if cache.contains(&id) {
        return;
    }
    tokio::spawn(async move {
        match store.load_order(&id).await {
            Ok(order) => {
                debug!(order_id = %id, "prefetched order");
                cache.insert(order);
            }
            Err(e) => {
                debug!(order_id = %id, error = %e, "prefetch failed");
            }
        }
    });
}

/// Prefetch the working-list neighbors (N-1, N+1) of the current order
/// without blocking the caller.
pub fn prefetch_neighbors(
    cache: &Arc<NavigationCache>,
    store: &Arc<dyn OrderStore>,
    working_list: &[String],
    current: &str,
) {
    let Some(pos) = working_list.iter().position(|id| id == current) else {
        return;
    };
    if pos > 0 {
        spawn_prefetch(cache.clone(), store.clone(), working_list[pos - 1].clone());
    }
    if pos + 1 < working_list.len() {
        spawn_prefetch(cache.clone(), store.clone(), working_list[pos + 1].clone());
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::model::{OperationalStatus, ShippingMethodClass};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn sample(id: &str) -> FulfillmentOrder {
        FulfillmentOrder {
            id: id.to_string(),
            external_id: Some(format!("ext-{id}")),
            operational_status: OperationalStatus::Packing,
            cancelled: false,
            shipping_method_class: ShippingMethodClass::Standard,
            line_items: vec![],
            note: None,
            packed_at: None,
            packed_by: None,
            shipping_label: None,
        }
    }

    struct CountingStore {
        loads: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl OrderStore for CountingStore {
        async fn load_order(&self, id: &str) -> Result<FulfillmentOrder, ApiError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApiError::Connect {
                    url: "test".into(),
                });
            }
            Ok(sample(id))
        }

        async fn load_line_items(
            &self,
            _external_ref: &str,
        ) -> Result<Vec<crate::model::LineItem>, ApiError> {
            Ok(vec![])
        }
    }

    #[test]
    fn hit_miss_and_invalidate() {
        let cache = NavigationCache::new();
        assert!(cache.get("ord-1").is_none());

        cache.insert(sample("ord-1"));
        assert!(cache.get("ord-1").is_some());

        cache.invalidate("ord-1");
        assert!(cache.get("ord-1").is_none());
    }

    #[test]
    fn refetch_replaces_the_entry() {
        let cache = NavigationCache::new();
        cache.insert(sample("ord-1"));

        let mut updated = sample("ord-1");
        updated.operational_status = OperationalStatus::ReadyToShip;
        cache.insert(updated);

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get("ord-1").unwrap().operational_status,
            OperationalStatus::ReadyToShip
        );
    }

    #[tokio::test]
    async fn neighbors_are_prefetched_without_refetching_cached_entries() {
        let cache = Arc::new(NavigationCache::new());
        let store: Arc<dyn OrderStore> = Arc::new(CountingStore {
            loads: AtomicU64::new(0),
            fail: false,
        });
        let list: Vec<String> = ["ord-1", "ord-2", "ord-3"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        cache.insert(sample("ord-1"));
        prefetch_neighbors(&cache, &store, &list, "ord-2");

        // Let the spawned prefetch tasks run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(cache.contains("ord-3"));
        assert!(cache.contains("ord-1"));
    }

    #[tokio::test]
    async fn prefetch_failure_is_silent() {
        let cache = Arc::new(NavigationCache::new());
        let store: Arc<dyn OrderStore> = Arc::new(CountingStore {
            loads: AtomicU64::new(0),
            fail: true,
        });

        spawn_prefetch(cache.clone(), store, "ord-9".into());
        tokio::task::yield_now().await;

        assert!(!cache.contains("ord-9"));
    }
}

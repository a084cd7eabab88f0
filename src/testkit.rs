//! Shared test doubles: an in-memory commerce backend with controllable
//! failures/latency, plus order builders.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::{ApiError, CurrentUser, OrderStore, SystemOfRecord};
use crate::model::{
    FulfillmentOrder, LabelDefaults, LineItem, LineItemKind, OperationalStatus, ShippingLabel,
    ShippingMethodClass,
};

pub struct TestUser;

impl CurrentUser for TestUser {
    fn display_name(&self) -> String {
        "Packer One".to_string()
    }
}

pub fn line_item(sku: &str, required: u32) -> LineItem {
    LineItem {
        sku: sku.to_string(),
        required_quantity: required,
        approved_quantity: 0,
        kind: LineItemKind::Physical,
    }
}

pub fn sample_order(
    id: &str,
    shipping: ShippingMethodClass,
    line_items: Vec<LineItem>,
) -> FulfillmentOrder {
    FulfillmentOrder {
        id: id.to_string(),
        external_id: Some(format!("ext-{id}")),
        operational_status: OperationalStatus::Packing,
        cancelled: false,
        shipping_method_class: shipping,
        line_items,
        note: None,
        packed_at: None,
        packed_by: None,
        shipping_label: None,
    }
}

#[derive(Default)]
pub struct MockBackend {
    orders: Mutex<HashMap<String, FulfillmentOrder>>,
    line_items: Mutex<HashMap<String, Vec<LineItem>>>,
    remote_notes: Mutex<HashMap<String, String>>,
    fail_push_status: AtomicBool,
    fail_push_note: AtomicBool,
    fail_pull_note: AtomicBool,
    fail_line_items: AtomicBool,
    push_delay_ms: AtomicU64,
    pull_delay_ms: AtomicU64,
    pull_note_calls: AtomicU64,
    push_note_calls: AtomicU64,
    pushed_statuses: Mutex<Vec<OperationalStatus>>,
    pushed_notes: Mutex<Vec<String>>,
    fulfillments: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_order(&self, order: FulfillmentOrder) {
        let mut orders = self.orders.lock().unwrap();
        orders.insert(order.id.clone(), order);
    }

    pub fn remove_order(&self, id: &str) {
        let mut orders = self.orders.lock().unwrap();
        orders.remove(id);
    }

    pub fn put_line_items(&self, external_ref: &str, items: Vec<LineItem>) {
        let mut map = self.line_items.lock().unwrap();
        map.insert(external_ref.to_string(), items);
    }

    pub fn set_remote_note(&self, order_id: &str, note: &str) {
        let mut notes = self.remote_notes.lock().unwrap();
        notes.insert(format!("ext-{order_id}"), note.to_string());
    }

    pub fn fail_push_status(&self, fail: bool) {
        self.fail_push_status.store(fail, Ordering::SeqCst);
    }

    pub fn fail_push_note(&self, fail: bool) {
        self.fail_push_note.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pull_note(&self, fail: bool) {
        self.fail_pull_note.store(fail, Ordering::SeqCst);
    }

    pub fn fail_line_items(&self, fail: bool) {
        self.fail_line_items.store(fail, Ordering::SeqCst);
    }

    pub fn set_push_delay(&self, delay: Duration) {
        self.push_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        self.pull_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn pushed_statuses(&self) -> Vec<OperationalStatus> {
        self.pushed_statuses.lock().unwrap().clone()
    }

    /// Successfully accepted notes, in push order.
    pub fn pushed_notes(&self) -> Vec<String> {
        self.pushed_notes.lock().unwrap().clone()
    }

    /// Total push attempts, including rejected ones.
    pub fn push_note_attempts(&self) -> u64 {
        self.push_note_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> u64 {
        self.pull_note_calls.load(Ordering::SeqCst)
    }

    pub fn fulfillments(&self) -> Vec<String> {
        self.fulfillments.lock().unwrap().clone()
    }

    async fn delay(&self, ms: &AtomicU64) {
        let ms = ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn unreachable_error() -> ApiError {
        ApiError::Connect {
            url: "https://commerce.test".to_string(),
        }
    }
}

#[async_trait]
impl OrderStore for MockBackend {
    async fn load_order(&self, id: &str) -> Result<FulfillmentOrder, ApiError> {
        let order = {
            let orders = self.orders.lock().unwrap();
            orders.get(id).cloned()
        };
        order.ok_or_else(|| ApiError::OrderNotFound {
            order_id: id.to_string(),
        })
    }

    async fn load_line_items(&self, external_ref: &str) -> Result<Vec<LineItem>, ApiError> {
        if self.fail_line_items.load(Ordering::SeqCst) {
            return Err(ApiError::LineItemsUnavailable {
                external_ref: external_ref.to_string(),
                reason: "timed out".to_string(),
            });
        }
        let map = self.line_items.lock().unwrap();
        Ok(map.get(external_ref).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SystemOfRecord for MockBackend {
    async fn push_status(
        &self,
        _external_id: &str,
        status: OperationalStatus,
        _idempotency_key: &str,
    ) -> Result<(), ApiError> {
        self.delay(&self.push_delay_ms).await;
        if self.fail_push_status.load(Ordering::SeqCst) {
            return Err(Self::unreachable_error());
        }
        self.pushed_statuses.lock().unwrap().push(status);
        Ok(())
    }

    async fn pull_note(&self, external_id: &str) -> Result<String, ApiError> {
        self.pull_note_calls.fetch_add(1, Ordering::SeqCst);
        self.delay(&self.pull_delay_ms).await;
        if self.fail_pull_note.load(Ordering::SeqCst) {
            return Err(Self::unreachable_error());
        }
        let notes = self.remote_notes.lock().unwrap();
        notes
            .get(external_id)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn push_note(
        &self,
        external_id: &str,
        note: &str,
        _idempotency_key: &str,
    ) -> Result<(), ApiError> {
        self.push_note_calls.fetch_add(1, Ordering::SeqCst);
        self.delay(&self.push_delay_ms).await;
        if self.fail_push_note.load(Ordering::SeqCst) {
            return Err(Self::unreachable_error());
        }
        self.pushed_notes.lock().unwrap().push(note.to_string());
        let mut notes = self.remote_notes.lock().unwrap();
        notes.insert(external_id.to_string(), note.to_string());
        Ok(())
    }

    async fn create_fulfillment(&self, external_id: &str) -> Result<(), ApiError> {
        self.fulfillments
            .lock()
            .unwrap()
            .push(external_id.to_string());
        Ok(())
    }

    async fn create_shipping_label(
        &self,
        _external_id: &str,
        _defaults: &LabelDefaults,
    ) -> Result<ShippingLabel, ApiError> {
        Ok(ShippingLabel {
            tracking_number: "TRK-00042".to_string(),
            carrier: "dhl".to_string(),
            created_at: chrono::Utc::now(),
        })
    }
}

//! Domain types for fulfillment orders and line items.
//!
//! Wire payloads from the commerce platform use camelCase keys; serde
//! aliases keep snake_case producers working. Status strings are stored
//! snake_case both locally and remotely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Operational status
// ---------------------------------------------------------------------------

/// Operational status of a fulfillment order. `Shipped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalStatus {
    Pending,
    Picking,
    Packing,
    ReadyToShip,
    AwaitingPickup,
    Shipped,
}

impl OperationalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalStatus::Pending => "pending",
            OperationalStatus::Picking => "picking",
            OperationalStatus::Packing => "packing",
            OperationalStatus::ReadyToShip => "ready_to_ship",
            OperationalStatus::AwaitingPickup => "awaiting_pickup",
            OperationalStatus::Shipped => "shipped",
        }
    }

    /// Parse a stored/wire status string. Unknown values map to `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Some(OperationalStatus::Pending),
            "picking" => Some(OperationalStatus::Picking),
            "packing" => Some(OperationalStatus::Packing),
            "ready_to_ship" => Some(OperationalStatus::ReadyToShip),
            "awaiting_pickup" => Some(OperationalStatus::AwaitingPickup),
            "shipped" => Some(OperationalStatus::Shipped),
            _ => None,
        }
    }

    /// True while the order is still being picked or packed.
    pub fn is_pre_packed(&self) -> bool {
        matches!(
            self,
            OperationalStatus::Pending | OperationalStatus::Picking | OperationalStatus::Packing
        )
    }
}

impl std::fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Shipping method classification
// ---------------------------------------------------------------------------

/// Shipping classification derived from the raw carrier/method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingMethodClass {
    Standard,
    Express,
    Pickup,
}

impl ShippingMethodClass {
    /// Classify a raw shipping method name as reported by the platform
    /// (e.g. "DHL Express", "Abholung / Pickup", "Standardversand").
    pub fn classify(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower.contains("express") {
            ShippingMethodClass::Express
        } else if lower.contains("pickup") || lower.contains("abholung") {
            ShippingMethodClass::Pickup
        } else {
            ShippingMethodClass::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingMethodClass::Standard => "standard",
            ShippingMethodClass::Express => "express",
            ShippingMethodClass::Pickup => "pickup",
        }
    }
}

impl std::fmt::Display for ShippingMethodClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Line items
// ---------------------------------------------------------------------------

/// Physical goods are scan-verified; service lines (alteration fees,
/// rush surcharges) are excluded from verification and totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    #[default]
    Physical,
    Service,
}

/// One product/quantity entry on an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub sku: String,
    #[serde(alias = "required_quantity", alias = "quantity")]
    pub required_quantity: u32,
    /// Quantity already recorded as packed/approved on the order itself.
    /// Seeds the verification counter when the order is reopened.
    #[serde(default, alias = "approved_quantity")]
    pub approved_quantity: u32,
    #[serde(default, alias = "item_kind")]
    pub kind: LineItemKind,
}

impl LineItem {
    pub fn is_verifiable(&self) -> bool {
        self.kind == LineItemKind::Physical && self.required_quantity > 0
    }
}

// ---------------------------------------------------------------------------
// Shipping label
// ---------------------------------------------------------------------------

/// Shipping label metadata attached when an operator creates a label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingLabel {
    #[serde(alias = "tracking_number")]
    pub tracking_number: String,
    pub carrier: String,
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
}

/// Defaults handed to the platform when creating a shipping label
/// (package dimensions, weight, sender address profile).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabelDefaults {
    #[serde(default)]
    pub weight_grams: Option<u32>,
    #[serde(default)]
    pub package_profile: Option<String>,
}

// ---------------------------------------------------------------------------
// Fulfillment order
// ---------------------------------------------------------------------------

/// A production order as seen by the packing workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentOrder {
    pub id: String,
    /// Identifier in the commerce platform; required for any external sync.
    #[serde(default, alias = "external_id")]
    pub external_id: Option<String>,
    #[serde(alias = "operational_status")]
    pub operational_status: OperationalStatus,
    /// Set externally. Once true the status machine and note sync freeze.
    #[serde(default)]
    pub cancelled: bool,
    #[serde(alias = "shipping_method_class")]
    pub shipping_method_class: ShippingMethodClass,
    #[serde(default, alias = "line_items")]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default, alias = "packed_at")]
    pub packed_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "packed_by")]
    pub packed_by: Option<String>,
    #[serde(default, alias = "shipping_label")]
    pub shipping_label: Option<ShippingLabel>,
}

impl FulfillmentOrder {
    pub fn has_active_label(&self) -> bool {
        self.shipping_label.is_some()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

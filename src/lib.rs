//! Atelier Ops - fulfillment verification & state-sync engine.
//!
//! Library-level engine behind the order-packing workflow of a
//! garment-production operations console: scan-verifying physical items
//! against an order's line items, driving the operational-status state
//! machine (with completion auto-transitions and shipping-method
//! branching), and keeping the free-text order note consistent between a
//! local SQLite store and the commerce platform under unreliable
//! connectivity. Invoked by a presentation layer; owns no CLI or wire
//! protocol of its own.
//!
//! Entry point is [`engine::FulfillmentEngine`]; the commerce platform and
//! order store are consumed through the traits in [`api`], so hosts can
//! substitute their own transport.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod model;
pub mod notes;
pub mod status;
#[cfg(test)]
mod testkit;
pub mod transition;
pub mod verify;

pub use api::{ApiError, CommerceClient, ConnectivityResult, CurrentUser, OrderStore, SystemOfRecord};
pub use cache::NavigationCache;
pub use config::EngineConfig;
pub use engine::{EngineError, EngineStatus, FulfillmentEngine, OrderView, ScanResult};
pub use model::{
    FulfillmentOrder, LabelDefaults, LineItem, LineItemKind, OperationalStatus, ShippingLabel,
    ShippingMethodClass,
};
pub use notes::{NoteSyncSnapshot, SyncPhase};
pub use status::TransitionError;
pub use verify::{SkuProgress, VerificationOutcome};

/// Install the default tracing subscriber for hosts that don't bring
/// their own. `RUST_LOG` wins when set; JSON output via `ATELIER_LOG_JSON=1`.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,atelier_ops=debug"));

    let json = std::env::var("ATELIER_LOG_JSON").ok().as_deref() == Some("1");
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    // A host may have installed a subscriber already; that is fine.
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

//! Commerce platform API client and collaborator traits.
//!
//! The engine never talks HTTP directly; it consumes the `OrderStore` and
//! `SystemOfRecord` traits. `CommerceClient` is the production
//! implementation, providing authenticated access to the platform's ops
//! endpoints with friendly error mapping and bounded timeouts.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::model::{
    FulfillmentOrder, LabelDefaults, LineItem, OperationalStatus, ShippingLabel,
};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Source of order records and their line items. Line items may be sourced
/// independently of the order record; a failed line-item fetch surfaces as
/// the distinguishable [`ApiError::LineItemsUnavailable`] so callers can
/// offer a retry action.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load_order(&self, id: &str) -> Result<FulfillmentOrder, ApiError>;
    async fn load_line_items(&self, external_ref: &str) -> Result<Vec<LineItem>, ApiError>;
}

/// The authoritative commerce platform holding order/fulfillment truth
/// outside this engine.
#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    async fn push_status(
        &self,
        external_id: &str,
        status: OperationalStatus,
        idempotency_key: &str,
    ) -> Result<(), ApiError>;
    async fn pull_note(&self, external_id: &str) -> Result<String, ApiError>;
    async fn push_note(
        &self,
        external_id: &str,
        note: &str,
        idempotency_key: &str,
    ) -> Result<(), ApiError>;
    async fn create_fulfillment(&self, external_id: &str) -> Result<(), ApiError>;
    async fn create_shipping_label(
        &self,
        external_id: &str,
        defaults: &LabelDefaults,
    ) -> Result<ShippingLabel, ApiError>;
}

/// Identity of the operator at this station, stamped into `packed_by`.
pub trait CurrentUser: Send + Sync {
    fn display_name(&self) -> String;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Cannot reach commerce platform at {url}")]
    Connect { url: String },
    #[error("Connection to {url} timed out")]
    Timeout { url: String },
    #[error("Invalid commerce platform URL: {url}")]
    BadUrl { url: String },
    #[error("API key is invalid or expired")]
    Unauthorized,
    #[error("Workspace not authorized")]
    Forbidden,
    #[error("Commerce platform endpoint not found")]
    NotFound,
    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: String },
    #[error("Commerce platform server error (HTTP {status})")]
    Server { status: u16 },
    #[error("Unexpected response from commerce platform (HTTP {status})")]
    Unexpected { status: u16 },
    #[error("Invalid response payload: {0}")]
    Payload(String),
    #[error("Network error communicating with {url}: {message}")]
    Network { url: String, message: String },
    /// Line items could not be fetched for an otherwise loadable order.
    #[error("Line items unavailable for {external_ref}: {reason}")]
    LineItemsUnavailable { external_ref: String, reason: String },
}

/// Convert a `reqwest::Error` into a distinguishable error.
fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_connect() {
        return ApiError::Connect {
            url: url.to_string(),
        };
    }
    if err.is_timeout() {
        return ApiError::Timeout {
            url: url.to_string(),
        };
    }
    if err.is_builder() {
        return ApiError::BadUrl {
            url: url.to_string(),
        };
    }
    ApiError::Network {
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Convert an HTTP status code into a distinguishable error.
fn status_error(status: StatusCode) -> ApiError {
    match status.as_u16() {
        401 => ApiError::Unauthorized,
        403 => ApiError::Forbidden,
        404 => ApiError::NotFound,
        s if s >= 500 => ApiError::Server { status: s },
        s => ApiError::Unexpected { status: s },
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the platform base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Authenticated HTTP client for the commerce platform ops API.
pub struct CommerceClient {
    http: Client,
    /// Separate client with the shorter note-pull timeout.
    pull_http: Client,
    base_url: String,
    api_key: String,
    workspace_id: Option<String>,
    connectivity_timeout: Duration,
}

impl CommerceClient {
    pub fn new(config: &EngineConfig) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&config.base_url);
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| friendly_error(&base_url, &e))?;
        let pull_http = Client::builder()
            .timeout(config.note_pull_timeout())
            .build()
            .map_err(|e| friendly_error(&base_url, &e))?;

        Ok(Self {
            http,
            pull_http,
            base_url,
            api_key: config.api_key.clone(),
            workspace_id: config.workspace_id.clone(),
            connectivity_timeout: config.connectivity_timeout(),
        })
    }

    /// Perform an authenticated request against the ops API.
    ///
    /// `path` includes the leading slash, e.g. `/api/ops/orders/{id}/note`.
    async fn request(
        &self,
        client: &Client,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let full_url = format!("{}{}", self.base_url, path);

        let mut req = client
            .request(method, &full_url)
            .header("X-Ops-API-Key", &self.api_key);
        if let Some(workspace) = &self.workspace_id {
            req = req.header("x-workspace-id", workspace);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        resp.json::<Value>()
            .await
            .map_err(|e| ApiError::Payload(e.to_string()))
    }

    /// Lightweight health probe. Returns an online flag plus latency.
    pub async fn check_connectivity(&self) -> ConnectivityResult {
        let health_url = format!("{}/api/health", self.base_url);

        let client = match Client::builder().timeout(self.connectivity_timeout).build() {
            Ok(c) => c,
            Err(e) => {
                return ConnectivityResult {
                    online: false,
                    latency_ms: None,
                    error: Some(format!("Failed to create HTTP client: {e}")),
                };
            }
        };

        let start = Instant::now();
        match client
            .head(&health_url)
            .header("X-Ops-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => {
                let latency = start.elapsed().as_millis() as u64;
                if resp.status().is_success() {
                    info!(latency_ms = latency, "connectivity probe passed");
                    ConnectivityResult {
                        online: true,
                        latency_ms: Some(latency),
                        error: None,
                    }
                } else {
                    ConnectivityResult {
                        online: false,
                        latency_ms: Some(latency),
                        error: Some(status_error(resp.status()).to_string()),
                    }
                }
            }
            Err(e) => ConnectivityResult {
                online: false,
                latency_ms: None,
                error: Some(friendly_error(&self.base_url, &e).to_string()),
            },
        }
    }
}

/// Result of a connectivity probe.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    #[serde(flatten)]
    order: FulfillmentOrder,
    /// Raw carrier/method name; used when the payload does not carry an
    /// explicit classification.
    #[serde(default, alias = "shipping_method")]
    shipping_method: Option<String>,
}

#[derive(serde::Deserialize)]
struct NotePayload {
    #[serde(default)]
    note: Option<String>,
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl OrderStore for CommerceClient {
    async fn load_order(&self, id: &str) -> Result<FulfillmentOrder, ApiError> {
        let path = format!("/api/ops/orders/{id}");
        let value = match self.request(&self.http, Method::GET, &path, None).await {
            Err(ApiError::NotFound) => {
                return Err(ApiError::OrderNotFound {
                    order_id: id.to_string(),
                })
            }
            other => other?,
        };

        let payload: OrderPayload =
            serde_json::from_value(value).map_err(|e| ApiError::Payload(e.to_string()))?;

        let mut order = payload.order;
        if let Some(raw) = payload.shipping_method.as_deref() {
            order.shipping_method_class = crate::model::ShippingMethodClass::classify(raw);
        }
        debug!(order_id = %order.id, status = %order.operational_status, "order loaded");
        Ok(order)
    }

    async fn load_line_items(&self, external_ref: &str) -> Result<Vec<LineItem>, ApiError> {
        let path = format!("/api/ops/orders/{external_ref}/line-items");
        let value = self
            .request(&self.http, Method::GET, &path, None)
            .await
            .map_err(|e| ApiError::LineItemsUnavailable {
                external_ref: external_ref.to_string(),
                reason: e.to_string(),
            })?;

        let items = value
            .get("lineItems")
            .cloned()
            .unwrap_or(value);
        serde_json::from_value(items).map_err(|e| ApiError::LineItemsUnavailable {
            external_ref: external_ref.to_string(),
            reason: format!("invalid payload: {e}"),
        })
    }
}

#[async_trait]
impl SystemOfRecord for CommerceClient {
    async fn push_status(
        &self,
        external_id: &str,
        status: OperationalStatus,
        idempotency_key: &str,
    ) -> Result<(), ApiError> {
        let path = format!("/api/ops/orders/{external_id}/status");
        self.request(
            &self.http,
            Method::POST,
            &path,
            Some(serde_json::json!({
                "status": status.as_str(),
                "idempotencyKey": idempotency_key,
            })),
        )
        .await?;
        info!(external_id = %external_id, status = %status, "status committed");
        Ok(())
    }

    async fn pull_note(&self, external_id: &str) -> Result<String, ApiError> {
        let path = format!("/api/ops/orders/{external_id}/note");
        let value = self.request(&self.pull_http, Method::GET, &path, None).await?;
        let payload: NotePayload =
            serde_json::from_value(value).map_err(|e| ApiError::Payload(e.to_string()))?;
        Ok(payload.note.unwrap_or_default())
    }

    async fn push_note(
        &self,
        external_id: &str,
        note: &str,
        idempotency_key: &str,
    ) -> Result<(), ApiError> {
        let path = format!("/api/ops/orders/{external_id}/note");
        self.request(
            &self.http,
            Method::PUT,
            &path,
            Some(serde_json::json!({
                "note": note,
                "idempotencyKey": idempotency_key,
            })),
        )
        .await?;
        Ok(())
    }

    async fn create_fulfillment(&self, external_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/ops/orders/{external_id}/fulfillment");
        self.request(&self.http, Method::POST, &path, None).await?;
        info!(external_id = %external_id, "fulfillment created");
        Ok(())
    }

    async fn create_shipping_label(
        &self,
        external_id: &str,
        defaults: &LabelDefaults,
    ) -> Result<ShippingLabel, ApiError> {
        let path = format!("/api/ops/orders/{external_id}/shipping-label");
        let body = serde_json::to_value(defaults).map_err(|e| ApiError::Payload(e.to_string()))?;
        let value = self
            .request(&self.http, Method::POST, &path, Some(body))
            .await?;
        serde_json::from_value(value).map_err(|e| ApiError::Payload(e.to_string()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Engine configuration.
//!
//! The engine is a library; credential custody and persistence of this
//! config belong to the host application. All tuning knobs carry the
//! defaults the packing workflow was designed around.

use serde::Deserialize;
use std::time::Duration;

fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_note_pull_timeout_ms() -> u64 {
    10_000
}
fn default_connectivity_timeout_ms() -> u64 {
    5_000
}
fn default_note_debounce_ms() -> u64 {
    2_000
}
fn default_note_retry_delay_ms() -> u64 {
    5_000
}
fn default_note_max_retries() -> u32 {
    3
}
fn default_nav_debounce_ms() -> u64 {
    300
}
fn default_scan_clear_ms() -> u64 {
    1_500
}

/// Configuration for the fulfillment engine and its commerce client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Base URL of the commerce platform API.
    pub base_url: String,
    /// API key for the ops endpoints.
    pub api_key: String,
    /// Workspace/tenant identifier sent with every request.
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_note_pull_timeout_ms")]
    pub note_pull_timeout_ms: u64,
    #[serde(default = "default_connectivity_timeout_ms")]
    pub connectivity_timeout_ms: u64,
    #[serde(default = "default_note_debounce_ms")]
    pub note_debounce_ms: u64,
    #[serde(default = "default_note_retry_delay_ms")]
    pub note_retry_delay_ms: u64,
    #[serde(default = "default_note_max_retries")]
    pub note_max_retries: u32,
    #[serde(default = "default_nav_debounce_ms")]
    pub nav_debounce_ms: u64,
    /// Host-side hint: how long after a scan the input field should be
    /// cleared to support continuous scanning. Not engine state.
    #[serde(default = "default_scan_clear_ms")]
    pub scan_clear_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            workspace_id: None,
            request_timeout_ms: default_request_timeout_ms(),
            note_pull_timeout_ms: default_note_pull_timeout_ms(),
            connectivity_timeout_ms: default_connectivity_timeout_ms(),
            note_debounce_ms: default_note_debounce_ms(),
            note_retry_delay_ms: default_note_retry_delay_ms(),
            note_max_retries: default_note_max_retries(),
            nav_debounce_ms: default_nav_debounce_ms(),
            scan_clear_ms: default_scan_clear_ms(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn note_pull_timeout(&self) -> Duration {
        Duration::from_millis(self.note_pull_timeout_ms)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity_timeout_ms)
    }

    pub fn note_debounce(&self) -> Duration {
        Duration::from_millis(self.note_debounce_ms)
    }

    pub fn note_retry_delay(&self) -> Duration {
        Duration::from_millis(self.note_retry_delay_ms)
    }

    pub fn nav_debounce(&self) -> Duration {
        Duration::from_millis(self.nav_debounce_ms)
    }

    pub fn scan_clear(&self) -> Duration {
        Duration::from_millis(self.scan_clear_ms)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "baseUrl": "https://commerce.example.com",
            "apiKey": "ak_test"
        }))
        .expect("minimal config should parse");

        assert_eq!(config.note_debounce(), Duration::from_secs(2));
        assert_eq!(config.note_retry_delay(), Duration::from_secs(5));
        assert_eq!(config.note_max_retries, 3);
        assert_eq!(config.note_pull_timeout(), Duration::from_secs(10));
        assert_eq!(config.nav_debounce(), Duration::from_millis(300));
    }
}

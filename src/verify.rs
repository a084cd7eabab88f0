//! Scan verification counter for the packing workflow.
//!
//! Matches scanned identifiers against expected line items and tracks
//! per-item fulfilled quantity. Service lines are excluded from both
//! matching and totals. The session is ephemeral: it lives only while an
//! order is open for packing and is rebuilt from the order's recorded
//! approved quantities on reopen.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::model::LineItem;

/// Outcome of a single scan event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// Identifier does not correspond to any verifiable item on this order.
    NoMatch,
    /// Match found; count incremented.
    Counted {
        sku: String,
        new_count: u32,
        required: u32,
    },
    /// Match found but the item is already fully counted. Over-scanning is
    /// a no-op signaled distinctly from a fresh count.
    AlreadyComplete { sku: String },
}

/// Per-SKU verification progress, in line-item display order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkuProgress {
    pub sku: String,
    pub verified: u32,
    pub required: u32,
}

/// Ephemeral per-order verification state.
pub struct VerificationSession {
    items: Vec<SkuProgress>,
    /// normalized sku -> index into `items`
    index: HashMap<String, usize>,
    completion_signaled: bool,
}

fn normalize_sku(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl VerificationSession {
    /// Build a session from the order's line items, seeding counts from the
    /// recorded approved quantities. Duplicate SKU lines are merged.
    pub fn new(line_items: &[LineItem]) -> Self {
        let mut items: Vec<SkuProgress> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for item in line_items {
            if !item.is_verifiable() {
                if item.required_quantity == 0 {
                    warn!(sku = %item.sku, "line item with zero required quantity skipped");
                }
                continue;
            }

            let key = normalize_sku(&item.sku);
            let approved = item.approved_quantity.min(item.required_quantity);
            match index.get(&key) {
                Some(&i) => {
                    items[i].required += item.required_quantity;
                    items[i].verified += approved;
                }
                None => {
                    index.insert(key, items.len());
                    items.push(SkuProgress {
                        sku: item.sku.clone(),
                        verified: approved,
                        required: item.required_quantity,
                    });
                }
            }
        }

        Self {
            items,
            index,
            completion_signaled: false,
        }
    }

    /// Record one scan event. Case-insensitive exact SKU match.
    pub fn record_scan(&mut self, scanned: &str) -> VerificationOutcome {
        let key = normalize_sku(scanned);
        let Some(&i) = self.index.get(&key) else {
            debug!(scanned = %scanned, "scan matched no verifiable item");
            return VerificationOutcome::NoMatch;
        };

        let entry = &mut self.items[i];
        if entry.verified >= entry.required {
            return VerificationOutcome::AlreadyComplete {
                sku: entry.sku.clone(),
            };
        }

        entry.verified += 1;
        debug!(
            sku = %entry.sku,
            verified = entry.verified,
            required = entry.required,
            "item counted"
        );
        VerificationOutcome::Counted {
            sku: entry.sku.clone(),
            new_count: entry.verified,
            required: entry.required,
        }
    }

    pub fn total_verified(&self) -> u32 {
        self.items.iter().map(|i| i.verified).sum()
    }

    pub fn total_required(&self) -> u32 {
        self.items.iter().map(|i| i.required).sum()
    }

    /// Complete when every verifiable unit has been counted. An order with
    /// no verifiable items is never complete.
    pub fn is_complete(&self) -> bool {
        let required = self.total_required();
        required > 0 && self.total_verified() == required
    }

    /// Returns `true` exactly once after the session first becomes
    /// complete. Repeated checks after the boundary do not re-signal.
    pub fn take_completion_signal(&mut self) -> bool {
        if self.completion_signaled || !self.is_complete() {
            return false;
        }
        self.completion_signaled = true;
        true
    }

    pub fn progress(&self) -> Vec<SkuProgress> {
        self.items.clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LineItemKind;

    fn item(sku: &str, required: u32) -> LineItem {
        LineItem {
            sku: sku.to_string(),
            required_quantity: required,
            approved_quantity: 0,
            kind: LineItemKind::Physical,
        }
    }

    fn service(sku: &str) -> LineItem {
        LineItem {
            sku: sku.to_string(),
            required_quantity: 1,
            approved_quantity: 0,
            kind: LineItemKind::Service,
        }
    }

    #[test]
    fn scan_sequence_counts_up_then_signals_completion_once() {
        let mut session = VerificationSession::new(&[item("SKU-A", 2), item("SKU-B", 1)]);

        assert_eq!(
            session.record_scan("SKU-A"),
            VerificationOutcome::Counted {
                sku: "SKU-A".into(),
                new_count: 1,
                required: 2
            }
        );
        assert!(!session.is_complete());

        assert_eq!(
            session.record_scan("SKU-B"),
            VerificationOutcome::Counted {
                sku: "SKU-B".into(),
                new_count: 1,
                required: 1
            }
        );
        assert!(!session.is_complete(), "A is still incomplete");

        assert_eq!(
            session.record_scan("SKU-A"),
            VerificationOutcome::Counted {
                sku: "SKU-A".into(),
                new_count: 2,
                required: 2
            }
        );
        assert!(session.is_complete());
        assert!(session.take_completion_signal());
        assert!(!session.take_completion_signal(), "signal fires only once");
    }

    #[test]
    fn overscan_is_a_distinct_noop() {
        let mut session = VerificationSession::new(&[item("SKU-A", 1)]);
        session.record_scan("SKU-A");
        assert_eq!(
            session.record_scan("SKU-A"),
            VerificationOutcome::AlreadyComplete {
                sku: "SKU-A".into()
            }
        );
        assert_eq!(session.total_verified(), 1, "count never exceeds required");
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mut session = VerificationSession::new(&[item("TSH-Rot-M", 1)]);
        assert!(matches!(
            session.record_scan("  tsh-rot-m "),
            VerificationOutcome::Counted { .. }
        ));
    }

    #[test]
    fn service_lines_are_excluded() {
        let mut session = VerificationSession::new(&[item("SKU-A", 1), service("SRV-RUSH")]);
        assert_eq!(session.total_required(), 1);
        assert_eq!(session.record_scan("SRV-RUSH"), VerificationOutcome::NoMatch);

        session.record_scan("SKU-A");
        assert!(session.is_complete(), "service line does not block completion");
    }

    #[test]
    fn approved_quantities_seed_counts_on_reopen() {
        let mut reopened = LineItem {
            sku: "SKU-A".into(),
            required_quantity: 3,
            approved_quantity: 2,
            kind: LineItemKind::Physical,
        };
        let mut session = VerificationSession::new(std::slice::from_ref(&reopened));
        assert_eq!(session.total_verified(), 2);
        assert!(matches!(
            session.record_scan("SKU-A"),
            VerificationOutcome::Counted {
                new_count: 3,
                ..
            }
        ));
        assert!(session.is_complete());

        // Approved beyond required is clamped.
        reopened.approved_quantity = 9;
        let session = VerificationSession::new(&[reopened]);
        assert_eq!(session.total_verified(), 3);
    }

    #[test]
    fn order_with_no_verifiable_items_is_never_complete() {
        let mut session = VerificationSession::new(&[service("SRV-FIT")]);
        assert!(!session.is_complete());
        assert!(!session.take_completion_signal());
    }

    #[test]
    fn duplicate_sku_lines_are_merged() {
        let mut session = VerificationSession::new(&[item("SKU-A", 1), item("sku-a", 2)]);
        assert_eq!(session.total_required(), 3);
        session.record_scan("SKU-A");
        session.record_scan("SKU-A");
        session.record_scan("SKU-A");
        assert!(session.is_complete());
    }
}

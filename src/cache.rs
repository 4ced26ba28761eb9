//! View-model caches.
//!
//! [`SnapshotCache`] holds accounts and portfolios from the last full fetch
//! plus merged deltas. [`PositionsCache`] holds the position list of every
//! portfolio that has been expanded at least once. Both are plain owned
//! stores; the host injects them where needed and clears them explicitly.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::model::{AccountRecord, PortfolioRecord, PositionRecord, Record, RecordPatch};

#[derive(Debug, Default)]
pub struct SnapshotCache {
    accounts: Vec<AccountRecord>,
    portfolios: Vec<PortfolioRecord>,
    last_file_update: Option<String>,
}

/// Read-only copy of the cached state, for inspection and tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub accounts: Vec<AccountRecord>,
    pub portfolios: Vec<PortfolioRecord>,
    pub positions: HashMap<String, Vec<PositionRecord>>,
    pub last_file_update: Option<String>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_accounts(&mut self, accounts: Vec<AccountRecord>) {
        self.accounts = accounts;
    }

    pub fn accounts(&self) -> &[AccountRecord] {
        &self.accounts
    }

    pub fn account(&self, uuid: &str) -> Option<&AccountRecord> {
        self.accounts.iter().find(|a| a.uuid == uuid)
    }

    pub fn replace_portfolios(&mut self, portfolios: Vec<PortfolioRecord>) {
        self.portfolios = portfolios;
    }

    /// Upserts portfolio deltas and returns the merged records in input order.
    pub fn merge_portfolios(&mut self, patches: &[RecordPatch]) -> Vec<PortfolioRecord> {
        let mut merged = Vec::with_capacity(patches.len());
        for patch in patches {
            let Some(uuid) = patch.str_field("uuid") else {
                continue;
            };
            match self.portfolios.iter_mut().find(|p| p.uuid == uuid) {
                Some(existing) => match patch.apply_to(existing) {
                    Some(updated) => {
                        *existing = updated;
                        merged.push(existing.clone());
                    }
                    None => debug!(portfolio = uuid, "portfolio delta could not be merged"),
                },
                None => match patch.to_record::<PortfolioRecord>() {
                    Some(record) => {
                        self.portfolios.push(record.clone());
                        merged.push(record);
                    }
                    None => debug!(portfolio = uuid, "new portfolio delta is incomplete"),
                },
            }
        }
        merged
    }

    pub fn portfolios(&self) -> &[PortfolioRecord] {
        &self.portfolios
    }

    pub fn portfolio(&self, uuid: &str) -> Option<&PortfolioRecord> {
        self.portfolios.iter().find(|p| p.uuid == uuid)
    }

    pub fn set_last_file_update(&mut self, value: Option<String>) {
        self.last_file_update = value;
    }

    pub fn last_file_update(&self) -> Option<&str> {
        self.last_file_update.as_deref()
    }

    /// Sum of account EUR balances and portfolio values. Unknown values are
    /// skipped.
    pub fn total_wealth(&self) -> f64 {
        let accounts: f64 = self.accounts.iter().filter_map(|a| a.balance).sum();
        let portfolios: f64 = self.portfolios.iter().filter_map(|p| p.current_value).sum();
        accounts + portfolios
    }

    pub fn clear(&mut self) {
        self.accounts.clear();
        self.portfolios.clear();
        self.last_file_update = None;
    }
}

#[derive(Debug, Default)]
pub struct PositionsCache {
    by_portfolio: HashMap<String, Vec<PositionRecord>>,
}

impl PositionsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the membership of a portfolio's position list while keeping
    /// fields the new payload does not carry: incoming keys win, the previous
    /// record fills the gaps.
    pub fn set_portfolio_positions(
        &mut self,
        portfolio_uuid: &str,
        patches: &[RecordPatch],
    ) -> Vec<PositionRecord> {
        let previous = self.by_portfolio.remove(portfolio_uuid).unwrap_or_default();
        let positions = reconcile(&previous, patches, "security_uuid");
        self.by_portfolio
            .insert(portfolio_uuid.to_string(), positions.clone());
        positions
    }

    /// Owned copy; mutating it does not touch the cache.
    pub fn get_portfolio_positions(&self, portfolio_uuid: &str) -> Vec<PositionRecord> {
        self.by_portfolio
            .get(portfolio_uuid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_portfolio_positions(&self, portfolio_uuid: &str) -> bool {
        self.by_portfolio.contains_key(portfolio_uuid)
    }

    pub fn invalidate(&mut self, portfolio_uuid: &str) {
        self.by_portfolio.remove(portfolio_uuid);
    }

    pub fn clear(&mut self) {
        self.by_portfolio.clear();
    }

    fn snapshot(&self) -> HashMap<String, Vec<PositionRecord>> {
        self.by_portfolio.clone()
    }
}

fn reconcile<T: Record>(previous: &[T], patches: &[RecordPatch], key_field: &str) -> Vec<T> {
    patches
        .iter()
        .filter_map(|patch| {
            let key = patch.str_field(key_field)?;
            match previous.iter().find(|record| record.key() == key) {
                Some(existing) => patch.apply_to(existing),
                None => patch.to_record(),
            }
        })
        .collect()
}

/// Both view-model caches, cleared together.
#[derive(Debug, Default)]
pub struct ViewCaches {
    pub snapshot: SnapshotCache,
    pub positions: PositionsCache,
}

impl ViewCaches {
    pub fn clear_all(&mut self) {
        self.snapshot.clear();
        self.positions.clear();
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            accounts: self.snapshot.accounts.clone(),
            portfolios: self.snapshot.portfolios.clone(),
            positions: self.positions.snapshot(),
            last_file_update: self.snapshot.last_file_update.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize_portfolio, normalize_position_patches};
    use serde_json::json;

    fn patch(value: serde_json::Value) -> RecordPatch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_merge_preserves_untouched_fields() {
        let mut cache = SnapshotCache::new();
        cache.replace_portfolios(vec![normalize_portfolio(&json!({
            "uuid": "A", "name": "Depot", "current_value": 100,
            "performance": {"gain_abs": 5}
        }))
        .unwrap()]);

        let merged = cache.merge_portfolios(&[patch(json!({"uuid": "A", "performance": {"gain_pct": 2}}))]);
        assert_eq!(merged.len(), 1);

        let record = cache.portfolio("A").unwrap();
        assert_eq!(record.current_value, Some(100.0));
        let performance = record.performance.as_ref().unwrap();
        assert_eq!(performance.gain_abs, Some(5.0));
        assert_eq!(performance.gain_pct, Some(2.0));
    }

    #[test]
    fn test_merge_rederives_percentages_from_new_inputs() {
        let mut cache = SnapshotCache::new();
        cache.replace_portfolios(vec![normalize_portfolio(&json!({
            "uuid": "A", "name": "Depot", "current_value": 110, "purchase_sum": 100,
            "gain_abs": 10, "day_change_abs": 10
        }))
        .unwrap()]);
        let before = cache.portfolio("A").unwrap();
        assert_eq!(before.gain_pct, Some(10.0));
        assert_eq!(before.day_change_pct, Some(10.0));

        cache.merge_portfolios(&[patch(json!({
            "uuid": "A", "current_value": 150, "gain_abs": 50, "day_change_abs": 50
        }))]);
        let record = cache.portfolio("A").unwrap();
        assert_eq!(record.gain_abs, Some(50.0));
        assert_eq!(record.gain_pct, Some(50.0));
        assert_eq!(record.day_change_pct, Some(50.0));

        // a percentage sent with the delta wins over the derivation
        cache.merge_portfolios(&[patch(json!({"uuid": "A", "gain_abs": 60, "gain_pct": 7.5}))]);
        assert_eq!(cache.portfolio("A").unwrap().gain_pct, Some(7.5));

        // untouched inputs keep the stored percentage
        cache.merge_portfolios(&[patch(json!({"uuid": "A", "name": "Umbenannt"}))]);
        assert_eq!(cache.portfolio("A").unwrap().gain_pct, Some(7.5));
    }

    #[test]
    fn test_merge_adds_new_portfolios() {
        let mut cache = SnapshotCache::new();
        cache.merge_portfolios(&[
            patch(json!({"uuid": "B", "name": "Neu", "current_value": 10})),
            patch(json!({"name": "no uuid"})),
        ]);
        assert_eq!(cache.portfolios().len(), 1);
        assert_eq!(cache.portfolio("B").unwrap().name, "Neu");
    }

    #[test]
    fn test_set_positions_replaces_membership_and_fills_gaps() {
        let mut cache = PositionsCache::new();
        cache.set_portfolio_positions(
            "p",
            &normalize_position_patches(&json!([
                {"security_uuid": "s1", "name": "One", "current_holdings": 1, "purchase_value": 10,
                 "current_value": 12, "ticker_symbol": "ONE"},
                {"security_uuid": "s2", "name": "Two", "current_holdings": 1, "purchase_value": 10,
                 "current_value": 9}
            ])),
        );

        let updated = cache.set_portfolio_positions(
            "p",
            &normalize_position_patches(&json!([
                {"security_uuid": "s1", "name": "One", "current_holdings": 2, "purchase_value": 20,
                 "current_value": 30}
            ])),
        );
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].current_value, 30.0);
        assert_eq!(updated[0].ticker_symbol.as_deref(), Some("ONE"));
    }

    #[test]
    fn test_returned_positions_are_copies() {
        let mut cache = PositionsCache::new();
        cache.set_portfolio_positions(
            "p",
            &normalize_position_patches(&json!([
                {"security_uuid": "s1", "name": "One", "current_holdings": 1, "purchase_value": 10,
                 "current_value": 12}
            ])),
        );
        let mut copy = cache.get_portfolio_positions("p");
        copy[0].current_value = 0.0;
        copy.clear();
        assert_eq!(cache.get_portfolio_positions("p")[0].current_value, 12.0);
        assert!(cache.has_portfolio_positions("p"));
        cache.invalidate("p");
        assert!(!cache.has_portfolio_positions("p"));
    }

    #[test]
    fn test_clear_all_and_snapshot() {
        let mut caches = ViewCaches::default();
        caches.snapshot.set_last_file_update(Some("2024-01-01".into()));
        caches.positions.set_portfolio_positions("p", &[]);
        assert!(caches.snapshot().positions.contains_key("p"));
        caches.clear_all();
        assert_eq!(caches.snapshot(), CacheSnapshot::default());
    }
}

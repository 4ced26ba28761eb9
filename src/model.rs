//! Canonical view-model records.
//!
//! Records are produced by the normalizers and stored in the caches. Partial
//! updates travel as [`RecordPatch`]es so that "key absent" and "key set to
//! null" stay distinguishable until they are merged.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Nested blocks that merge one level deep instead of being replaced.
pub const NESTED_MERGE_KEYS: [&str; 4] = ["performance", "aggregation", "average_cost", "data_state"];

/// Anything the caches can key by identity.
pub trait Record: Serialize + DeserializeOwned + Clone {
    fn key(&self) -> &str;

    /// Recomputes derived fields after a merge.
    fn refresh_derived(&mut self) {}

    /// Derived fields and the inputs they are computed from. A merge that
    /// touches an input without carrying the derived field drops the stale
    /// value so `refresh_derived` computes it again.
    fn derived_inputs() -> &'static [(&'static str, &'static [&'static str])] {
        &[]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountRecord {
    pub uuid: String,
    pub name: String,
    pub currency_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orig_balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_rate_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_rate_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_run_uuid: Option<String>,
    pub fx_unavailable: bool,
}

impl AccountRecord {
    pub fn is_foreign_currency(&self) -> bool {
        !self.currency_code.is_empty() && self.currency_code != "EUR"
    }
}

impl Record for AccountRecord {
    fn key(&self) -> &str {
        &self.uuid
    }

    fn refresh_derived(&mut self) {
        if self.balance.is_none() && self.is_foreign_currency() {
            self.fx_unavailable = true;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DayChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_change_native: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_change_eur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_change_eur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain_abs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_change_eur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_change_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_change: Option<DayChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AverageCost {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aggregation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_holdings: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positive_holdings: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_value_eur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_total_security: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_total_account: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioRecord {
    pub uuid: String,
    pub name: String,
    pub position_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_change_abs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_change_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain_abs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain_pct: Option<f64>,
    pub has_value: bool,
    pub fx_unavailable: bool,
    pub missing_value_positions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_run_uuid: Option<String>,
}

impl Record for PortfolioRecord {
    fn key(&self) -> &str {
        &self.uuid
    }

    fn derived_inputs() -> &'static [(&'static str, &'static [&'static str])] {
        &[
            ("gain_pct", &["gain_abs", "purchase_sum", "current_value"]),
            ("day_change_pct", &["day_change_abs", "current_value"]),
        ]
    }

    fn refresh_derived(&mut self) {
        self.has_value = self.current_value.is_some();
        self.fx_unavailable = !self.has_value || self.missing_value_positions > 0;
        if self.gain_pct.is_none() {
            self.gain_pct = self
                .gain_abs
                .and_then(|gain| derive_gain_pct(gain, self.purchase_sum, self.current_value));
        }
        if self.day_change_pct.is_none() {
            self.day_change_pct = match (self.day_change_abs, self.current_value) {
                (Some(change), Some(current)) => derive_day_change_pct(change, current),
                _ => None,
            };
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionRecord {
    pub security_uuid: String,
    pub name: String,
    pub current_holdings: f64,
    pub purchase_value: f64,
    pub current_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_value_eur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_cost: Option<AverageCost>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price_native: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price_eur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_close_native: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_close_eur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_run_uuid: Option<String>,
}

impl PositionRecord {
    pub fn gain_abs(&self) -> Option<f64> {
        self.performance.as_ref().and_then(|p| p.gain_abs)
    }

    pub fn gain_pct(&self) -> Option<f64> {
        self.performance.as_ref().and_then(|p| p.gain_pct)
    }
}

impl Record for PositionRecord {
    fn key(&self) -> &str {
        &self.security_uuid
    }
}

/// A partial canonical record: only the keys present in the wire payload.
///
/// An explicit `null` is kept as [`Value::Null`] and overwrites on merge, an
/// absent key leaves the cached value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordPatch(Map<String, Value>);

impl RecordPatch {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_record<T: Serialize>(record: &T) -> Self {
        match serde_json::to_value(record) {
            Ok(Value::Object(map)) => Self(map),
            _ => Self::new(),
        }
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Builds a full record from this patch alone.
    pub fn to_record<T: Record>(&self) -> Option<T> {
        let mut record: T = serde_json::from_value(Value::Object(self.0.clone())).ok()?;
        record.refresh_derived();
        Some(record)
    }

    /// Overlays this patch on `base`. Incoming keys win, nested blocks merge
    /// one level deep.
    pub fn apply_to<T: Record>(&self, base: &T) -> Option<T> {
        let mut merged = match serde_json::to_value(base) {
            Ok(Value::Object(map)) => map,
            _ => return self.to_record(),
        };
        for (derived, inputs) in T::derived_inputs() {
            if !self.0.contains_key(*derived) && inputs.iter().any(|key| self.0.contains_key(*key)) {
                merged.remove(*derived);
            }
        }
        merge_fields(&mut merged, &self.0);
        let mut record: T = serde_json::from_value(Value::Object(merged)).ok()?;
        record.refresh_derived();
        Some(record)
    }
}

fn merge_fields(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        let nested = NESTED_MERGE_KEYS.contains(&key.as_str());
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(update)) if nested => {
                for (inner_key, inner_value) in update {
                    existing.insert(inner_key.clone(), inner_value.clone());
                }
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Gain in percent when the backend did not send one.
///
/// Uses the purchase value as base, or `current - gain` when there is no
/// positive purchase value.
pub fn derive_gain_pct(
    gain_abs: f64,
    purchase_value: Option<f64>,
    current_value: Option<f64>,
) -> Option<f64> {
    if let Some(purchase) = purchase_value.filter(|p| *p > 0.0) {
        return Some(gain_abs / purchase * 100.0);
    }
    let base = current_value? - gain_abs;
    (base != 0.0).then(|| gain_abs / base * 100.0)
}

pub fn derive_day_change_pct(day_change_abs: f64, current_value: f64) -> Option<f64> {
    let previous = current_value - day_change_abs;
    (previous != 0.0).then(|| day_change_abs / previous * 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeKind {
    PartialData,
    FxUnavailable,
    Provenance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Badge {
    pub kind: BadgeKind,
    pub label: String,
    pub tooltip: Option<String>,
}

impl Badge {
    pub fn css_class(&self) -> &'static str {
        match self.kind {
            BadgeKind::PartialData => "badge badge-warning",
            BadgeKind::FxUnavailable => "badge badge-danger",
            BadgeKind::Provenance => "badge badge-info",
        }
    }
}

/// Presentation badges derived from metric metadata. Never stored.
pub fn derive_badges(
    coverage_ratio: Option<f64>,
    provenance: Option<&str>,
    fx_unavailable: bool,
) -> Vec<Badge> {
    let mut badges = Vec::new();
    if fx_unavailable {
        badges.push(Badge {
            kind: BadgeKind::FxUnavailable,
            label: "FX fehlt".to_string(),
            tooltip: Some("Wechselkurs nicht verfügbar".to_string()),
        });
    }
    if let Some(ratio) = coverage_ratio {
        if ratio < 1.0 {
            badges.push(Badge {
                kind: BadgeKind::PartialData,
                label: format!("{:.0}% Abdeckung", (ratio * 100.0).clamp(0.0, 100.0)),
                tooltip: Some("Teilweise berechnete Kennzahlen".to_string()),
            });
        }
    }
    if let Some(label) = provenance.and_then(describe_provenance) {
        badges.push(Badge {
            kind: BadgeKind::Provenance,
            label,
            tooltip: provenance.map(str::to_string),
        });
    }
    badges
}

// Provenance is either a plain label or a JSON object naming the FX source.
fn describe_provenance(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => {
            let source = map
                .get("fx_source")
                .or_else(|| map.get("source"))
                .and_then(Value::as_str)?;
            Some(format!("FX: {source}"))
        }
        Ok(Value::String(s)) => Some(s),
        _ => Some(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(value: Value) -> RecordPatch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_patch_merges_nested_performance() {
        let base: PortfolioRecord = patch(json!({
            "uuid": "A", "name": "Depot", "current_value": 100.0,
            "performance": {"gain_abs": 5.0}
        }))
        .to_record()
        .unwrap();

        let merged = patch(json!({"uuid": "A", "performance": {"gain_pct": 2.0}}))
            .apply_to(&base)
            .unwrap();

        assert_eq!(merged.current_value, Some(100.0));
        let performance = merged.performance.unwrap();
        assert_eq!(performance.gain_abs, Some(5.0));
        assert_eq!(performance.gain_pct, Some(2.0));
    }

    #[test]
    fn test_explicit_null_overwrites() {
        let base: PortfolioRecord = patch(json!({"uuid": "A", "name": "Depot", "current_value": 100.0}))
            .to_record()
            .unwrap();
        assert!(base.has_value);
        assert!(!base.fx_unavailable);

        let merged = patch(json!({"uuid": "A", "current_value": null}))
            .apply_to(&base)
            .unwrap();
        assert_eq!(merged.current_value, None);
        assert!(!merged.has_value);
        assert!(merged.fx_unavailable);
    }

    #[test]
    fn test_missing_positions_force_fx_flag() {
        let record: PortfolioRecord = patch(json!({
            "uuid": "A", "name": "Depot", "current_value": 10.0, "missing_value_positions": 2
        }))
        .to_record()
        .unwrap();
        assert!(record.fx_unavailable);
    }

    #[test]
    fn test_badges() {
        let badges = derive_badges(Some(0.5), Some(r#"{"fx_source": "ECB"}"#), true);
        let kinds: Vec<BadgeKind> = badges.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BadgeKind::FxUnavailable, BadgeKind::PartialData, BadgeKind::Provenance]
        );
        assert_eq!(badges[1].label, "50% Abdeckung");
        assert_eq!(badges[2].label, "FX: ECB");
        assert!(derive_badges(Some(1.0), None, false).is_empty());
    }
}

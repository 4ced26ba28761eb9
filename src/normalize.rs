//! Payload normalizers.
//!
//! Every normalizer is total: malformed input yields `None` (or is dropped
//! from a list) instead of an error. Fields that the backend sends under more
//! than one name are resolved through ordered [`FieldPath`] lists; the first
//! path holding a usable value wins.
//!
//! The one exception is [`map_position_snapshot_to_record`], which reports a
//! missing required field as a [`MappingError`].

use serde_json::{json, Map, Value};

use crate::diagnostics::MetricMetadata;
use crate::error::MappingError;
use crate::format::parse_locale_number;
use crate::model::{
    derive_day_change_pct, derive_gain_pct, AccountRecord, PortfolioRecord, PositionRecord,
    RecordPatch,
};

/// A key path into a raw payload, outermost key first.
pub type FieldPath = &'static [&'static str];

const ACCOUNT_UUID: &[FieldPath] = &[&["uuid"], &["account_uuid"]];
const ACCOUNT_ORIG_BALANCE: &[FieldPath] = &[&["orig_balance"], &["balance_native"]];
const ACCOUNT_BALANCE: &[FieldPath] = &[&["balance"], &["balance_eur"]];

const PORTFOLIO_UUID: &[FieldPath] = &[&["uuid"], &["portfolio_uuid"]];
const PORTFOLIO_NAME: &[FieldPath] = &[&["name"], &["portfolio_name"]];
const POSITION_COUNT: &[FieldPath] = &[&["position_count"], &["count"]];
const CURRENT_VALUE: &[FieldPath] = &[&["current_value"], &["value"]];
/// EUR purchase sum of a portfolio.
const PURCHASE_SUM: &[FieldPath] = &[&["purchase_sum"], &["purchase_value_eur"], &["purchase_value"]];
const GAIN_ABS: &[FieldPath] = &[&["gain_abs"], &["performance", "gain_abs"]];
const GAIN_PCT: &[FieldPath] = &[&["gain_pct"], &["performance", "gain_pct"]];
const DAY_CHANGE_ABS: &[FieldPath] = &[
    &["day_change_abs"],
    &["performance", "day_change", "value_change_eur"],
];
const DAY_CHANGE_PCT: &[FieldPath] = &[
    &["day_change_pct"],
    &["performance", "day_change", "change_pct"],
];

/// EUR purchase value of a position: top level first, then the aggregation
/// block in account currency.
const POSITION_PURCHASE_VALUE_EUR: &[FieldPath] = &[
    &["purchase_value_eur"],
    &["aggregation", "purchase_value_eur"],
    &["aggregation", "purchase_total_account"],
];

const PERFORMANCE_NUMBERS: [&str; 5] = [
    "gain_abs",
    "gain_pct",
    "total_change_eur",
    "total_change_pct",
    "coverage_ratio",
];
const DAY_CHANGE_NUMBERS: [&str; 5] = [
    "price_change_native",
    "price_change_eur",
    "change_pct",
    "value_change_eur",
    "coverage_ratio",
];
const AVERAGE_COST_NUMBERS: [&str; 5] = ["native", "security", "account", "eur", "coverage_ratio"];
const AGGREGATION_NUMBERS: [&str; 5] = [
    "total_holdings",
    "positive_holdings",
    "purchase_value_eur",
    "purchase_total_security",
    "purchase_total_account",
];
const POSITION_OPTIONAL_NUMBERS: [&str; 4] = [
    "last_price_native",
    "last_price_eur",
    "last_close_native",
    "last_close_eur",
];

/// Result of resolving a field through its fallback list.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<T> {
    Value(T),
    /// Some source was present but explicitly null.
    Null,
    Absent,
}

impl<T> Resolved<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Resolved::Value(v) => Some(v),
            _ => None,
        }
    }
}

pub fn lookup<'a>(raw: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(raw, |node, key| node.get(key))
}

pub fn resolve_number(raw: &Value, sources: &[&[&str]]) -> Resolved<f64> {
    let mut saw_null = false;
    for path in sources {
        match lookup(raw, path) {
            Some(Value::Null) => saw_null = true,
            Some(value) => {
                if let Some(number) = parse_locale_number(value) {
                    return Resolved::Value(number);
                }
            }
            None => {}
        }
    }
    if saw_null {
        Resolved::Null
    } else {
        Resolved::Absent
    }
}

pub fn resolve_string(raw: &Value, sources: &[&[&str]]) -> Resolved<String> {
    let mut saw_null = false;
    for path in sources {
        match lookup(raw, path) {
            Some(Value::String(s)) if !s.trim().is_empty() => {
                return Resolved::Value(s.trim().to_string())
            }
            Some(Value::Null) => saw_null = true,
            _ => {}
        }
    }
    if saw_null {
        Resolved::Null
    } else {
        Resolved::Absent
    }
}

fn put_number(patch: &mut RecordPatch, key: &str, resolved: Resolved<f64>) {
    match resolved {
        Resolved::Value(v) => patch.insert(key, json!(v)),
        Resolved::Null => patch.insert(key, Value::Null),
        Resolved::Absent => {}
    }
}

fn put_count(patch: &mut RecordPatch, key: &str, resolved: Resolved<f64>) {
    match resolved {
        Resolved::Value(v) if v >= 0.0 => patch.insert(key, json!(v.round() as u64)),
        _ => {}
    }
}

fn put_string(patch: &mut RecordPatch, key: &str, resolved: Resolved<String>) {
    match resolved {
        Resolved::Value(v) => patch.insert(key, Value::String(v)),
        Resolved::Null => patch.insert(key, Value::Null),
        Resolved::Absent => {}
    }
}

fn put_coverage(patch: &mut RecordPatch, raw: &Value) {
    match resolve_number(raw, &[&["coverage_ratio"]]) {
        Resolved::Value(v) => patch.insert("coverage_ratio", json!(v.clamp(0.0, 1.0))),
        Resolved::Null => patch.insert("coverage_ratio", Value::Null),
        Resolved::Absent => {}
    }
}

// Provenance may arrive as a JSON object; it is kept as its string form.
fn put_provenance(patch: &mut RecordPatch, raw: &Value) {
    match raw.get("provenance") {
        Some(Value::String(s)) if !s.trim().is_empty() => {
            patch.insert("provenance", Value::String(s.trim().to_string()))
        }
        Some(value @ Value::Object(_)) => patch.insert("provenance", Value::String(value.to_string())),
        Some(Value::Null) => patch.insert("provenance", Value::Null),
        _ => {}
    }
}

fn put_metric_run(patch: &mut RecordPatch, raw: &Value) {
    match raw.get("metric_run_uuid") {
        Some(Value::String(s)) if !s.is_empty() => {
            patch.insert("metric_run_uuid", Value::String(s.clone()))
        }
        Some(Value::Null) => patch.insert("metric_run_uuid", Value::Null),
        _ => {}
    }
}

fn numeric_block(raw: &Value, keys: &[&str]) -> Map<String, Value> {
    let mut block = Map::new();
    for key in keys {
        match raw.get(*key) {
            Some(Value::Null) => {
                block.insert(key.to_string(), Value::Null);
            }
            Some(value) => {
                if let Some(number) = parse_locale_number(value) {
                    block.insert(key.to_string(), json!(number));
                }
            }
            None => {}
        }
    }
    block
}

fn put_source(block: &mut Map<String, Value>, raw: &Value) {
    if let Some(Value::String(source)) = raw.get("source") {
        block.insert("source".to_string(), Value::String(source.clone()));
    }
}

/// Normalizes a `performance` block. Only keys present in the payload are
/// kept so partial blocks can be merged.
pub fn normalize_performance(raw: &Value) -> Option<Map<String, Value>> {
    if !raw.is_object() {
        return None;
    }
    let mut block = numeric_block(raw, &PERFORMANCE_NUMBERS);
    put_source(&mut block, raw);
    if let Some(day_change) = raw.get("day_change").filter(|v| v.is_object()) {
        let mut day = numeric_block(day_change, &DAY_CHANGE_NUMBERS);
        put_source(&mut day, day_change);
        block.insert("day_change".to_string(), Value::Object(day));
    }
    Some(block)
}

pub fn normalize_average_cost(raw: &Value) -> Option<Map<String, Value>> {
    if !raw.is_object() {
        return None;
    }
    let mut block = numeric_block(raw, &AVERAGE_COST_NUMBERS);
    put_source(&mut block, raw);
    Some(block)
}

pub fn normalize_aggregation(raw: &Value) -> Option<Map<String, Value>> {
    raw.is_object().then(|| numeric_block(raw, &AGGREGATION_NUMBERS))
}

/// Items of a list payload: a bare array or an object holding the array
/// under `key`.
pub fn list_items<'a>(raw: &'a Value, key: &str) -> &'a [Value] {
    match raw {
        Value::Array(items) => items,
        Value::Object(map) => match map.get(key) {
            Some(Value::Array(items)) => items,
            _ => &[],
        },
        _ => &[],
    }
}

pub fn normalize_account(raw: &Value) -> Option<AccountRecord> {
    let uuid = resolve_string(raw, ACCOUNT_UUID).value()?;
    let name = resolve_string(raw, &[&["name"]]).value()?;

    let mut patch = RecordPatch::new();
    patch.insert("uuid", Value::String(uuid));
    patch.insert("name", Value::String(name));
    let currency = resolve_string(raw, &[&["currency_code"]])
        .value()
        .unwrap_or_else(|| "EUR".to_string());
    patch.insert("currency_code", Value::String(currency));
    put_number(&mut patch, "orig_balance", resolve_number(raw, ACCOUNT_ORIG_BALANCE));
    put_number(&mut patch, "balance", resolve_number(raw, ACCOUNT_BALANCE));
    put_number(&mut patch, "fx_rate", resolve_number(raw, &[&["fx_rate"]]));
    put_string(&mut patch, "fx_rate_source", resolve_string(raw, &[&["fx_rate_source"]]));
    put_string(&mut patch, "fx_rate_timestamp", resolve_string(raw, &[&["fx_rate_timestamp"]]));
    put_coverage(&mut patch, raw);
    put_provenance(&mut patch, raw);
    put_metric_run(&mut patch, raw);
    let flagged = raw
        .get("fx_unavailable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    patch.insert("fx_unavailable", Value::Bool(flagged));

    patch.to_record()
}

pub fn normalize_accounts(raw: &Value) -> Vec<AccountRecord> {
    list_items(raw, "accounts")
        .iter()
        .filter_map(normalize_account)
        .collect()
}

/// Canonical portfolio fields present in `raw`, for merging into the cache.
pub fn normalize_portfolio_patch(raw: &Value) -> Option<RecordPatch> {
    let uuid = resolve_string(raw, PORTFOLIO_UUID).value()?;

    let mut patch = RecordPatch::new();
    patch.insert("uuid", Value::String(uuid));
    if let Resolved::Value(name) = resolve_string(raw, PORTFOLIO_NAME) {
        patch.insert("name", Value::String(name));
    }
    put_count(&mut patch, "position_count", resolve_number(raw, POSITION_COUNT));
    put_number(&mut patch, "current_value", resolve_number(raw, CURRENT_VALUE));
    put_number(&mut patch, "purchase_sum", resolve_number(raw, PURCHASE_SUM));
    put_number(&mut patch, "gain_abs", resolve_number(raw, GAIN_ABS));
    put_number(&mut patch, "gain_pct", resolve_number(raw, GAIN_PCT));
    put_number(&mut patch, "day_change_abs", resolve_number(raw, DAY_CHANGE_ABS));
    put_number(&mut patch, "day_change_pct", resolve_number(raw, DAY_CHANGE_PCT));
    put_count(
        &mut patch,
        "missing_value_positions",
        resolve_number(raw, &[&["missing_value_positions"]]),
    );
    if let Some(block) = raw.get("performance").and_then(normalize_performance) {
        patch.insert("performance", Value::Object(block));
    }
    put_coverage(&mut patch, raw);
    put_provenance(&mut patch, raw);
    put_metric_run(&mut patch, raw);

    Some(patch)
}

/// A full portfolio record. Requires a name in addition to the uuid.
pub fn normalize_portfolio(raw: &Value) -> Option<PortfolioRecord> {
    let patch = normalize_portfolio_patch(raw)?;
    patch.str_field("name")?;
    patch.to_record()
}

pub fn normalize_portfolios(raw: &Value) -> Vec<PortfolioRecord> {
    list_items(raw, "portfolios")
        .iter()
        .filter_map(normalize_portfolio)
        .collect()
}

pub fn normalize_portfolio_patches(raw: &Value) -> Vec<RecordPatch> {
    list_items(raw, "portfolios")
        .iter()
        .filter_map(normalize_portfolio_patch)
        .collect()
}

struct RequiredPositionFields {
    security_uuid: String,
    name: String,
    current_holdings: f64,
    purchase_value: f64,
    current_value: f64,
}

fn required_position_fields(raw: &Value) -> Result<RequiredPositionFields, MappingError> {
    if !raw.is_object() {
        return Err(MappingError::NotAnObject);
    }
    let text = |key: &'static str| match raw.get(key) {
        None | Some(Value::Null) => Err(MappingError::MissingField(key)),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(_) => Err(MappingError::InvalidField(key)),
    };
    let number = |key: &'static str| match raw.get(key) {
        None | Some(Value::Null) => Err(MappingError::MissingField(key)),
        Some(value) => parse_locale_number(value).ok_or(MappingError::InvalidField(key)),
    };
    Ok(RequiredPositionFields {
        security_uuid: text("security_uuid")?,
        name: text("name")?,
        current_holdings: number("current_holdings")?,
        purchase_value: number("purchase_value")?,
        current_value: number("current_value")?,
    })
}

fn position_patch_from(raw: &Value, required: RequiredPositionFields) -> RecordPatch {
    let mut patch = RecordPatch::new();
    patch.insert("security_uuid", Value::String(required.security_uuid));
    patch.insert("name", Value::String(required.name));
    patch.insert("current_holdings", json!(required.current_holdings));
    patch.insert("purchase_value", json!(required.purchase_value));
    patch.insert("current_value", json!(required.current_value));

    put_number(
        &mut patch,
        "purchase_value_eur",
        resolve_number(raw, POSITION_PURCHASE_VALUE_EUR),
    );
    put_string(&mut patch, "currency_code", resolve_string(raw, &[&["currency_code"]]));
    put_string(&mut patch, "ticker_symbol", resolve_string(raw, &[&["ticker_symbol"]]));
    for key in POSITION_OPTIONAL_NUMBERS {
        put_number(&mut patch, key, resolve_number(raw, &[&[key]]));
    }

    if let Some(block) = raw.get("average_cost").and_then(normalize_average_cost) {
        patch.insert("average_cost", Value::Object(block));
    }
    if let Some(block) = raw.get("aggregation").and_then(normalize_aggregation) {
        patch.insert("aggregation", Value::Object(block));
    }
    if let Some(state) = raw.get("data_state").filter(|v| v.is_object()) {
        patch.insert("data_state", state.clone());
    }

    let mut performance = raw
        .get("performance")
        .and_then(normalize_performance)
        .unwrap_or_default();
    for key in ["gain_abs", "gain_pct"] {
        if !performance.contains_key(key) {
            if let Resolved::Value(v) = resolve_number(raw, &[&[key]]) {
                performance.insert(key.to_string(), json!(v));
            }
        }
    }
    complete_position_performance(
        &mut performance,
        required.purchase_value,
        required.current_value,
    );
    if !performance.is_empty() {
        patch.insert("performance", Value::Object(performance));
    }

    put_coverage(&mut patch, raw);
    put_provenance(&mut patch, raw);
    put_metric_run(&mut patch, raw);
    patch
}

// Fills gain_pct and day_change.change_pct from their absolute counterparts.
fn complete_position_performance(
    performance: &mut Map<String, Value>,
    purchase_value: f64,
    current_value: f64,
) {
    let has = |block: &Map<String, Value>, key: &str| block.get(key).is_some_and(|v| v.is_number());
    if !has(&*performance, "gain_pct") {
        let derived = performance
            .get("gain_abs")
            .and_then(Value::as_f64)
            .and_then(|gain| derive_gain_pct(gain, Some(purchase_value), Some(current_value)));
        if let Some(pct) = derived {
            performance.insert("gain_pct".to_string(), json!(pct));
        }
    }
    if let Some(Value::Object(day)) = performance.get_mut("day_change") {
        if !has(&*day, "change_pct") {
            let derived = day
                .get("value_change_eur")
                .and_then(Value::as_f64)
                .and_then(|change| derive_day_change_pct(change, current_value));
            if let Some(pct) = derived {
                day.insert("change_pct".to_string(), json!(pct));
            }
        }
    }
}

/// Lenient position normalizer: records missing a required field are
/// dropped.
pub fn normalize_position_patch(raw: &Value) -> Option<RecordPatch> {
    let required = required_position_fields(raw).ok()?;
    Some(position_patch_from(raw, required))
}

pub fn normalize_position(raw: &Value) -> Option<PositionRecord> {
    normalize_position_patch(raw)?.to_record()
}

pub fn normalize_position_patches(raw: &Value) -> Vec<RecordPatch> {
    list_items(raw, "positions")
        .iter()
        .filter_map(normalize_position_patch)
        .collect()
}

pub fn normalize_positions(raw: &Value) -> Vec<PositionRecord> {
    list_items(raw, "positions")
        .iter()
        .filter_map(normalize_position)
        .collect()
}

/// Strict variant for the security snapshot path: a missing required field is
/// an error, not a dropped record.
pub fn map_position_snapshot_to_record(raw: &Value) -> Result<PositionRecord, MappingError> {
    let required = required_position_fields(raw)?;
    position_patch_from(raw, required)
        .to_record()
        .ok_or(MappingError::NotAnObject)
}

/// Extracts per-entity metric metadata, or `None` when the payload carries
/// none of the tracked fields.
pub fn extract_metric_metadata(raw: &Value) -> Option<MetricMetadata> {
    let source = match raw.get("metric_metadata") {
        Some(nested @ Value::Object(_)) => nested,
        _ => raw,
    };
    let field = |key: &str| source.get(key).cloned();
    let metadata = MetricMetadata {
        coverage_ratio: field("coverage_ratio"),
        provenance: field("provenance"),
        metric_run_uuid: field("metric_run_uuid"),
        generated_at: field("generated_at"),
    };
    (!metadata.is_empty()).then_some(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_json(uuid: &str) -> Value {
        json!({
            "security_uuid": uuid,
            "name": format!("Security {uuid}"),
            "current_holdings": 10,
            "purchase_value": "1.000,00",
            "current_value": 1100.0,
            "performance": {"gain_abs": 100.0, "day_change": {"value_change_eur": 10.0}},
            "aggregation": {"purchase_total_account": 990.0},
            "data_state": {"status": "ok"},
        })
    }

    #[test]
    fn test_position_requires_fields() {
        let mut missing = position_json("s2");
        missing.as_object_mut().unwrap().remove("current_value");
        let mut null_value = position_json("s3");
        null_value["current_holdings"] = Value::Null;

        let raw = json!([position_json("s1"), missing, null_value, "garbage", position_json("s4")]);
        let positions = normalize_positions(&raw);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].security_uuid, "s1");
        assert_eq!(positions[1].security_uuid, "s4");
    }

    #[test]
    fn test_position_fallbacks_and_derivations() {
        let position = normalize_position(&position_json("s1")).unwrap();
        assert_eq!(position.purchase_value, 1000.0);
        assert_eq!(position.purchase_value_eur, Some(990.0));
        assert_eq!(position.gain_pct(), Some(10.0));
        let day = position.performance.unwrap().day_change.unwrap();
        assert_eq!(day.change_pct, Some(10.0 / 1090.0 * 100.0));
        assert_eq!(position.data_state, Some(json!({"status": "ok"})));
    }

    #[test]
    fn test_resolve_with_runtime_key() {
        let raw = json!({"last_price_eur": "12,5", "gain_pct": null});
        for key in ["last_price_eur".to_string(), "gain_pct".to_string(), "missing".to_string()] {
            let expected = match key.as_str() {
                "last_price_eur" => Resolved::Value(12.5),
                "gain_pct" => Resolved::Null,
                _ => Resolved::Absent,
            };
            assert_eq!(resolve_number(&raw, &[&[key.as_str()]]), expected);
        }

        let mut position = position_json("s1");
        position["last_price_eur"] = json!(101.5);
        position["performance"] = json!({});
        position["gain_abs"] = json!(90.0);
        let record = normalize_position(&position).unwrap();
        assert_eq!(record.last_price_eur, Some(101.5));
        assert_eq!(record.performance.unwrap().gain_abs, Some(90.0));
    }

    #[test]
    fn test_purchase_value_eur_priority() {
        let mut raw = position_json("s1");
        raw["aggregation"]["purchase_value_eur"] = json!(995.0);
        assert_eq!(normalize_position(&raw).unwrap().purchase_value_eur, Some(995.0));
        raw["purchase_value_eur"] = json!(999.0);
        assert_eq!(normalize_position(&raw).unwrap().purchase_value_eur, Some(999.0));
    }

    #[test]
    fn test_normalizers_are_idempotent() {
        let position = normalize_position(&position_json("s1")).unwrap();
        let again = normalize_position(&serde_json::to_value(&position).unwrap()).unwrap();
        assert_eq!(position, again);

        let portfolio = normalize_portfolio(&json!({
            "uuid": "p1", "name": "Depot", "position_count": 3,
            "current_value": "2.500,50", "purchase_value": 2000,
            "performance": {"gain_abs": 500.5, "day_change": {"value_change_eur": -20.0}},
            "missing_value_positions": 0, "coverage_ratio": 0.8,
            "provenance": {"fx_source": "ECB"}, "metric_run_uuid": "run-1"
        }))
        .unwrap();
        let again = normalize_portfolio(&serde_json::to_value(&portfolio).unwrap()).unwrap();
        assert_eq!(portfolio, again);

        let account = normalize_account(&json!({
            "uuid": "a1", "name": "Cash", "currency_code": "USD",
            "orig_balance": 100, "balance": null, "fx_unavailable": true
        }))
        .unwrap();
        let again = normalize_account(&serde_json::to_value(&account).unwrap()).unwrap();
        assert_eq!(account, again);
    }

    #[test]
    fn test_portfolio_fallback_chains() {
        let portfolio = normalize_portfolio(&json!({
            "uuid": "p1", "name": "Depot", "count": 2, "value": 150.0,
            "purchase_value_eur": 100.0,
            "performance": {"gain_abs": 50.0, "day_change": {"value_change_eur": 15.0, "change_pct": 11.1}}
        }))
        .unwrap();
        assert_eq!(portfolio.position_count, 2);
        assert_eq!(portfolio.current_value, Some(150.0));
        assert_eq!(portfolio.purchase_sum, Some(100.0));
        assert_eq!(portfolio.gain_abs, Some(50.0));
        assert_eq!(portfolio.gain_pct, Some(50.0));
        assert_eq!(portfolio.day_change_abs, Some(15.0));
        assert_eq!(portfolio.day_change_pct, Some(11.1));
        assert!(portfolio.has_value);
        assert!(!portfolio.fx_unavailable);
    }

    #[test]
    fn test_portfolio_without_value() {
        let portfolio =
            normalize_portfolio(&json!({"uuid": "p1", "name": "Depot", "current_value": null}))
                .unwrap();
        assert!(!portfolio.has_value);
        assert!(portfolio.fx_unavailable);
        assert!(normalize_portfolio(&json!({"uuid": "p1"})).is_none());
        assert!(normalize_portfolio_patch(&json!({"uuid": "p1"})).is_some());
    }

    #[test]
    fn test_patch_keeps_explicit_null() {
        let patch = normalize_portfolio_patch(&json!({"uuid": "p1", "current_value": null})).unwrap();
        assert_eq!(patch.get("current_value"), Some(&Value::Null));
        assert!(!patch.contains("purchase_sum"));
    }

    #[test]
    fn test_strict_mapper_reports_missing_field() {
        let mut raw = position_json("s1");
        raw.as_object_mut().unwrap().remove("purchase_value");
        assert_eq!(
            map_position_snapshot_to_record(&raw),
            Err(MappingError::MissingField("purchase_value"))
        );
        raw["purchase_value"] = json!("n/a");
        assert_eq!(
            map_position_snapshot_to_record(&raw),
            Err(MappingError::InvalidField("purchase_value"))
        );
        assert!(map_position_snapshot_to_record(&position_json("s1")).is_ok());
    }

    #[test]
    fn test_account_list_drops_invalid() {
        let accounts = normalize_accounts(&json!({"accounts": [
            {"uuid": "a1", "name": "Giro", "balance": "1.000,00"},
            {"name": "no uuid"},
            {"uuid": "a3", "name": "USD", "currency_code": "USD", "orig_balance": 10, "balance": null}
        ]}));
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].currency_code, "EUR");
        assert_eq!(accounts[0].balance, Some(1000.0));
        assert!(accounts[1].fx_unavailable);
    }

    #[test]
    fn test_metadata_extraction() {
        assert!(extract_metric_metadata(&json!({"uuid": "x"})).is_none());
        let metadata = extract_metric_metadata(&json!({"metric_run_uuid": null})).unwrap();
        assert_eq!(metadata.metric_run_uuid, Some(Value::Null));
        assert_eq!(metadata.coverage_ratio, None);
    }
}

//! Security detail pages.
//!
//! Each detail page shows a snapshot of the security and its price history
//! for a selectable range. History and transaction markers are cached per
//! security and range until a positions update touches the security.

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{Months, NaiveDate};
use serde_json::Value;
use tracing::debug;

use crate::error::MappingError;
use crate::events::DashboardEvent;
use crate::format::{
    escape_html, format_currency, format_holdings, format_value_markup, parse_locale_number,
    ValueKind,
};
use crate::model::PositionRecord;
use crate::normalize::map_position_snapshot_to_record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HistoryRange {
    OneMonth,
    SixMonths,
    #[default]
    OneYear,
    FiveYears,
    All,
}

impl HistoryRange {
    pub const ALL_RANGES: [HistoryRange; 5] = [
        HistoryRange::OneMonth,
        HistoryRange::SixMonths,
        HistoryRange::OneYear,
        HistoryRange::FiveYears,
        HistoryRange::All,
    ];

    pub fn label(self) -> &'static str {
        match self {
            HistoryRange::OneMonth => "1M",
            HistoryRange::SixMonths => "6M",
            HistoryRange::OneYear => "1Y",
            HistoryRange::FiveYears => "5Y",
            HistoryRange::All => "ALL",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL_RANGES
            .into_iter()
            .find(|range| range.label().eq_ignore_ascii_case(label))
    }

    /// First day of the range, `None` for the full history.
    pub fn start_date(self, today: NaiveDate) -> Option<NaiveDate> {
        let months = match self {
            HistoryRange::OneMonth => 1,
            HistoryRange::SixMonths => 6,
            HistoryRange::OneYear => 12,
            HistoryRange::FiveYears => 60,
            HistoryRange::All => return None,
        };
        today.checked_sub_months(Months::new(months))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMarker {
    pub date: NaiveDate,
    pub kind: String,
    pub shares: Option<f64>,
    pub price: Option<f64>,
}

/// Accepts `YYYY-MM-DD` (optionally with a time part) or `YYYYMMDD` integers.
pub fn parse_history_date(raw: &Value) -> Option<NaiveDate> {
    match raw {
        Value::String(s) => {
            let day = s.get(..10).unwrap_or(s);
            NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
        }
        Value::Number(n) => {
            let packed = n.as_u64()?;
            NaiveDate::from_ymd_opt(
                (packed / 10_000) as i32,
                ((packed / 100) % 100) as u32,
                (packed % 100) as u32,
            )
        }
        _ => None,
    }
}

/// Price points sorted by date; malformed entries are dropped.
pub fn normalize_history(raw: &Value) -> Vec<HistoryPoint> {
    let items = raw
        .get("prices")
        .or_else(|| raw.get("history"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut points: Vec<HistoryPoint> = items
        .iter()
        .filter_map(|item| {
            Some(HistoryPoint {
                date: parse_history_date(item.get("date")?)?,
                close: parse_locale_number(item.get("close")?)?,
            })
        })
        .collect();
    points.sort_by_key(|p| p.date);
    points
}

pub fn normalize_transactions(raw: &Value) -> Vec<TransactionMarker> {
    let items = raw
        .get("transactions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    items
        .iter()
        .filter_map(|item| {
            Some(TransactionMarker {
                date: parse_history_date(item.get("date")?)?,
                kind: item
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("transaction")
                    .to_string(),
                shares: item.get("shares").and_then(parse_locale_number),
                price: item.get("price").and_then(parse_locale_number),
            })
        })
        .collect()
}

/// Strict snapshot mapping; a response may wrap the record in `snapshot`.
pub fn map_security_snapshot(raw: &Value) -> Result<PositionRecord, MappingError> {
    let record = raw.get("snapshot").unwrap_or(raw);
    map_position_snapshot_to_record(record)
}

/// Fills `{TICKER}` and `{NAME}` in the news prompt template. Without a
/// ticker the name stands in.
pub fn fill_news_prompt(template: &str, ticker: Option<&str>, name: &str) -> String {
    let ticker = ticker.filter(|t| !t.trim().is_empty()).unwrap_or(name);
    template.replace("{TICKER}", ticker).replace("{NAME}", name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistorySummary {
    pub first: f64,
    pub last: f64,
    pub min: f64,
    pub max: f64,
    pub change_pct: Option<f64>,
}

pub fn summarize_history(points: &[HistoryPoint]) -> Option<HistorySummary> {
    let first = points.first()?.close;
    let last = points.last()?.close;
    let (min, max) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.close), hi.max(p.close))
        });
    Some(HistorySummary {
        first,
        last,
        min,
        max,
        change_pct: (first != 0.0).then(|| (last - first) / first * 100.0),
    })
}

/// Per-chart state, keyed by chart id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChartState {
    pub security_uuid: String,
    pub range: HistoryRange,
    pub hovered: Option<usize>,
}

#[derive(Debug, Default)]
pub struct SecurityDetailStore {
    snapshots: HashMap<String, PositionRecord>,
    history: HashMap<String, HashMap<HistoryRange, Vec<HistoryPoint>>>,
    markers: HashMap<String, HashMap<HistoryRange, Vec<TransactionMarker>>>,
    charts: HashMap<String, ChartState>,
}

impl SecurityDetailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&mut self, record: PositionRecord) {
        self.snapshots.insert(record.security_uuid.clone(), record);
    }

    pub fn snapshot(&self, security_uuid: &str) -> Option<&PositionRecord> {
        self.snapshots.get(security_uuid)
    }

    pub fn cache_history(
        &mut self,
        security_uuid: &str,
        range: HistoryRange,
        points: Vec<HistoryPoint>,
        markers: Vec<TransactionMarker>,
    ) {
        self.history
            .entry(security_uuid.to_string())
            .or_default()
            .insert(range, points);
        self.markers
            .entry(security_uuid.to_string())
            .or_default()
            .insert(range, markers);
    }

    pub fn history(&self, security_uuid: &str, range: HistoryRange) -> Option<&[HistoryPoint]> {
        self.history
            .get(security_uuid)?
            .get(&range)
            .map(Vec::as_slice)
    }

    pub fn markers(&self, security_uuid: &str, range: HistoryRange) -> Option<&[TransactionMarker]> {
        self.markers
            .get(security_uuid)?
            .get(&range)
            .map(Vec::as_slice)
    }

    /// Drops cached history and markers of one security. The snapshot stays
    /// so an open detail page keeps rendering while its history reloads.
    pub fn invalidate_history(&mut self, security_uuid: &str) -> bool {
        let history = self.history.remove(security_uuid).is_some();
        let markers = self.markers.remove(security_uuid).is_some();
        history || markers
    }

    /// Returns the securities whose cached history was dropped.
    pub fn handle_event(&mut self, event: &DashboardEvent) -> Vec<String> {
        let DashboardEvent::PortfolioPositionsUpdated { security_uuids, .. } = event else {
            return Vec::new();
        };
        security_uuids
            .iter()
            .filter(|uuid| self.invalidate_history(uuid))
            .inspect(|uuid| debug!(security = %uuid, "security history invalidated"))
            .cloned()
            .collect()
    }

    pub fn chart_state_mut(&mut self, chart_id: &str) -> &mut ChartState {
        self.charts.entry(chart_id.to_string()).or_default()
    }

    pub fn chart_state(&self, chart_id: &str) -> Option<&ChartState> {
        self.charts.get(chart_id)
    }

    pub fn remove_chart(&mut self, chart_id: &str) {
        self.charts.remove(chart_id);
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.history.clear();
        self.markers.clear();
        self.charts.clear();
    }
}

pub fn chart_id(security_uuid: &str) -> String {
    format!("history-{security_uuid}")
}

/// Markup of a security detail page. The chart itself is drawn by the host
/// application from the `data-*` attributes of the chart container.
pub fn render_security_detail(
    record: &PositionRecord,
    range: HistoryRange,
    history: Option<(&[HistoryPoint], &[TransactionMarker])>,
) -> String {
    let mut out = format!(
        r#"<div class="security-detail" data-security="{}"><h2>{}</h2>"#,
        escape_html(&record.security_uuid),
        escape_html(&record.name)
    );
    if let Some(ticker) = &record.ticker_symbol {
        let _ = write!(out, r#"<div class="ticker">{}</div>"#, escape_html(ticker));
    }
    let _ = write!(
        out,
        r#"<dl class="security-meta"><dt>Bestand</dt><dd>{}</dd><dt>Aktueller Wert</dt><dd>{}</dd><dt>Gesamt +/-</dt><dd>{}</dd><dt>Gesamt %</dt><dd>{}</dd></dl>"#,
        format_holdings(record.current_holdings),
        format_currency(record.current_value),
        format_value_markup(ValueKind::SignedCurrency, record.gain_abs(), None),
        format_value_markup(ValueKind::Percent, record.gain_pct(), None),
    );

    out.push_str(r#"<div class="range-selector">"#);
    for option in HistoryRange::ALL_RANGES {
        let active = if option == range { " active" } else { "" };
        let _ = write!(
            out,
            r#"<button class="range-button{active}" data-range="{label}">{label}</button>"#,
            label = option.label()
        );
    }
    out.push_str("</div>");

    let Some((points, markers)) = history else {
        let _ = write!(
            out,
            r#"<div class="history-chart" data-chart-id="{}" data-range="{}"><div class="history-loading">Lade Kursdaten...</div></div></div>"#,
            escape_html(&chart_id(&record.security_uuid)),
            range.label()
        );
        return out;
    };
    let _ = write!(
        out,
        r#"<div class="history-chart" data-chart-id="{}" data-range="{}" data-points="{}" data-markers="{}">"#,
        escape_html(&chart_id(&record.security_uuid)),
        range.label(),
        points.len(),
        markers.len()
    );
    match summarize_history(points) {
        Some(summary) => {
            let _ = write!(
                out,
                r#"<div class="history-summary">{} → {} ({})</div>"#,
                format_currency(summary.first),
                format_currency(summary.last),
                format_value_markup(ValueKind::Percent, summary.change_pct, None)
            );
        }
        None => out.push_str(r#"<div class="history-empty">Keine Kursdaten im gewählten Zeitraum</div>"#),
    }
    out.push_str("</div></div>");
    out
}

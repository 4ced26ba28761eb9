//! Table rendering.
//!
//! Records are turned into [`TableRow`]s, then into a [`Table`] of the view
//! tree. [`render_table`] is the string form used for one-shot rendering.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::dom::{
    Align, Cell, DetailRow, ElementData, HeaderCell, Row, Table, TOGGLE_COLLAPSED,
    TOGGLE_EXPANDED,
};
use crate::format::{
    escape_html, format_value_markup, missing_value_markup, ValueKind, FX_UNAVAILABLE_REASON,
};
use crate::model::{
    derive_badges, derive_day_change_pct, derive_gain_pct, AccountRecord, Badge, PerformanceBlock,
    PortfolioRecord, PositionRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub key: &'static str,
    pub label: &'static str,
    /// `None` renders the cell as text/markup.
    pub kind: Option<ValueKind>,
}

impl Column {
    const fn text(key: &'static str, label: &'static str) -> Self {
        Self {
            key,
            label,
            kind: None,
        }
    }

    const fn number(key: &'static str, label: &'static str, kind: ValueKind) -> Self {
        Self {
            key,
            label,
            kind: Some(kind),
        }
    }

    pub fn align(&self) -> Align {
        match self.kind {
            Some(_) => Align::Right,
            None => Align::Left,
        }
    }
}

pub static ACCOUNT_COLUMNS: [Column; 2] = [
    Column::text("name", "Name"),
    Column::number("balance", "Kontostand", ValueKind::Currency),
];

pub static FX_ACCOUNT_COLUMNS: [Column; 3] = [
    Column::text("name", "Name"),
    Column::text("orig_balance", "Betrag (Währung)"),
    Column::number("balance", "Betrag (EUR)", ValueKind::Currency),
];

pub static BALANCE_SUM_COLUMNS: [&str; 1] = ["balance"];

pub static PORTFOLIO_COLUMNS: [Column; 8] = [
    Column::text("name", "Name"),
    Column::number("position_count", "Positionen", ValueKind::Count),
    Column::number("purchase_sum", "Kaufsumme", ValueKind::Currency),
    Column::number("current_value", "Aktueller Wert", ValueKind::Currency),
    Column::number("day_change_abs", "Heute +/-", ValueKind::SignedCurrency),
    Column::number("day_change_pct", "Heute %", ValueKind::Percent),
    Column::number("gain_abs", "Gesamt +/-", ValueKind::SignedCurrency),
    Column::number("gain_pct", "Gesamt %", ValueKind::Percent),
];
pub static PORTFOLIO_SUM_COLUMNS: [&str; 7] = [
    "position_count",
    "purchase_sum",
    "current_value",
    "day_change_abs",
    "day_change_pct",
    "gain_abs",
    "gain_pct",
];

pub static POSITION_COLUMNS: [Column; 6] = [
    Column::text("name", "Wertpapier"),
    Column::number("current_holdings", "Bestand", ValueKind::Holdings),
    Column::number("purchase_value", "Kaufwert", ValueKind::Currency),
    Column::number("current_value", "Aktueller Wert", ValueKind::Currency),
    Column::number("gain_abs", "+/-", ValueKind::SignedCurrency),
    Column::number("gain_pct", "%", ValueKind::Percent),
];
pub static POSITION_SUM_COLUMNS: [&str; 4] = ["purchase_value", "current_value", "gain_abs", "gain_pct"];

/// Numeric keys every row exposes as `data-*` so the footer can be rebuilt
/// from the rendered rows alone.
pub static FOOTER_INPUT_KEYS: [&str; 8] = [
    "balance",
    "position_count",
    "purchase_sum",
    "purchase_value",
    "current_value",
    "day_change_abs",
    "gain_abs",
    "gain_pct",
];

/// Column set per table kind, keyed by the table's `data-table` attribute.
pub static TABLE_LAYOUTS: Lazy<BTreeMap<&'static str, (&'static [Column], &'static [&'static str])>> =
    Lazy::new(|| {
        let mut layouts: BTreeMap<&'static str, (&'static [Column], &'static [&'static str])> =
            BTreeMap::new();
        layouts.insert("accounts", (&ACCOUNT_COLUMNS[..], &BALANCE_SUM_COLUMNS[..]));
        layouts.insert("fx-accounts", (&FX_ACCOUNT_COLUMNS[..], &BALANCE_SUM_COLUMNS[..]));
        layouts.insert("portfolios", (&PORTFOLIO_COLUMNS[..], &PORTFOLIO_SUM_COLUMNS[..]));
        layouts.insert("positions", (&POSITION_COLUMNS[..], &POSITION_SUM_COLUMNS[..]));
        layouts
    });

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    /// Pre-rendered markup, inserted verbatim.
    Markup(String),
    Number(Option<f64>),
}

/// One record prepared for rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRow {
    pub data: ElementData,
    pub cells: BTreeMap<String, CellValue>,
    pub performance: Option<PerformanceBlock>,
    pub fx_unavailable: bool,
    pub detail: Option<DetailRow>,
}

impl TableRow {
    fn set_number(&mut self, key: &str, value: Option<f64>) {
        self.cells.insert(key.to_string(), CellValue::Number(value));
    }

    /// Numeric value of a column, falling back to the nested performance
    /// block for gain and day-change columns.
    pub fn number(&self, key: &str) -> Option<f64> {
        if let Some(CellValue::Number(Some(value))) = self.cells.get(key) {
            if value.is_finite() {
                return Some(*value);
            }
        }
        let performance = self.performance.as_ref()?;
        let day_change = performance.day_change.as_ref();
        match key {
            "gain_abs" => performance.gain_abs,
            "gain_pct" => performance.gain_pct,
            "day_change_abs" => day_change.and_then(|d| d.value_change_eur),
            "day_change_pct" => day_change.and_then(|d| d.change_pct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableOptions {
    pub table_kind: &'static str,
    pub sortable: bool,
    pub default_sort: Option<(&'static str, SortDir)>,
    pub footer_label: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDir::Asc => "asc",
            SortDir::Desc => "desc",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("desc") {
            SortDir::Desc
        } else {
            SortDir::Asc
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            SortDir::Asc => SortDir::Desc,
            SortDir::Desc => SortDir::Asc,
        }
    }
}

/// Inputs of the aggregate footer for a single row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FooterInput {
    pub values: BTreeMap<String, Option<f64>>,
    pub fx_unavailable: bool,
}

impl FooterInput {
    fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied().flatten()
    }

    /// Rebuilds the footer input from a rendered row's dataset.
    pub fn from_row_data(data: &ElementData) -> Self {
        let values = FOOTER_INPUT_KEYS
            .iter()
            .map(|key| {
                let value = data.data(key).and_then(|raw| raw.parse::<f64>().ok());
                (key.to_string(), value)
            })
            .collect();
        Self {
            values,
            fx_unavailable: data.data("fx_unavailable") == Some("true"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Total {
    sum: f64,
    complete: bool,
}

/// Aggregates over all rows of a table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FooterTotals {
    pub values: BTreeMap<String, Option<f64>>,
    pub has_value: bool,
    pub fx_unavailable: bool,
}

pub fn compute_totals(rows: &[FooterInput], sum_columns: &[&str]) -> FooterTotals {
    let total = |key: &str| {
        let mut total = Total {
            sum: 0.0,
            complete: !rows.is_empty(),
        };
        for row in rows {
            match row.get(key) {
                Some(value) => total.sum += value,
                None => total.complete = false,
            }
        }
        total
    };
    let complete = |t: Total| t.complete.then_some(t.sum);

    let current = total("current_value");
    let purchase_sum = total("purchase_sum");
    let purchase_value = total("purchase_value");
    let purchase = if purchase_sum.complete {
        purchase_sum
    } else {
        purchase_value
    };
    let gain = total("gain_abs");
    let day_change = total("day_change_abs");

    // account tables carry their value in `balance`
    let has_value = if sum_columns.contains(&"balance") {
        total("balance").complete
    } else {
        current.complete
    };
    let fx_unavailable = !has_value || rows.iter().any(|r| r.fx_unavailable);

    let mut values = BTreeMap::new();
    for key in sum_columns {
        let value = match *key {
            "gain_pct" => complete(gain).and_then(|g| derive_gain_pct(g, complete(purchase), complete(current))),
            "day_change_pct" => match (complete(day_change), complete(current)) {
                (Some(change), Some(current)) => derive_day_change_pct(change, current),
                _ => None,
            },
            other => complete(total(other)),
        };
        values.insert(key.to_string(), value);
    }

    FooterTotals {
        values,
        has_value,
        fx_unavailable,
    }
}

fn footer_input(row: &TableRow) -> FooterInput {
    FooterInput {
        values: FOOTER_INPUT_KEYS
            .iter()
            .map(|key| (key.to_string(), row.number(key)))
            .collect(),
        fx_unavailable: row.fx_unavailable,
    }
}

/// Builds the footer row for `columns` from aggregated totals.
pub fn build_footer(columns: &[Column], totals: &FooterTotals, label: &str) -> Row {
    let mut data = ElementData::with_class("footer-row");
    data.set_data("footer", "true");
    data.set_data("has_value", totals.has_value.to_string());
    data.set_data("fx_unavailable", totals.fx_unavailable.to_string());

    let reason = totals.fx_unavailable.then_some(FX_UNAVAILABLE_REASON);
    let cells = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            if i == 0 {
                return Cell::new(column.key, column.align(), format!("<strong>{}</strong>", escape_html(label)));
            }
            match (totals.values.get(column.key), column.kind) {
                (Some(value), Some(kind)) => {
                    let mut cell = Cell::new(column.key, column.align(), format_value_markup(kind, *value, reason));
                    if let Some(v) = value {
                        cell.data.set_data("value", v.to_string());
                    }
                    cell
                }
                _ => Cell::new(column.key, column.align(), String::new()),
            }
        })
        .collect();

    Row {
        data,
        cells,
        detail: None,
    }
}

/// Body row for `row`; numeric footer inputs are mirrored into its dataset.
pub fn build_row(row: &TableRow, columns: &[Column]) -> Row {
    let mut data = row.data.clone();
    for key in FOOTER_INPUT_KEYS {
        match row.number(key) {
            Some(value) => data.set_data(key, value.to_string()),
            None => data.remove_data(key),
        }
    }
    data.set_data("fx_unavailable", row.fx_unavailable.to_string());
    Row {
        data,
        cells: columns.iter().map(|c| build_cell(c, row)).collect(),
        detail: row.detail.clone(),
    }
}

pub fn build_cell(column: &Column, row: &TableRow) -> Cell {
    match column.kind {
        Some(kind) => {
            let value = row.number(column.key);
            let reason = row.fx_unavailable.then_some(FX_UNAVAILABLE_REASON);
            let mut cell = Cell::new(column.key, column.align(), format_value_markup(kind, value, reason));
            if let Some(v) = value {
                cell.data.set_data("value", v.to_string());
            }
            cell
        }
        None => {
            let inner = match row.cells.get(column.key) {
                Some(CellValue::Text(text)) => escape_html(text),
                Some(CellValue::Markup(markup)) => markup.clone(),
                Some(CellValue::Number(Some(v))) => v.to_string(),
                Some(CellValue::Number(None)) | None => missing_value_markup(None),
            };
            Cell::new(column.key, column.align(), inner)
        }
    }
}

/// Builds the view-tree table for `rows`.
pub fn build_table(
    rows: &[TableRow],
    columns: &[Column],
    sum_columns: &[&str],
    options: &TableOptions,
) -> Table {
    let mut data = ElementData::with_class("dashboard-table");
    if !options.table_kind.is_empty() {
        data.add_class(&format!("{}-table", options.table_kind));
        data.set_data("table", options.table_kind);
    }
    if options.sortable {
        data.add_class("sortable-table");
        if let Some((key, dir)) = options.default_sort {
            data.set_data("default_sort", key);
            data.set_data("default_dir", dir.as_str());
        }
    }

    let header = columns
        .iter()
        .map(|column| {
            let mut data = ElementData::with_class(match column.align() {
                Align::Left => "align-left",
                Align::Right => "align-right",
            });
            if options.sortable {
                data.set_data("sort_key", column.key);
            }
            HeaderCell {
                key: column.key.to_string(),
                label: column.label.to_string(),
                data,
            }
        })
        .collect();

    let body = rows.iter().map(|row| build_row(row, columns)).collect();

    let footer = if sum_columns.is_empty() {
        None
    } else {
        let inputs: Vec<FooterInput> = rows.iter().map(footer_input).collect();
        let totals = compute_totals(&inputs, sum_columns);
        Some(build_footer(columns, &totals, options.footer_label.unwrap_or("Summe")))
    };

    Table {
        data,
        header,
        rows: body,
        footer,
    }
}

pub fn render_table(
    rows: &[TableRow],
    columns: &[Column],
    sum_columns: &[&str],
    options: &TableOptions,
) -> String {
    build_table(rows, columns, sum_columns, options).to_html()
}

fn badges_markup(badges: &[Badge]) -> String {
    badges
        .iter()
        .map(|badge| {
            let title = badge
                .tooltip
                .as_deref()
                .map(|t| format!(r#" title="{}""#, escape_html(t)))
                .unwrap_or_default();
            format!(
                r#"<span class="{}"{}>{}</span>"#,
                badge.css_class(),
                title,
                escape_html(&badge.label)
            )
        })
        .collect()
}

fn name_markup(name: &str, badges: &[Badge]) -> String {
    let badges = badges_markup(badges);
    if badges.is_empty() {
        escape_html(name)
    } else {
        format!(r#"{}<span class="badges">{}</span>"#, escape_html(name), badges)
    }
}

pub fn account_row(account: &AccountRecord) -> TableRow {
    let mut row = TableRow::default();
    row.data.set_data("account", &account.uuid);
    if let Some(run) = &account.metric_run_uuid {
        row.data.set_data("metric_run", run);
    }
    let badges = derive_badges(
        account.coverage_ratio,
        account.provenance.as_deref(),
        account.fx_unavailable,
    );
    row.cells
        .insert("name".into(), CellValue::Markup(name_markup(&account.name, &badges)));
    row.set_number("balance", account.balance);
    let native = match account.orig_balance {
        Some(v) => format!(
            "{} {}",
            crate::format::format_number(v, 2),
            escape_html(&account.currency_code)
        ),
        None => missing_value_markup(None),
    };
    let native = match (account.fx_rate, account.fx_rate_source.as_deref()) {
        (Some(rate), source) => format!(
            r#"<span title="Kurs {}{}">{}</span>"#,
            crate::format::format_number(rate, 4),
            source.map(|s| format!(" ({})", escape_html(s))).unwrap_or_default(),
            native
        ),
        _ => native,
    };
    row.cells.insert("orig_balance".into(), CellValue::Markup(native));
    row.fx_unavailable = account.fx_unavailable;
    row
}

pub fn portfolio_row(portfolio: &PortfolioRecord, columns: usize) -> TableRow {
    portfolio_row_in_state(portfolio, columns, false)
}

/// Portfolio row whose toggle button shows `expanded`.
pub fn portfolio_row_in_state(portfolio: &PortfolioRecord, columns: usize, expanded: bool) -> TableRow {
    let mut row = TableRow::default();
    row.data.add_class("portfolio-row");
    row.data.set_data("portfolio", &portfolio.uuid);
    let badges = derive_badges(
        portfolio.coverage_ratio,
        portfolio.provenance.as_deref(),
        portfolio.fx_unavailable,
    );
    let toggle = format!(
        r#"<button class="portfolio-toggle" data-portfolio="{}" {}"#,
        escape_html(&portfolio.uuid),
        if expanded { TOGGLE_EXPANDED } else { TOGGLE_COLLAPSED }
    );
    row.cells.insert(
        "name".into(),
        CellValue::Markup(format!("{toggle}{}", name_markup(&portfolio.name, &badges))),
    );
    row.set_number("position_count", Some(f64::from(portfolio.position_count)));
    row.set_number("purchase_sum", portfolio.purchase_sum);
    row.set_number("current_value", portfolio.current_value);
    row.set_number("day_change_abs", portfolio.day_change_abs);
    row.set_number("day_change_pct", portfolio.day_change_pct);
    row.set_number("gain_abs", portfolio.gain_abs);
    row.set_number("gain_pct", portfolio.gain_pct);
    row.performance = portfolio.performance.clone();
    row.fx_unavailable = portfolio.fx_unavailable;
    let mut detail = DetailRow::new(&portfolio.uuid, columns);
    detail.set_expanded(expanded);
    row.detail = Some(detail);
    row
}

pub fn position_row(position: &PositionRecord) -> TableRow {
    let mut row = TableRow::default();
    row.data.add_class("position-row");
    row.data.set_data("security", &position.security_uuid);
    let badges = derive_badges(position.coverage_ratio, position.provenance.as_deref(), false);
    let link = format!(
        r#"<a class="security-link" data-security="{}">{}</a>"#,
        escape_html(&position.security_uuid),
        name_markup(&position.name, &badges)
    );
    row.cells.insert("name".into(), CellValue::Markup(link));
    row.set_number("current_holdings", Some(position.current_holdings));
    row.set_number("purchase_value", Some(position.purchase_value));
    row.set_number("current_value", Some(position.current_value));
    row.performance = position.performance.clone();
    row
}

pub fn accounts_table(accounts: &[&AccountRecord]) -> Table {
    let rows: Vec<TableRow> = accounts.iter().map(|a| account_row(a)).collect();
    build_table(
        &rows,
        &ACCOUNT_COLUMNS,
        &BALANCE_SUM_COLUMNS,
        &TableOptions {
            table_kind: "accounts",
            ..Default::default()
        },
    )
}

pub fn fx_accounts_table(accounts: &[&AccountRecord]) -> Table {
    let rows: Vec<TableRow> = accounts.iter().map(|a| account_row(a)).collect();
    build_table(
        &rows,
        &FX_ACCOUNT_COLUMNS,
        &BALANCE_SUM_COLUMNS,
        &TableOptions {
            table_kind: "fx-accounts",
            ..Default::default()
        },
    )
}

pub fn portfolios_table(portfolios: &[PortfolioRecord]) -> Table {
    let rows: Vec<TableRow> = portfolios
        .iter()
        .map(|p| portfolio_row(p, PORTFOLIO_COLUMNS.len()))
        .collect();
    build_table(
        &rows,
        &PORTFOLIO_COLUMNS,
        &PORTFOLIO_SUM_COLUMNS,
        &TableOptions {
            table_kind: "portfolios",
            sortable: true,
            default_sort: Some(("name", SortDir::Asc)),
            footer_label: None,
        },
    )
}

pub fn positions_table(positions: &[PositionRecord]) -> Table {
    let rows: Vec<TableRow> = positions.iter().map(position_row).collect();
    build_table(
        &rows,
        &POSITION_COLUMNS,
        &POSITION_SUM_COLUMNS,
        &TableOptions {
            table_kind: "positions",
            sortable: true,
            default_sort: Some(("name", SortDir::Asc)),
            footer_label: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize_portfolio, normalize_positions};
    use serde_json::json;

    fn portfolio(uuid: &str, current: serde_json::Value) -> PortfolioRecord {
        normalize_portfolio(&json!({
            "uuid": uuid, "name": uuid, "position_count": 1,
            "current_value": current, "purchase_sum": 40, "gain_abs": 10
        }))
        .unwrap()
    }

    #[test]
    fn test_footer_flags_unknown_values() {
        let table = portfolios_table(&[
            portfolio("a", json!(100)),
            portfolio("b", json!(null)),
            portfolio("c", json!(50)),
        ]);
        let footer = table.footer.as_ref().unwrap();
        assert_eq!(footer.data.data("has_value"), Some("false"));
        assert_eq!(footer.data.data("fx_unavailable"), Some("true"));
        let current = footer.cell("current_value").unwrap();
        assert!(current.inner_html.contains("missing-value"));
        assert!(current.inner_html.contains("Wechselkurs nicht verfügbar"));
        assert_eq!(footer.cells.len(), PORTFOLIO_COLUMNS.len());
    }

    #[test]
    fn test_footer_derives_gain_pct_from_sums() {
        let table = portfolios_table(&[portfolio("a", json!(50)), portfolio("b", json!(50))]);
        let footer = table.footer.as_ref().unwrap();
        assert_eq!(footer.data.data("has_value"), Some("true"));
        // 20 gain on 80 purchase
        assert_eq!(footer.cell("gain_pct").unwrap().data.data("value"), Some("25"));
        assert_eq!(footer.cell("current_value").unwrap().inner_html, "100,00 €");
    }

    #[test]
    fn test_footer_gain_pct_without_purchase_sum() {
        let rows = vec![FooterInput {
            values: [("current_value".to_string(), Some(120.0)), ("gain_abs".to_string(), Some(20.0))]
                .into_iter()
                .collect(),
            fx_unavailable: false,
        }];
        let totals = compute_totals(&rows, &["gain_pct"]);
        assert_eq!(totals.values["gain_pct"], Some(20.0));
    }

    #[test]
    fn test_footer_day_change_pct_from_summed_change() {
        let row = |current: f64, change: Option<f64>| FooterInput {
            values: [
                ("current_value".to_string(), Some(current)),
                ("day_change_abs".to_string(), change),
            ]
            .into_iter()
            .collect(),
            fx_unavailable: false,
        };
        // 30 change on a previous value of 300, not the mean of the row percentages
        let totals = compute_totals(
            &[row(110.0, Some(10.0)), row(220.0, Some(20.0))],
            &["day_change_abs", "day_change_pct"],
        );
        assert_eq!(totals.values["day_change_abs"], Some(30.0));
        assert_eq!(totals.values["day_change_pct"], Some(10.0));

        let partial = compute_totals(&[row(110.0, Some(10.0)), row(220.0, None)], &["day_change_pct"]);
        assert_eq!(partial.values["day_change_pct"], None);

        let unchanged_base = compute_totals(&[row(10.0, Some(10.0))], &["day_change_pct"]);
        assert_eq!(unchanged_base.values["day_change_pct"], None);
    }

    #[test]
    fn test_position_gain_falls_back_to_performance() {
        let positions = normalize_positions(&json!([{
            "security_uuid": "s1", "name": "A", "current_holdings": 1,
            "purchase_value": 100, "current_value": 110,
            "performance": {"gain_abs": 10}
        }]));
        let html = render_table(
            &positions.iter().map(position_row).collect::<Vec<_>>(),
            &POSITION_COLUMNS,
            &POSITION_SUM_COLUMNS,
            &TableOptions::default(),
        );
        assert!(html.contains(r#"<span class="positive">10,00 €</span>"#));
        assert!(html.contains(r#"<span class="positive">10,00 %</span>"#));
    }

    #[test]
    fn test_sortable_metadata() {
        let html = render_table(
            &[],
            &PORTFOLIO_COLUMNS,
            &[],
            &TableOptions {
                table_kind: "portfolios",
                sortable: true,
                default_sort: Some(("current_value", SortDir::Desc)),
                footer_label: None,
            },
        );
        assert!(html.contains(r#"data-default-dir="desc" data-default-sort="current_value""#));
        assert!(html.contains(r#"data-sort-key="gain_pct""#));
        assert!(!html.contains("<tfoot>"));
    }

    #[test]
    fn test_footer_input_roundtrips_through_dataset() {
        let table = portfolios_table(&[portfolio("a", json!(100))]);
        let input = FooterInput::from_row_data(&table.rows[0].data);
        assert_eq!(input.values["current_value"], Some(100.0));
        assert_eq!(input.values["purchase_sum"], Some(40.0));
        assert!(!input.fx_unavailable);
    }
}

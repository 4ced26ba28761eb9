//! In-place updates of the rendered view.
//!
//! Cells are diffed against the record that produced them and rewritten only
//! when the value moved. Changed cells get [`FLASH_CLASS`]; the caller is
//! responsible for removing it again. Sort state, expanded detail rows and
//! error banners live on the view and survive every patch.

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use crate::dom::{
    ContainerContent, DashboardView, DetailRow, FlashTarget, Row, Table, TableId, FLASH_CLASS,
};
use crate::format::{parse_locale_str, strip_tags};
use crate::model::{AccountRecord, PortfolioRecord, PositionRecord};
use crate::render::{
    account_row, accounts_table, build_footer, build_row, compute_totals, fx_accounts_table,
    portfolio_row, portfolio_row_in_state, position_row, positions_table, Column, FooterInput,
    SortDir, TableRow, ACCOUNT_COLUMNS, FX_ACCOUNT_COLUMNS, PORTFOLIO_COLUMNS, POSITION_COLUMNS,
    TABLE_LAYOUTS,
};

/// Values closer than this are considered unchanged.
pub const VALUE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Applied(Vec<FlashTarget>),
    /// Target section missing or collapsed; queue the update.
    Deferred,
}

fn values_differ(previous: Option<f64>, next: Option<f64>) -> bool {
    match (previous, next) {
        (Some(a), Some(b)) => (a - b).abs() > VALUE_EPSILON,
        (None, None) => false,
        _ => true,
    }
}

/// Reads a value back from a cell this module did not produce.
pub fn legacy_cell_value(row: &Row, column: &str) -> Option<f64> {
    let cell = row.cell(column)?;
    if let Some(value) = cell.data.data("value").and_then(|v| v.parse::<f64>().ok()) {
        return Some(value);
    }
    parse_locale_str(&strip_tags(&cell.inner_html))
}

/// Rewrites the cells of `row` whose value differs from `previous` and
/// returns the changed column keys.
fn patch_row(row: &mut Row, fresh: &TableRow, previous: Option<&TableRow>, columns: &[Column]) -> Vec<String> {
    let rebuilt = build_row(fresh, columns);
    let mut changed = Vec::new();

    for (column, new_cell) in columns.iter().zip(rebuilt.cells) {
        let before = match column.kind {
            Some(_) => match previous {
                Some(model) => model.number(column.key),
                None => legacy_cell_value(row, column.key),
            },
            None => None,
        };
        let Some(cell) = row.cell_mut(column.key) else {
            continue;
        };
        let flash = match column.kind {
            Some(_) => values_differ(before, fresh.number(column.key)),
            None => cell.inner_html != new_cell.inner_html,
        };
        if flash || cell.inner_html != new_cell.inner_html {
            cell.inner_html = new_cell.inner_html;
            match new_cell.data.data("value") {
                Some(value) => cell.data.set_data("value", value),
                None => cell.data.remove_data("value"),
            }
        }
        if flash {
            cell.data.add_class(FLASH_CLASS);
            changed.push(column.key.to_string());
        }
    }

    let detail = row.detail.take();
    let mut data = rebuilt.data;
    data.id = row.data.id.take();
    row.data = data;
    row.detail = detail;
    changed
}

fn flash_targets(table: &TableId, row_key: &str, columns: Vec<String>) -> Vec<FlashTarget> {
    columns
        .into_iter()
        .map(|column| FlashTarget::Cell {
            table: table.clone(),
            row_key: row_key.to_string(),
            column,
        })
        .collect()
}

fn row_keys(table: &Table, attr: &str) -> Vec<String> {
    table
        .rows
        .iter()
        .filter_map(|r| r.data.data(attr).map(str::to_string))
        .collect()
}

/// Rebuilds the footer from the rows' `data-*` attributes.
pub fn recompute_footer(table: &mut Table) {
    let Some(kind) = table.data.data("table") else {
        return;
    };
    let Some((columns, sum_columns)) = TABLE_LAYOUTS.get(kind) else {
        return;
    };
    if sum_columns.is_empty() {
        return;
    }
    let inputs: Vec<FooterInput> = table
        .rows
        .iter()
        .map(|row| FooterInput::from_row_data(&row.data))
        .collect();
    let totals = compute_totals(&inputs, sum_columns);
    table.footer = Some(build_footer(columns, &totals, "Summe"));
}

fn patch_account_table(
    view: &mut DashboardView,
    id: TableId,
    accounts: &[&AccountRecord],
    previous: &[AccountRecord],
    columns: &[Column],
) -> Vec<FlashTarget> {
    let slot = match id {
        TableId::Accounts => &mut view.accounts,
        TableId::FxAccounts => &mut view.fx_accounts,
        _ => return Vec::new(),
    };
    let uuids: Vec<String> = accounts.iter().map(|a| a.uuid.clone()).collect();

    let unchanged = slot
        .as_ref()
        .is_some_and(|table| row_keys(table, "account") == uuids);
    if !unchanged {
        // membership changed: rebuild the whole section
        *slot = match (accounts.is_empty(), &id) {
            (true, TableId::FxAccounts) => None,
            (_, TableId::FxAccounts) => Some(fx_accounts_table(accounts)),
            _ => Some(accounts_table(accounts)),
        };
        debug!(table = ?id, rows = accounts.len(), "account table re-rendered");
        return Vec::new();
    }
    let Some(table) = slot.as_mut() else {
        return Vec::new();
    };

    let mut targets = Vec::new();
    for account in accounts {
        let Some(row) = table.row_by_mut("account", &account.uuid) else {
            continue;
        };
        let before = previous.iter().find(|p| p.uuid == account.uuid).map(account_row);
        let changed = patch_row(row, &account_row(account), before.as_ref(), columns);
        targets.extend(flash_targets(&id, &account.uuid, changed));
    }
    recompute_footer(table);
    targets
}

/// Applies a new account list. Rows are patched per cell when the set of
/// accounts is unchanged, otherwise the affected table is re-rendered.
pub fn patch_accounts(
    view: &mut DashboardView,
    accounts: &[AccountRecord],
    previous: &[AccountRecord],
) -> Vec<FlashTarget> {
    let (fx, eur): (Vec<&AccountRecord>, Vec<&AccountRecord>) =
        accounts.iter().partition(|a| a.is_foreign_currency());
    let mut targets = patch_account_table(view, TableId::Accounts, &eur, previous, &ACCOUNT_COLUMNS);
    targets.extend(patch_account_table(
        view,
        TableId::FxAccounts,
        &fx,
        previous,
        &FX_ACCOUNT_COLUMNS,
    ));
    targets
}

/// Merges updated portfolios into the rendered table. Unknown portfolios
/// are appended. The active sort is re-applied since patched values can
/// move rows.
pub fn patch_portfolios(
    view: &mut DashboardView,
    updated: &[PortfolioRecord],
    previous: &HashMap<String, PortfolioRecord>,
) -> Vec<FlashTarget> {
    let Some(table) = view.portfolios.as_mut() else {
        return Vec::new();
    };
    let mut targets = Vec::new();

    for portfolio in updated {
        match table.row_by_mut("portfolio", &portfolio.uuid) {
            Some(row) => {
                let expanded = row.detail.as_ref().is_some_and(DetailRow::is_expanded);
                let fresh = portfolio_row_in_state(portfolio, PORTFOLIO_COLUMNS.len(), expanded);
                let before = previous
                    .get(&portfolio.uuid)
                    .map(|p| portfolio_row_in_state(p, PORTFOLIO_COLUMNS.len(), expanded));
                let changed = patch_row(row, &fresh, before.as_ref(), &PORTFOLIO_COLUMNS);
                targets.extend(flash_targets(&TableId::Portfolios, &portfolio.uuid, changed));
            }
            None => {
                debug!(portfolio = %portfolio.uuid, "portfolio row appended");
                let fresh = portfolio_row(portfolio, PORTFOLIO_COLUMNS.len());
                table.rows.push(build_row(&fresh, &PORTFOLIO_COLUMNS));
            }
        }
    }

    apply_current_sort(table);
    recompute_footer(table);
    targets
}

/// Renders a portfolio's positions into its detail row.
///
/// Deferred when the portfolio row is not rendered or collapsed. An existing
/// table's sort state is carried over and cells that moved against
/// `previous` are flashed.
pub fn apply_positions(
    view: &mut DashboardView,
    portfolio_uuid: &str,
    positions: &[PositionRecord],
    previous: &[PositionRecord],
) -> PatchOutcome {
    let Some(detail) = view.detail_row_mut(portfolio_uuid) else {
        return PatchOutcome::Deferred;
    };
    if !detail.is_expanded() {
        return PatchOutcome::Deferred;
    }

    let mut table = positions_table(positions);
    let table_id = TableId::Positions(portfolio_uuid.to_string());
    let mut targets = Vec::new();

    if let Some(old) = detail.container.table() {
        for key in ["sort_key", "sort_dir"] {
            if let Some(value) = old.data.data(key) {
                table.data.set_data(key, value);
            }
        }
        for position in positions {
            let Some(prior) = previous.iter().find(|p| p.security_uuid == position.security_uuid) else {
                continue;
            };
            if old.row_by("security", &position.security_uuid).is_none() {
                continue;
            }
            let before = position_row(prior);
            let after = position_row(position);
            let Some(row) = table.row_by_mut("security", &position.security_uuid) else {
                continue;
            };
            for column in POSITION_COLUMNS.iter().filter(|c| c.kind.is_some()) {
                if values_differ(before.number(column.key), after.number(column.key)) {
                    if let Some(cell) = row.cell_mut(column.key) {
                        cell.data.add_class(FLASH_CLASS);
                    }
                    targets.extend(flash_targets(
                        &table_id,
                        &position.security_uuid,
                        vec![column.key.to_string()],
                    ));
                }
            }
        }
    }

    apply_current_sort(&mut table);
    detail.container.content = ContainerContent::Table(Box::new(table));
    PatchOutcome::Applied(targets)
}

/// Shows an inline error with a retry control in the positions container.
pub fn render_positions_error(view: &mut DashboardView, portfolio_uuid: &str, message: &str) -> bool {
    match view.detail_row_mut(portfolio_uuid) {
        Some(detail) => {
            detail.container.content = ContainerContent::Error {
                message: message.to_string(),
            };
            true
        }
        None => false,
    }
}

pub fn render_positions_loading(view: &mut DashboardView, portfolio_uuid: &str) -> bool {
    match view.detail_row_mut(portfolio_uuid) {
        Some(detail) => {
            detail.container.content = ContainerContent::Loading;
            true
        }
        None => false,
    }
}

/// Updates the header's total wealth; flashes when it moved.
pub fn update_total_wealth(view: &mut DashboardView, total: f64) -> Option<FlashTarget> {
    let header = &mut view.header;
    if !values_differ(header.total_wealth, Some(total)) {
        return None;
    }
    let first = header.total_wealth.is_none();
    header.total_wealth = Some(total);
    header.data.set_data("total_wealth", total.to_string());
    if first {
        return None;
    }
    header.data.add_class(FLASH_CLASS);
    Some(FlashTarget::TotalWealth)
}

pub fn update_last_file_update(view: &mut DashboardView, value: Option<&str>) {
    view.header.last_file_update = value.map(str::to_string);
}

fn sort_value(row: &Row, key: &str) -> SortValue {
    match row.cell(key) {
        Some(cell) => match cell.data.data("value").and_then(|v| v.parse::<f64>().ok()) {
            Some(number) => SortValue::Number(number),
            None if key == "name" => SortValue::Text(strip_tags(&cell.inner_html).to_lowercase()),
            None => SortValue::Missing,
        },
        None => SortValue::Missing,
    }
}

#[derive(Debug, PartialEq, PartialOrd)]
enum SortValue {
    Number(f64),
    Text(String),
    Missing,
}

/// Reorders body rows by `key`. Detail rows move with their parent row and
/// rows without a value always sort last.
pub fn sort_table(table: &mut Table, key: &str, dir: SortDir) {
    table.rows.sort_by(|a, b| {
        let (a, b) = (sort_value(a, key), sort_value(b, key));
        match (&a, &b) {
            (SortValue::Missing, SortValue::Missing) => Ordering::Equal,
            (SortValue::Missing, _) => Ordering::Greater,
            (_, SortValue::Missing) => Ordering::Less,
            _ => {
                let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
                match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                }
            }
        }
    });
    table.data.set_data("sort_key", key);
    table.data.set_data("sort_dir", dir.as_str());
}

/// Sorts by `key`, flipping the direction when `key` is already active.
pub fn toggle_sort(table: &mut Table, key: &str) -> SortDir {
    let dir = match (table.data.data("sort_key"), table.data.data("sort_dir")) {
        (Some(active), Some(dir)) if active == key => SortDir::parse(dir).toggled(),
        _ => SortDir::Asc,
    };
    sort_table(table, key, dir);
    dir
}

/// Re-applies the active sort, or the table's default sort.
pub fn apply_current_sort(table: &mut Table) {
    let active = table
        .data
        .data("sort_key")
        .map(|key| (key.to_string(), table.data.data("sort_dir").map(SortDir::parse).unwrap_or_default()));
    let default = table.data.data("default_sort").map(|key| {
        (
            key.to_string(),
            table.data.data("default_dir").map(SortDir::parse).unwrap_or_default(),
        )
    });
    if let Some((key, dir)) = active.or(default) {
        sort_table(table, &key, dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize_account, normalize_portfolio, normalize_positions};
    use crate::render::portfolios_table;
    use serde_json::{json, Value};

    fn account(balance: f64) -> AccountRecord {
        normalize_account(&json!({
            "uuid": "a1", "name": "Giro", "currency_code": "EUR", "balance": balance
        }))
        .unwrap()
    }

    fn portfolio(raw: Value) -> PortfolioRecord {
        normalize_portfolio(&raw).unwrap()
    }

    #[test]
    fn test_account_cell_patch_flashes_only_changed() {
        let before = vec![
            account(1000.0),
            normalize_account(&json!({"uuid": "a2", "name": "Tagesgeld", "balance": 50})).unwrap(),
        ];
        let mut view = DashboardView {
            accounts: Some(accounts_table(&before.iter().collect::<Vec<_>>())),
            ..Default::default()
        };
        let mut after = before.clone();
        after[0].balance = Some(1200.0);

        let targets = patch_accounts(&mut view, &after, &before);
        assert_eq!(
            targets,
            vec![FlashTarget::Cell {
                table: TableId::Accounts,
                row_key: "a1".into(),
                column: "balance".into()
            }]
        );
        let table = view.accounts.as_ref().unwrap();
        let cell = table.row_by("account", "a1").unwrap().cell("balance").unwrap();
        assert_eq!(cell.inner_html, "1.200,00 €");
        assert!(cell.data.has_class(FLASH_CLASS));
        let untouched = table.row_by("account", "a2").unwrap().cell("balance").unwrap();
        assert!(!untouched.data.has_class(FLASH_CLASS));
        let footer = table.footer.as_ref().unwrap();
        assert_eq!(footer.cell("balance").unwrap().inner_html, "1.250,00 €");
    }

    #[test]
    fn test_legacy_value_read_from_markup() {
        let mut row = Row::default();
        row.cells.push(crate::dom::Cell::new(
            "balance",
            crate::dom::Align::Right,
            "<span>1.000,50 €</span>".into(),
        ));
        assert_eq!(legacy_cell_value(&row, "balance"), Some(1000.5));
    }

    #[test]
    fn test_new_account_rebuilds_table() {
        let before = vec![account(10.0)];
        let mut view = DashboardView {
            accounts: Some(accounts_table(&before.iter().collect::<Vec<_>>())),
            ..Default::default()
        };
        let mut after = before.clone();
        after.push(normalize_account(&json!({"uuid": "a2", "name": "Neu", "balance": 5})).unwrap());
        let targets = patch_accounts(&mut view, &after, &[]);
        assert!(targets.is_empty());
        assert_eq!(view.accounts.as_ref().unwrap().rows.len(), 2);
        assert!(view.fx_accounts.is_none());
    }

    #[test]
    fn test_portfolio_patch_keeps_expansion_and_sort() {
        let a = portfolio(json!({"uuid": "a", "name": "Alpha", "current_value": 100}));
        let b = portfolio(json!({"uuid": "b", "name": "Beta", "current_value": 50}));
        let mut table = portfolios_table(&[a.clone(), b.clone()]);
        sort_table(&mut table, "current_value", SortDir::Asc);
        let mut view = DashboardView {
            portfolios: Some(table),
            ..Default::default()
        };
        view.set_expanded("a", true);

        let mut updated = a.clone();
        updated.current_value = Some(20.0);
        let previous: HashMap<String, PortfolioRecord> =
            [("a".to_string(), a), ("b".to_string(), b)].into_iter().collect();
        let c = portfolio(json!({"uuid": "c", "name": "Gamma", "current_value": 30}));
        let targets = patch_portfolios(&mut view, &[updated, c], &previous);

        assert!(targets.iter().any(|t| matches!(t, FlashTarget::Cell { column, .. } if column == "current_value")));
        assert!(view.is_expanded("a"));
        let table = view.portfolios.as_ref().unwrap();
        assert_eq!(row_keys(table, "portfolio"), vec!["a", "c", "b"]);
        assert_eq!(table.data.data("sort_key"), Some("current_value"));
        let footer = table.footer.as_ref().unwrap();
        assert_eq!(footer.cell("current_value").unwrap().inner_html, "100,00 €");
    }

    #[test]
    fn test_value_change_reorders_sorted_portfolios() {
        let a = portfolio(json!({"uuid": "a", "name": "Alpha", "current_value": 100}));
        let b = portfolio(json!({"uuid": "b", "name": "Beta", "current_value": 50}));
        let mut table = portfolios_table(&[a.clone(), b.clone()]);
        sort_table(&mut table, "current_value", SortDir::Asc);
        assert_eq!(row_keys(&table, "portfolio"), vec!["b", "a"]);
        let mut view = DashboardView {
            portfolios: Some(table),
            ..Default::default()
        };
        view.set_expanded("a", true);

        let mut updated = a.clone();
        updated.current_value = Some(10.0);
        updated.name = "Alpha Neu".to_string();
        let previous: HashMap<String, PortfolioRecord> =
            [("a".to_string(), a), ("b".to_string(), b)].into_iter().collect();
        patch_portfolios(&mut view, &[updated], &previous);

        let table = view.portfolios.as_ref().unwrap();
        assert_eq!(row_keys(table, "portfolio"), vec!["a", "b"]);
        let name = table.row_by("portfolio", "a").unwrap().cell("name").unwrap();
        assert!(name.inner_html.contains("Alpha Neu"));
        assert!(name.inner_html.contains(r#"aria-expanded="true""#));
    }

    #[test]
    fn test_positions_deferred_while_collapsed() {
        let mut view = DashboardView {
            portfolios: Some(portfolios_table(&[portfolio(json!({"uuid": "p", "name": "P"}))])),
            ..Default::default()
        };
        assert_eq!(apply_positions(&mut view, "p", &[], &[]), PatchOutcome::Deferred);
        assert_eq!(apply_positions(&mut view, "missing", &[], &[]), PatchOutcome::Deferred);

        view.set_expanded("p", true);
        let positions = normalize_positions(&json!([{
            "security_uuid": "s1", "name": "A", "current_holdings": 1,
            "purchase_value": 10, "current_value": 12
        }]));
        assert_eq!(
            apply_positions(&mut view, "p", &positions, &[]),
            PatchOutcome::Applied(vec![])
        );

        let mut moved = positions.clone();
        moved[0].current_value = 15.0;
        let PatchOutcome::Applied(targets) = apply_positions(&mut view, "p", &moved, &positions) else {
            panic!("expected applied");
        };
        assert!(targets.iter().any(|t| matches!(t, FlashTarget::Cell { column, .. } if column == "current_value")));
        let table = view.table(&TableId::Positions("p".into())).unwrap();
        assert_eq!(table.footer.as_ref().unwrap().cell("current_value").unwrap().inner_html, "15,00 €");
    }

    #[test]
    fn test_toggle_sort_flips_direction() {
        let mut table = portfolios_table(&[
            portfolio(json!({"uuid": "a", "name": "beta", "current_value": 1})),
            portfolio(json!({"uuid": "b", "name": "Alpha", "current_value": null})),
        ]);
        assert_eq!(row_keys(&table, "portfolio"), vec!["a", "b"]);
        assert_eq!(toggle_sort(&mut table, "name"), SortDir::Asc);
        assert_eq!(row_keys(&table, "portfolio"), vec!["b", "a"]);
        assert_eq!(toggle_sort(&mut table, "name"), SortDir::Desc);
        assert_eq!(row_keys(&table, "portfolio"), vec!["a", "b"]);
        toggle_sort(&mut table, "current_value");
        assert_eq!(row_keys(&table, "portfolio"), vec!["a", "b"]);
    }

    #[test]
    fn test_total_wealth_flash() {
        let mut view = DashboardView::default();
        assert_eq!(update_total_wealth(&mut view, 100.0), None);
        assert_eq!(update_total_wealth(&mut view, 100.0), None);
        assert_eq!(update_total_wealth(&mut view, 120.0), Some(FlashTarget::TotalWealth));
        assert_eq!(view.header.data.data("total_wealth"), Some("120"));
    }
}

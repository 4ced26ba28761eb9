//! Retained view tree.
//!
//! The dashboard keeps the rendered markup as a small tree of tables, rows
//! and cells so that updates can be applied to individual cells without
//! rebuilding the page. Every node serializes to the HTML it represents.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::format::{escape_html, format_currency};

pub const FLASH_CLASS: &str = "flash-update";
pub const COLLAPSED_CLASS: &str = "collapsed";
/// Tail of the portfolio toggle button in either state.
pub const TOGGLE_COLLAPSED: &str = r#"aria-expanded="false">▶</button>"#;
pub const TOGGLE_EXPANDED: &str = r#"aria-expanded="true">▼</button>"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Align {
    #[default]
    Left,
    Right,
}

impl Align {
    fn class(self) -> &'static str {
        match self {
            Align::Left => "align-left",
            Align::Right => "align-right",
        }
    }
}

/// Id, classes and `data-*` attributes of an element. Dataset keys are
/// stored in snake case and written as kebab-case attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementData {
    pub id: Option<String>,
    classes: Vec<String>,
    dataset: BTreeMap<String, String>,
}

impl ElementData {
    pub fn with_class(class: &str) -> Self {
        let mut data = Self::default();
        data.add_class(class);
        data
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn add_class(&mut self, class: &str) {
        if !self.has_class(class) {
            self.classes.push(class.to_string());
        }
    }

    pub fn remove_class(&mut self, class: &str) -> bool {
        let before = self.classes.len();
        self.classes.retain(|c| c != class);
        before != self.classes.len()
    }

    pub fn data(&self, key: &str) -> Option<&str> {
        self.dataset.get(key).map(String::as_str)
    }

    pub fn set_data(&mut self, key: &str, value: impl Into<String>) {
        self.dataset.insert(key.to_string(), value.into());
    }

    pub fn remove_data(&mut self, key: &str) {
        self.dataset.remove(key);
    }

    pub fn attrs_html(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            let _ = write!(out, r#" id="{}""#, escape_html(id));
        }
        if !self.classes.is_empty() {
            let _ = write!(out, r#" class="{}""#, escape_html(&self.classes.join(" ")));
        }
        for (key, value) in &self.dataset {
            let _ = write!(
                out,
                r#" data-{}="{}""#,
                key.replace('_', "-"),
                escape_html(value)
            );
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCell {
    pub key: String,
    pub label: String,
    pub data: ElementData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub column: String,
    pub data: ElementData,
    pub inner_html: String,
}

impl Cell {
    pub fn new(column: &str, align: Align, inner_html: String) -> Self {
        let mut data = ElementData::with_class(align.class());
        data.set_data("column", column);
        Self {
            column: column.to_string(),
            data,
            inner_html,
        }
    }

    fn to_html(&self) -> String {
        format!("<td{}>{}</td>", self.data.attrs_html(), self.inner_html)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerContent {
    Empty,
    Loading,
    Table(Box<Table>),
    Error { message: String },
}

/// The positions area inside a portfolio's detail row.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionsContainer {
    pub data: ElementData,
    pub content: ContainerContent,
}

impl PositionsContainer {
    pub fn new(portfolio_uuid: &str) -> Self {
        let mut data = ElementData::with_class("positions-container");
        data.set_data("portfolio", portfolio_uuid);
        Self {
            data,
            content: ContainerContent::Empty,
        }
    }

    pub fn table(&self) -> Option<&Table> {
        match &self.content {
            ContainerContent::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn table_mut(&mut self) -> Option<&mut Table> {
        match &mut self.content {
            ContainerContent::Table(table) => Some(table),
            _ => None,
        }
    }

    fn to_html(&self) -> String {
        let inner = match &self.content {
            ContainerContent::Empty => String::new(),
            ContainerContent::Loading => r#"<div class="loading">Lade Positionen...</div>"#.to_string(),
            ContainerContent::Table(table) => table.to_html(),
            ContainerContent::Error { message } => {
                let portfolio = self.data.data("portfolio").unwrap_or_default();
                format!(
                    r#"<div class="error" role="alert">{}<button class="retry-pos" data-portfolio="{}">Erneut laden</button></div>"#,
                    escape_html(message),
                    escape_html(portfolio)
                )
            }
        };
        format!("<div{}>{}</div>", self.data.attrs_html(), inner)
    }
}

/// Hidden-until-expanded row following a portfolio row.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRow {
    pub data: ElementData,
    pub colspan: usize,
    pub container: PositionsContainer,
}

impl DetailRow {
    pub fn new(portfolio_uuid: &str, colspan: usize) -> Self {
        let mut data = ElementData::with_class("portfolio-details");
        data.add_class(COLLAPSED_CLASS);
        data.set_data("portfolio", portfolio_uuid);
        Self {
            data,
            colspan,
            container: PositionsContainer::new(portfolio_uuid),
        }
    }

    pub fn is_expanded(&self) -> bool {
        !self.data.has_class(COLLAPSED_CLASS)
    }

    pub fn set_expanded(&mut self, expanded: bool) {
        if expanded {
            self.data.remove_class(COLLAPSED_CLASS);
        } else {
            self.data.add_class(COLLAPSED_CLASS);
        }
    }

    fn to_html(&self) -> String {
        format!(
            r#"<tr{}><td colspan="{}">{}</td></tr>"#,
            self.data.attrs_html(),
            self.colspan,
            self.container.to_html()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub data: ElementData,
    pub cells: Vec<Cell>,
    pub detail: Option<DetailRow>,
}

impl Row {
    pub fn cell(&self, column: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.column == column)
    }

    pub fn cell_mut(&mut self, column: &str) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| c.column == column)
    }

    /// Opens or closes the detail row and updates the toggle button.
    pub fn set_expanded(&mut self, expanded: bool) -> bool {
        let Some(detail) = self.detail.as_mut() else {
            return false;
        };
        detail.set_expanded(expanded);
        self.sync_toggle();
        true
    }

    /// Rewrites the toggle button's `aria-expanded` from the detail row,
    /// e.g. after the name cell was re-rendered.
    pub fn sync_toggle(&mut self) {
        let Some(expanded) = self.detail.as_ref().map(DetailRow::is_expanded) else {
            return;
        };
        let (from, to) = if expanded {
            (TOGGLE_COLLAPSED, TOGGLE_EXPANDED)
        } else {
            (TOGGLE_EXPANDED, TOGGLE_COLLAPSED)
        };
        if let Some(cell) = self.cell_mut("name") {
            if cell.inner_html.contains(from) {
                cell.inner_html = cell.inner_html.replacen(from, to, 1);
            }
        }
    }

    fn to_html(&self) -> String {
        let mut out = format!("<tr{}>", self.data.attrs_html());
        for cell in &self.cells {
            out.push_str(&cell.to_html());
        }
        out.push_str("</tr>");
        if let Some(detail) = &self.detail {
            out.push_str(&detail.to_html());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub data: ElementData,
    pub header: Vec<HeaderCell>,
    pub rows: Vec<Row>,
    pub footer: Option<Row>,
}

impl Table {
    pub fn column_keys(&self) -> Vec<&str> {
        self.header.iter().map(|h| h.key.as_str()).collect()
    }

    /// Finds a body row by one of its `data-*` attributes.
    pub fn row_by(&self, key: &str, value: &str) -> Option<&Row> {
        self.rows.iter().find(|r| r.data.data(key) == Some(value))
    }

    pub fn row_by_mut(&mut self, key: &str, value: &str) -> Option<&mut Row> {
        self.rows.iter_mut().find(|r| r.data.data(key) == Some(value))
    }

    pub fn to_html(&self) -> String {
        let mut out = format!("<table{}><thead><tr>", self.data.attrs_html());
        for header in &self.header {
            let _ = write!(out, "<th{}>{}</th>", header.data.attrs_html(), escape_html(&header.label));
        }
        out.push_str("</tr></thead><tbody>");
        for row in &self.rows {
            out.push_str(&row.to_html());
        }
        out.push_str("</tbody>");
        if let Some(footer) = &self.footer {
            let _ = write!(out, "<tfoot>{}</tfoot>", footer.to_html());
        }
        out.push_str("</table>");
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderCard {
    pub data: ElementData,
    pub total_wealth: Option<f64>,
    pub last_file_update: Option<String>,
}

impl HeaderCard {
    fn to_html(&self) -> String {
        let wealth = self
            .total_wealth
            .map(format_currency)
            .unwrap_or_else(|| crate::format::missing_value_markup(None));
        let updated = self
            .last_file_update
            .as_deref()
            .map(escape_html)
            .unwrap_or_else(|| "–".to_string());
        format!(
            r#"<div{}><h2>Übersicht</h2><div class="total-wealth">Gesamtvermögen: <strong>{}</strong></div><div class="last-file-update">Letzte Aktualisierung: {}</div></div>"#,
            self.data.attrs_html(),
            wealth,
            updated
        )
    }
}

/// Identifies a table inside the view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableId {
    Accounts,
    FxAccounts,
    Portfolios,
    Positions(String),
}

/// Identifies an element that can carry the flash class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlashTarget {
    Cell {
        table: TableId,
        row_key: String,
        column: String,
    },
    TotalWealth,
}

/// The rendered overview page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardView {
    pub header: HeaderCard,
    pub accounts: Option<Table>,
    pub fx_accounts: Option<Table>,
    pub portfolios: Option<Table>,
}

/// Dataset key that identifies rows of a table.
pub fn row_key_attr(table: &TableId) -> &'static str {
    match table {
        TableId::Accounts | TableId::FxAccounts => "account",
        TableId::Portfolios => "portfolio",
        TableId::Positions(_) => "security",
    }
}

impl DashboardView {
    pub fn table(&self, id: &TableId) -> Option<&Table> {
        match id {
            TableId::Accounts => self.accounts.as_ref(),
            TableId::FxAccounts => self.fx_accounts.as_ref(),
            TableId::Portfolios => self.portfolios.as_ref(),
            TableId::Positions(uuid) => self.detail_row(uuid)?.container.table(),
        }
    }

    pub fn table_mut(&mut self, id: &TableId) -> Option<&mut Table> {
        match id {
            TableId::Accounts => self.accounts.as_mut(),
            TableId::FxAccounts => self.fx_accounts.as_mut(),
            TableId::Portfolios => self.portfolios.as_mut(),
            TableId::Positions(uuid) => self.detail_row_mut(uuid)?.container.table_mut(),
        }
    }

    pub fn detail_row(&self, portfolio_uuid: &str) -> Option<&DetailRow> {
        self.portfolios
            .as_ref()?
            .row_by("portfolio", portfolio_uuid)?
            .detail
            .as_ref()
    }

    pub fn detail_row_mut(&mut self, portfolio_uuid: &str) -> Option<&mut DetailRow> {
        self.portfolios
            .as_mut()?
            .row_by_mut("portfolio", portfolio_uuid)?
            .detail
            .as_mut()
    }

    pub fn is_expanded(&self, portfolio_uuid: &str) -> bool {
        self.detail_row(portfolio_uuid)
            .is_some_and(DetailRow::is_expanded)
    }

    pub fn set_expanded(&mut self, portfolio_uuid: &str, expanded: bool) -> bool {
        self.portfolios
            .as_mut()
            .and_then(|table| table.row_by_mut("portfolio", portfolio_uuid))
            .is_some_and(|row| row.set_expanded(expanded))
    }

    /// Applies `f` to the element behind a flash target, if it still exists.
    pub fn with_flash_target(&mut self, target: &FlashTarget, f: impl FnOnce(&mut ElementData)) -> bool {
        match target {
            FlashTarget::TotalWealth => {
                f(&mut self.header.data);
                true
            }
            FlashTarget::Cell {
                table,
                row_key,
                column,
            } => {
                let attr = row_key_attr(table);
                let cell = self
                    .table_mut(table)
                    .and_then(|t| t.row_by_mut(attr, row_key))
                    .and_then(|r| r.cell_mut(column));
                match cell {
                    Some(cell) => {
                        f(&mut cell.data);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    pub fn to_html(&self) -> String {
        let mut out = String::from(r#"<div class="pp-reader-dashboard">"#);
        out.push_str(&self.header.to_html());
        let sections = [
            ("Liquidität", &self.accounts),
            ("Fremdwährungskonten", &self.fx_accounts),
            ("Investment", &self.portfolios),
        ];
        for (title, table) in sections {
            if let Some(table) = table {
                let _ = write!(
                    out,
                    r#"<div class="card"><h3>{}</h3><div class="scroll-container">{}</div></div>"#,
                    title,
                    table.to_html()
                );
            }
        }
        out.push_str("</div>");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_attrs() {
        let mut data = ElementData::with_class("row");
        data.id = Some("x".into());
        data.set_data("current_value", "1.5");
        data.add_class("row");
        assert_eq!(data.attrs_html(), r#" id="x" class="row" data-current-value="1.5""#);
        assert!(data.remove_class("row"));
        assert!(!data.remove_class("row"));
    }

    #[test]
    fn test_detail_row_toggle_and_lookup() {
        let mut row = Row::default();
        row.data.set_data("portfolio", "p1");
        row.detail = Some(DetailRow::new("p1", 4));
        let mut view = DashboardView {
            portfolios: Some(Table {
                rows: vec![row],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!view.is_expanded("p1"));
        view.detail_row_mut("p1").unwrap().set_expanded(true);
        assert!(view.is_expanded("p1"));
        assert!(view.table(&TableId::Positions("p1".into())).is_none());
        assert!(view.to_html().contains(r#"class="portfolio-details""#));
    }

    #[test]
    fn test_toggle_button_follows_expansion() {
        let mut row = Row::default();
        row.data.set_data("portfolio", "p1");
        row.cells.push(Cell::new(
            "name",
            Align::Left,
            format!(r#"<button class="portfolio-toggle" {TOGGLE_COLLAPSED}Depot"#),
        ));
        row.detail = Some(DetailRow::new("p1", 4));
        let mut view = DashboardView {
            portfolios: Some(Table {
                rows: vec![row],
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(view.set_expanded("p1", true));
        assert!(view.is_expanded("p1"));
        assert!(view.to_html().contains(r#"aria-expanded="true""#));
        assert!(view.set_expanded("p1", false));
        let html = view.to_html();
        assert!(html.contains(r#"aria-expanded="false""#));
        assert!(!html.contains(r#"aria-expanded="true""#));
        assert!(!view.set_expanded("missing", true));
    }

    #[test]
    fn test_error_container_has_retry() {
        let mut container = PositionsContainer::new("p1");
        container.content = ContainerContent::Error {
            message: "boom <x>".into(),
        };
        let html = container.to_html();
        assert!(html.contains("boom &lt;x&gt;"));
        assert!(html.contains(r#"class="retry-pos" data-portfolio="p1""#));
    }
}

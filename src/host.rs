//! The dashboard element.
//!
//! [`DashboardHost`] owns the stores, the rendered view and the timer queue.
//! It fetches snapshots through a [`Transport`], applies bus updates and
//! hands updates for hidden sections to the pending queue. Errors of a fetch
//! are caught here and shown inline; nothing below this layer fails loudly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::ViewCaches;
use crate::chunks::ChunkReassembler;
use crate::config::DashboardSettings;
use crate::diagnostics::DiagnosticsTracker;
use crate::dom::{DashboardView, FlashTarget, HeaderCard, FLASH_CLASS};
use crate::error::{describe_error, DashboardError};
use crate::events::{DashboardEvent, EventDispatcher};
use crate::format::escape_html;
use crate::model::{PortfolioRecord, PositionRecord, RecordPatch};
use crate::nav::{security_page_id, PageKind, TabRegistry};
use crate::normalize::{
    extract_metric_metadata, list_items, normalize_accounts, normalize_portfolio_patches,
    normalize_portfolios, normalize_position_patches,
};
use crate::patch::{
    apply_current_sort, apply_positions, patch_accounts, patch_portfolios,
    render_positions_error, render_positions_loading, toggle_sort, update_last_file_update,
    update_total_wealth, PatchOutcome,
};
use crate::pending::{PendingQueue, RetryDecision};
use crate::render::{accounts_table, fx_accounts_table, portfolios_table, SortDir};
use crate::security::{
    chart_id, fill_news_prompt, map_security_snapshot, normalize_history, normalize_transactions,
    render_security_detail, HistoryRange, SecurityDetailStore,
};
use crate::timers::{TimerQueue, TimerTask};
use crate::transport::{
    last_file_update_value, parse_bus_payload, positions_error, require_param, resolve_entry_id,
    BusDataType, PositionsMessage, Request, RequestKind, Transport,
};

/// Positions (or an error) waiting for a collapsed portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPositions {
    pub positions: Vec<PositionRecord>,
    pub error: Option<String>,
}

/// Every store the host mutates, injected so tests can use fresh ones.
#[derive(Debug, Default)]
pub struct DashboardStores {
    pub caches: ViewCaches,
    pub chunks: ChunkReassembler<RecordPatch>,
    pub pending: PendingQueue<PendingPositions>,
    pub diagnostics: DiagnosticsTracker,
    pub security: SecurityDetailStore,
}

impl DashboardStores {
    pub fn new(settings: &DashboardSettings, dispatcher: EventDispatcher) -> Self {
        Self {
            caches: ViewCaches::default(),
            chunks: ChunkReassembler::new(),
            pending: PendingQueue::new(settings),
            diagnostics: DiagnosticsTracker::new(dispatcher),
            security: SecurityDetailStore::new(),
        }
    }

    pub fn clear_all(&mut self) {
        self.caches.clear_all();
        self.chunks.clear_all();
        self.pending.clear();
        self.diagnostics.clear();
        self.security.clear();
    }
}

/// Monotonic render counter of one view root. Async work captures the value
/// before awaiting and drops its result when a newer render bumped it.
#[derive(Debug, Clone, Default)]
pub struct AttachToken(Arc<AtomicU64>);

impl AttachToken {
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.current() == token
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered,
    /// A newer render started while this one was waiting for data.
    Stale,
}

pub struct DashboardHost<T: Transport> {
    transport: T,
    settings: DashboardSettings,
    stores: DashboardStores,
    dispatcher: EventDispatcher,
    events: broadcast::Receiver<DashboardEvent>,
    hass: Option<Value>,
    panel: Option<Value>,
    narrow: bool,
    route: Option<Value>,
    view: Option<DashboardView>,
    error: Option<String>,
    security_errors: HashMap<String, String>,
    timers: TimerQueue,
    attach: AttachToken,
    detail_tokens: HashMap<String, AttachToken>,
    tabs: TabRegistry,
    initialized: bool,
    /// Counts completed renders of the overview.
    renders: watch::Sender<u64>,
}

impl<T: Transport> DashboardHost<T> {
    pub fn new(transport: T, settings: DashboardSettings) -> Self {
        let dispatcher = EventDispatcher::default();
        let stores = DashboardStores::new(&settings, dispatcher.clone());
        Self::with_stores(transport, settings, stores, dispatcher)
    }

    pub fn with_stores(
        transport: T,
        settings: DashboardSettings,
        stores: DashboardStores,
        dispatcher: EventDispatcher,
    ) -> Self {
        let events = dispatcher.subscribe();
        Self {
            transport,
            settings,
            stores,
            dispatcher,
            events,
            hass: None,
            panel: None,
            narrow: false,
            route: None,
            view: None,
            error: None,
            security_errors: HashMap::new(),
            timers: TimerQueue::new(),
            attach: AttachToken::default(),
            detail_tokens: HashMap::new(),
            tabs: TabRegistry::new(),
            initialized: false,
            renders: watch::Sender::new(0),
        }
    }

    pub fn set_hass(&mut self, hass: Value) {
        self.hass = Some(hass);
    }

    pub fn set_panel(&mut self, panel: Value) {
        self.panel = Some(panel);
    }

    pub fn set_narrow(&mut self, narrow: bool) {
        self.narrow = narrow;
    }

    pub fn set_route(&mut self, route: Value) {
        self.route = Some(route);
    }

    pub fn narrow(&self) -> bool {
        self.narrow
    }

    pub fn route(&self) -> Option<&Value> {
        self.route.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn view(&self) -> Option<&DashboardView> {
        self.view.as_ref()
    }

    pub fn stores(&self) -> &DashboardStores {
        &self.stores
    }

    pub fn tabs(&self) -> &TabRegistry {
        &self.tabs
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn attach_token(&self) -> AttachToken {
        self.attach.clone()
    }

    /// Render generation, bumped after every completed overview render.
    /// Pair with [`crate::timers::wait_for`] to wait for the tables.
    pub fn watch_renders(&self) -> watch::Receiver<u64> {
        self.renders.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.dispatcher.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn entry_id(&self) -> Result<String, DashboardError> {
        let hass = self.hass.as_ref().ok_or(DashboardError::MissingHass)?;
        resolve_entry_id(self.panel.as_ref(), Some(hass)).ok_or(DashboardError::MissingEntryId)
    }

    async fn request(&self, request: Request) -> Result<Value, DashboardError> {
        debug!(request = request.kind.as_str(), "backend request");
        Ok(self.transport.call(request).await?)
    }

    pub async fn fetch_accounts(&self) -> Result<Value, DashboardError> {
        let entry_id = self.entry_id()?;
        self.request(Request::new(RequestKind::Accounts, &entry_id)).await
    }

    pub async fn fetch_portfolios(&self) -> Result<Value, DashboardError> {
        let entry_id = self.entry_id()?;
        self.request(Request::new(RequestKind::Portfolios, &entry_id)).await
    }

    pub async fn fetch_last_file_update(&self) -> Result<Value, DashboardError> {
        let entry_id = self.entry_id()?;
        self.request(Request::new(RequestKind::LastFileUpdate, &entry_id)).await
    }

    pub async fn fetch_positions(&self, portfolio_uuid: &str) -> Result<Value, DashboardError> {
        let entry_id = self.entry_id()?;
        let uuid = require_param("portfolio_uuid", portfolio_uuid)?;
        self.request(Request::new(RequestKind::PortfolioPositions, &entry_id).param("portfolio_uuid", uuid))
            .await
    }

    pub async fn fetch_security_snapshot(&self, security_uuid: &str) -> Result<Value, DashboardError> {
        let entry_id = self.entry_id()?;
        let uuid = require_param("security_uuid", security_uuid)?;
        self.request(Request::new(RequestKind::SecuritySnapshot, &entry_id).param("security_uuid", uuid))
            .await
    }

    pub async fn fetch_security_history(
        &self,
        security_uuid: &str,
        range: HistoryRange,
    ) -> Result<Value, DashboardError> {
        let entry_id = self.entry_id()?;
        let uuid = require_param("security_uuid", security_uuid)?;
        let today = chrono::Local::now().date_naive();
        let mut request = Request::new(RequestKind::SecurityHistory, &entry_id)
            .param("security_uuid", uuid)
            .param("end_date", today.format("%Y-%m-%d").to_string());
        if let Some(start) = range.start_date(today) {
            request = request.param("start_date", start.format("%Y-%m-%d").to_string());
        }
        self.request(request).await
    }

    pub async fn fetch_news_prompt(&self) -> Result<Value, DashboardError> {
        let entry_id = self.entry_id()?;
        self.request(Request::new(RequestKind::NewsPrompt, &entry_id)).await
    }

    /// Fetches the full snapshot and rebuilds the overview. Expanded
    /// portfolios and the active sort of the previous view are kept.
    pub async fn render(&mut self) -> Result<RenderOutcome, DashboardError> {
        let token = self.attach.bump();
        let (accounts, portfolios, last_file_update) = futures::try_join!(
            self.fetch_accounts(),
            self.fetch_portfolios(),
            self.fetch_last_file_update(),
        )?;
        if !self.attach.is_current(token) {
            debug!(token, "render superseded, dropping snapshot");
            return Ok(RenderOutcome::Stale);
        }

        self.track_metadata("account", "accounts", &accounts, "accounts");
        self.track_metadata("portfolio", "portfolios", &portfolios, "portfolios");
        let snapshot = &mut self.stores.caches.snapshot;
        snapshot.replace_accounts(normalize_accounts(&accounts));
        snapshot.replace_portfolios(normalize_portfolios(&portfolios));
        snapshot.set_last_file_update(last_file_update_value(&last_file_update));

        self.rebuild_view();
        self.initialized = true;
        self.error = None;
        self.renders.send_modify(|generation| *generation += 1);
        info!(
            accounts = self.stores.caches.snapshot.accounts().len(),
            portfolios = self.stores.caches.snapshot.portfolios().len(),
            "dashboard rendered"
        );
        Ok(RenderOutcome::Rendered)
    }

    fn rebuild_view(&mut self) {
        let previous = self.view.take();
        let snapshot = &self.stores.caches.snapshot;
        let (fx, eur): (Vec<_>, Vec<_>) = snapshot
            .accounts()
            .iter()
            .partition(|a| a.is_foreign_currency());

        let mut portfolios = portfolios_table(snapshot.portfolios());
        let (key, dir) = self.settings.default_sort();
        portfolios.data.set_data("default_sort", key);
        portfolios.data.set_data("default_dir", dir.as_str());
        if let Some(old) = previous.as_ref().and_then(|v| v.portfolios.as_ref()) {
            for attr in ["sort_key", "sort_dir"] {
                if let Some(value) = old.data.data(attr) {
                    portfolios.data.set_data(attr, value);
                }
            }
        }
        apply_current_sort(&mut portfolios);

        let mut header = HeaderCard {
            total_wealth: Some(snapshot.total_wealth()),
            last_file_update: snapshot.last_file_update().map(str::to_string),
            ..Default::default()
        };
        header.data.add_class("header-card");
        header.data.set_data("total_wealth", snapshot.total_wealth().to_string());

        let mut view = DashboardView {
            header,
            accounts: Some(accounts_table(&eur)),
            fx_accounts: (!fx.is_empty()).then(|| fx_accounts_table(&fx)),
            portfolios: Some(portfolios),
        };

        let expanded: Vec<String> = previous
            .as_ref()
            .and_then(|v| v.portfolios.as_ref())
            .map(|table| {
                table
                    .rows
                    .iter()
                    .filter(|row| row.detail.as_ref().is_some_and(|d| d.is_expanded()))
                    .filter_map(|row| row.data.data("portfolio").map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        for uuid in expanded {
            if !self.stores.caches.positions.has_portfolio_positions(&uuid) {
                continue;
            }
            view.set_expanded(&uuid, true);
            let positions = self.stores.caches.positions.get_portfolio_positions(&uuid);
            apply_positions(&mut view, &uuid, &positions, &[]);
        }
        self.view = Some(view);
    }

    pub async fn render_if_initialized(&mut self) -> Result<Option<RenderOutcome>, DashboardError> {
        if !self.initialized {
            return Ok(None);
        }
        self.render().await.map(Some)
    }

    /// Called by the tab host when the overview becomes visible again.
    /// Failures end up as an inline error, never as a panic.
    pub async fn handle_external_render(&mut self) {
        match self.render().await {
            Ok(RenderOutcome::Rendered) => {}
            Ok(RenderOutcome::Stale) => return,
            Err(err) => {
                warn!(error = %err, "dashboard render failed");
                self.error = Some(describe_error(&err));
                return;
            }
        }

        if !self.view.as_ref().is_some_and(|v| v.portfolios.is_some()) {
            warn!("portfolio table missing after render, pending updates stay queued");
            return;
        }
        for uuid in self.stores.pending.keys() {
            self.flush_pending(&uuid);
        }
    }

    pub fn remember_scroll_position(&mut self, position: f64) {
        let page = self.tabs.current().id.clone();
        self.tabs.remember_scroll_position(&page, position);
    }

    pub fn scroll_position(&self) -> f64 {
        self.tabs.scroll_position(&self.tabs.current().id)
    }

    fn track_metadata(&mut self, kind: &str, source: &str, raw: &Value, list_key: &str) {
        for item in list_items(raw, list_key) {
            let Some(uuid) = item
                .get("uuid")
                .or_else(|| item.get(&format!("{kind}_uuid")))
                .and_then(Value::as_str)
            else {
                continue;
            };
            self.stores
                .diagnostics
                .track(kind, source, uuid, extract_metric_metadata(item));
        }
    }

    fn schedule_flashes(&mut self, targets: Vec<FlashTarget>) {
        for target in targets {
            self.timers
                .schedule(self.settings.flash_duration(), TimerTask::RemoveFlash(target));
        }
    }

    fn refresh_total_wealth(&mut self) {
        let total = self.stores.caches.snapshot.total_wealth();
        if let Some(target) = self.view.as_mut().and_then(|v| update_total_wealth(v, total)) {
            self.schedule_flashes(vec![target]);
        }
    }

    /// Applies one bus event. Envelopes for another entry or with an unknown
    /// data type are ignored.
    pub fn handle_bus_event(&mut self, payload: &Value) {
        let active = self.entry_id().ok();
        for envelope in parse_bus_payload(payload) {
            if envelope.entry_id.is_none() || envelope.entry_id != active {
                debug!(entry_id = ?envelope.entry_id, "ignoring bus event for another entry");
                continue;
            }
            let Some(kind) = BusDataType::parse(&envelope.data_type) else {
                debug!(data_type = %envelope.data_type, "ignoring unknown bus data type");
                continue;
            };
            match kind {
                BusDataType::Accounts => self.apply_accounts_update(&envelope.data),
                BusDataType::LastFileUpdate => {
                    let value = last_file_update_value(&envelope.data);
                    if let Some(view) = self.view.as_mut() {
                        update_last_file_update(view, value.as_deref());
                    }
                    self.stores.caches.snapshot.set_last_file_update(value);
                }
                BusDataType::PortfolioValues => self.apply_portfolio_values(&envelope.data),
                BusDataType::PortfolioPositions => self.apply_positions_message(&envelope.data),
            }
        }
        self.drain_events();
    }

    fn apply_accounts_update(&mut self, data: &Value) {
        self.track_metadata("account", "accounts", data, "accounts");
        let previous = self.stores.caches.snapshot.accounts().to_vec();
        let accounts = normalize_accounts(data);
        let targets = match self.view.as_mut() {
            Some(view) => patch_accounts(view, &accounts, &previous),
            None => Vec::new(),
        };
        self.stores.caches.snapshot.replace_accounts(accounts);
        self.schedule_flashes(targets);
        self.refresh_total_wealth();
    }

    fn apply_portfolio_values(&mut self, data: &Value) {
        self.track_metadata("portfolio", "portfolio_values", data, "portfolios");
        let previous: HashMap<String, PortfolioRecord> = self
            .stores
            .caches
            .snapshot
            .portfolios()
            .iter()
            .map(|p| (p.uuid.clone(), p.clone()))
            .collect();
        let patches = normalize_portfolio_patches(data);
        let merged = self.stores.caches.snapshot.merge_portfolios(&patches);
        let targets = match self.view.as_mut() {
            Some(view) => patch_portfolios(view, &merged, &previous),
            None => Vec::new(),
        };
        self.schedule_flashes(targets);
        self.refresh_total_wealth();
    }

    fn apply_positions_message(&mut self, data: &Value) {
        let Some(message) = PositionsMessage::parse(data) else {
            debug!("positions update without portfolio_uuid");
            return;
        };
        let uuid = message.portfolio_uuid;
        if let Some(error) = message.error {
            self.stores.chunks.clear(&uuid);
            self.show_positions_error(&uuid, error);
            return;
        }
        let patches = normalize_position_patches(&message.positions);
        let Some(patches) =
            self.stores
                .chunks
                .submit(&uuid, message.chunk_index, message.chunk_count, patches)
        else {
            debug!(portfolio = %uuid, "waiting for more position chunks");
            return;
        };
        self.store_positions(&uuid, &patches);
    }

    /// Caches positions, announces the update and shows it or queues it.
    fn store_positions(&mut self, portfolio_uuid: &str, patches: &[RecordPatch]) {
        for patch in patches {
            if let Some(security) = patch.str_field("security_uuid") {
                let raw = patch.clone().into_value();
                self.stores.diagnostics.track(
                    "position",
                    "portfolio_positions",
                    security,
                    extract_metric_metadata(&raw),
                );
            }
        }
        let positions = &mut self.stores.caches.positions;
        let previous = positions.get_portfolio_positions(portfolio_uuid);
        let current = positions.set_portfolio_positions(portfolio_uuid, patches);

        self.dispatcher.dispatch(DashboardEvent::PortfolioPositionsUpdated {
            portfolio_uuid: portfolio_uuid.to_string(),
            security_uuids: current.iter().map(|p| p.security_uuid.clone()).collect(),
        });
        self.drain_events();

        let outcome = match self.view.as_mut() {
            Some(view) => apply_positions(view, portfolio_uuid, &current, &previous),
            None => PatchOutcome::Deferred,
        };
        match outcome {
            PatchOutcome::Applied(targets) => {
                self.stores.pending.take(portfolio_uuid);
                self.timers.cancel_retries(portfolio_uuid);
                self.schedule_flashes(targets);
            }
            PatchOutcome::Deferred => self.defer(
                portfolio_uuid,
                PendingPositions {
                    positions: current,
                    error: None,
                },
            ),
        }
    }

    fn show_positions_error(&mut self, portfolio_uuid: &str, message: String) {
        let visible = self
            .view
            .as_ref()
            .is_some_and(|v| v.is_expanded(portfolio_uuid));
        if visible {
            if let Some(view) = self.view.as_mut() {
                render_positions_error(view, portfolio_uuid, &message);
            }
            return;
        }
        self.defer(
            portfolio_uuid,
            PendingPositions {
                positions: Vec::new(),
                error: Some(message),
            },
        );
    }

    fn defer(&mut self, portfolio_uuid: &str, update: PendingPositions) {
        debug!(portfolio = portfolio_uuid, "positions section hidden, update queued");
        self.stores.pending.queue(portfolio_uuid, update);
        self.timers.cancel_retries(portfolio_uuid);
        self.timers.schedule(
            self.settings.pending_retry_delay(),
            TimerTask::RetryPending(portfolio_uuid.to_string()),
        );
    }

    /// Applies a queued update if its portfolio is expanded now.
    pub fn flush_pending(&mut self, portfolio_uuid: &str) -> bool {
        let Some(view) = self.view.as_mut() else {
            return false;
        };
        if !view.is_expanded(portfolio_uuid) {
            return false;
        }
        let Some(update) = self.stores.pending.take(portfolio_uuid) else {
            return false;
        };
        self.timers.cancel_retries(portfolio_uuid);
        match update.error {
            Some(message) => {
                render_positions_error(view, portfolio_uuid, &message);
            }
            None => {
                apply_positions(view, portfolio_uuid, &update.positions, &[]);
            }
        }
        debug!(portfolio = portfolio_uuid, "pending positions update flushed");
        true
    }

    fn retry_pending(&mut self, portfolio_uuid: &str) {
        if !self.stores.pending.contains(portfolio_uuid) || self.flush_pending(portfolio_uuid) {
            return;
        }
        if let RetryDecision::RetryAfter(delay) = self.stores.pending.record_failure(portfolio_uuid) {
            self.timers
                .schedule(delay, TimerTask::RetryPending(portfolio_uuid.to_string()));
        }
    }

    /// Expands or collapses a portfolio. The first expansion loads its
    /// positions; later ones show the cache or a queued update.
    pub async fn toggle_portfolio(&mut self, portfolio_uuid: &str) -> bool {
        let Some(view) = self.view.as_mut() else {
            return false;
        };
        let expand = !view.is_expanded(portfolio_uuid);
        if !view.set_expanded(portfolio_uuid, expand) {
            return false;
        }
        if !expand {
            return false;
        }

        if self.flush_pending(portfolio_uuid) {
            return true;
        }
        if self.stores.caches.positions.has_portfolio_positions(portfolio_uuid) {
            let positions = self.stores.caches.positions.get_portfolio_positions(portfolio_uuid);
            if let Some(view) = self.view.as_mut() {
                apply_positions(view, portfolio_uuid, &positions, &[]);
            }
            return true;
        }
        self.load_positions(portfolio_uuid).await;
        true
    }

    /// Re-runs the positions fetch after an inline error.
    pub async fn retry_positions(&mut self, portfolio_uuid: &str) {
        let expanded = self
            .view
            .as_ref()
            .is_some_and(|v| v.is_expanded(portfolio_uuid));
        if expanded {
            self.load_positions(portfolio_uuid).await;
        }
    }

    async fn load_positions(&mut self, portfolio_uuid: &str) {
        if let Some(view) = self.view.as_mut() {
            render_positions_loading(view, portfolio_uuid);
        }
        let token = self.attach.current();
        let result = self.fetch_positions(portfolio_uuid).await;
        if !self.attach.is_current(token) {
            debug!(portfolio = portfolio_uuid, "positions arrived for a superseded view");
            return;
        }
        match result {
            Ok(raw) => match positions_error(&raw) {
                Some(message) => {
                    self.stores.chunks.clear(portfolio_uuid);
                    let err = DashboardError::Backend(message);
                    self.show_positions_error(portfolio_uuid, describe_error(&err));
                }
                None => {
                    let list = raw.get("positions").unwrap_or(&raw);
                    let patches = normalize_position_patches(list);
                    self.store_positions(portfolio_uuid, &patches);
                }
            },
            Err(err) => {
                warn!(portfolio = portfolio_uuid, error = %err, "positions fetch failed");
                self.show_positions_error(portfolio_uuid, describe_error(&err));
            }
        }
    }

    pub fn sort_portfolios(&mut self, key: &str) -> Option<SortDir> {
        let table = self.view.as_mut()?.portfolios.as_mut()?;
        Some(toggle_sort(table, key))
    }

    /// Opens (or re-opens) the detail page of a security and loads its
    /// snapshot and default history range.
    pub async fn open_security(&mut self, security_uuid: &str) -> Result<(), DashboardError> {
        let token = self
            .detail_tokens
            .entry(security_uuid.to_string())
            .or_default()
            .clone();
        let ticket = token.bump();
        let result = self.load_security(security_uuid, ticket, &token).await;
        if let Err(err) = &result {
            warn!(security = security_uuid, error = %err, "security detail failed");
            self.security_errors
                .insert(security_uuid.to_string(), describe_error(err));
        }
        result
    }

    async fn load_security(
        &mut self,
        security_uuid: &str,
        ticket: u64,
        token: &AttachToken,
    ) -> Result<(), DashboardError> {
        let raw = self.fetch_security_snapshot(security_uuid).await?;
        if !token.is_current(ticket) {
            return Ok(());
        }
        let record = map_security_snapshot(&raw)?;
        self.tabs.register_security_tab(security_uuid, &record.name);
        self.stores.security.set_snapshot(record);
        self.security_errors.remove(security_uuid);
        self.stores
            .security
            .chart_state_mut(&chart_id(security_uuid))
            .security_uuid = security_uuid.to_string();
        let range = self
            .stores
            .security
            .chart_state(&chart_id(security_uuid))
            .map(|state| state.range)
            .unwrap_or_default();
        self.select_history_range(security_uuid, range).await
    }

    /// Switches the chart range, fetching history only when not cached.
    pub async fn select_history_range(
        &mut self,
        security_uuid: &str,
        range: HistoryRange,
    ) -> Result<(), DashboardError> {
        self.stores
            .security
            .chart_state_mut(&chart_id(security_uuid))
            .range = range;
        if self.stores.security.history(security_uuid, range).is_some() {
            return Ok(());
        }
        let raw = self.fetch_security_history(security_uuid, range).await?;
        self.stores.security.cache_history(
            security_uuid,
            range,
            normalize_history(&raw),
            normalize_transactions(&raw),
        );
        Ok(())
    }

    pub async fn news_prompt(&self, security_uuid: &str) -> Result<String, DashboardError> {
        let record = self
            .stores
            .security
            .snapshot(security_uuid)
            .ok_or(DashboardError::MissingParameter("security snapshot"))?;
        let raw = self.fetch_news_prompt().await?;
        let template = raw
            .get("prompt")
            .and_then(Value::as_str)
            .or_else(|| raw.as_str())
            .ok_or_else(|| DashboardError::Backend("news prompt template missing".to_string()))?;
        Ok(fill_news_prompt(
            template,
            record.ticker_symbol.as_deref(),
            &record.name,
        ))
    }

    pub fn next_page(&mut self) -> String {
        self.tabs.next_page().id.clone()
    }

    pub fn previous_page(&mut self) -> String {
        self.tabs.previous_page().id.clone()
    }

    pub fn close_security(&mut self, security_uuid: &str) {
        self.tabs.unregister_security_tab(security_uuid);
        self.stores.security.remove_chart(&chart_id(security_uuid));
        self.detail_tokens.remove(security_uuid);
        self.security_errors.remove(security_uuid);
    }

    /// Reloads the history of the open security page when a positions
    /// update dropped it. Returns whether a reload happened.
    pub async fn refresh_open_security(&mut self) -> Result<bool, DashboardError> {
        let PageKind::SecurityDetail { security_uuid } = &self.tabs.current().kind else {
            return Ok(false);
        };
        let security_uuid = security_uuid.clone();
        let range = self
            .stores
            .security
            .chart_state(&chart_id(&security_uuid))
            .map(|state| state.range)
            .unwrap_or_default();
        if self.stores.security.history(&security_uuid, range).is_some() {
            return Ok(false);
        }
        if let Err(err) = self.select_history_range(&security_uuid, range).await {
            warn!(security = %security_uuid, error = %err, "security history reload failed");
            self.security_errors
                .insert(security_uuid, describe_error(&err));
            return Err(err);
        }
        Ok(true)
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    for uuid in self.stores.security.handle_event(&event) {
                        if self.tabs.current().id == security_page_id(&uuid) {
                            info!(security = %uuid, "open security page history is stale");
                        }
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "dashboard event receiver lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// Runs every timer due at `now`.
    pub fn process_timers(&mut self, now: Instant) {
        for task in self.timers.pop_due(now) {
            match task {
                TimerTask::RemoveFlash(target) => {
                    if let Some(view) = self.view.as_mut() {
                        view.with_flash_target(&target, |data| {
                            data.remove_class(FLASH_CLASS);
                        });
                    }
                }
                TimerTask::RetryPending(uuid) => self.retry_pending(&uuid),
            }
        }
    }

    /// Sleeps through the timer queue until it is empty.
    pub async fn run_timers(&mut self) {
        while let Some(deadline) = self.timers.next_deadline() {
            tokio::time::sleep_until(deadline).await;
            self.process_timers(Instant::now());
        }
    }

    /// Markup of the current page.
    pub fn to_html(&self) -> String {
        match &self.tabs.current().kind {
            PageKind::Overview => match (&self.error, &self.view) {
                (Some(error), _) => format!(
                    r#"<div class="card error" role="alert">{}</div>"#,
                    escape_html(error)
                ),
                (None, Some(view)) => view.to_html(),
                (None, None) => r#"<div class="loading">Lade Dashboard...</div>"#.to_string(),
            },
            PageKind::SecurityDetail { security_uuid } => self.security_html(security_uuid),
        }
    }

    pub fn security_html(&self, security_uuid: &str) -> String {
        if let Some(error) = self.security_errors.get(security_uuid) {
            return format!(
                r#"<div class="card error" role="alert">{}</div>"#,
                escape_html(error)
            );
        }
        let Some(record) = self.stores.security.snapshot(security_uuid) else {
            return r#"<div class="loading">Lade Wertpapier...</div>"#.to_string();
        };
        let range = self
            .stores
            .security
            .chart_state(&chart_id(security_uuid))
            .map(|s| s.range)
            .unwrap_or_default();
        let store = &self.stores.security;
        let history = store
            .history(security_uuid, range)
            .map(|points| (points, store.markers(security_uuid, range).unwrap_or_default()));
        render_security_detail(record, range, history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::FixtureTransport;
    use serde_json::json;
    use std::time::Duration;

    fn hass() -> Value {
        json!({"panels": {"pp": {"config": {"_panel_custom": {
            "name": "pp-reader-panel", "config": {"entry_id": "e1"}
        }}}}})
    }

    fn transport() -> FixtureTransport {
        let mut transport = FixtureTransport::new();
        transport.respond(
            RequestKind::Accounts,
            None,
            json!({"accounts": [{"uuid": "a1", "name": "Giro", "balance": 100}]}),
        );
        transport.respond(
            RequestKind::Portfolios,
            None,
            json!({"portfolios": [
                {"uuid": "p1", "name": "Depot", "position_count": 1, "current_value": 50, "purchase_sum": 40}
            ]}),
        );
        transport.respond(RequestKind::LastFileUpdate, None, json!("2024-05-01 10:00"));
        transport
    }

    fn position(uuid: &str, value: f64) -> Value {
        json!({
            "security_uuid": uuid, "name": uuid, "current_holdings": 1,
            "purchase_value": 10, "current_value": value
        })
    }

    async fn rendered(transport: FixtureTransport) -> DashboardHost<FixtureTransport> {
        let mut host = DashboardHost::new(transport, DashboardSettings::default());
        host.set_hass(hass());
        assert_eq!(host.render().await.unwrap(), RenderOutcome::Rendered);
        host
    }

    #[tokio::test]
    async fn test_fetch_requires_hass_and_entry() {
        let mut host = DashboardHost::new(transport(), DashboardSettings::default());
        assert!(matches!(host.render().await, Err(DashboardError::MissingHass)));
        host.set_hass(json!({"panels": {}}));
        assert!(matches!(host.fetch_accounts().await, Err(DashboardError::MissingEntryId)));
        host.set_hass(hass());
        assert!(matches!(
            host.fetch_positions("").await,
            Err(DashboardError::MissingParameter("portfolio_uuid"))
        ));
    }

    #[tokio::test]
    async fn test_render_builds_header_and_tables() {
        let host = rendered(transport()).await;
        let view = host.view().unwrap();
        assert_eq!(view.header.total_wealth, Some(150.0));
        assert_eq!(view.header.last_file_update.as_deref(), Some("2024-05-01 10:00"));
        assert!(view.fx_accounts.is_none());
        assert!(host.to_html().contains("Gesamtvermögen"));
    }

    #[tokio::test]
    async fn test_external_render_catches_errors() {
        let mut failing = transport();
        failing.fail(RequestKind::Accounts, None, TransportError::Message("offline".into()));
        let mut host = DashboardHost::new(failing, DashboardSettings::default());
        host.set_hass(hass());
        host.handle_external_render().await;
        assert_eq!(host.error_message(), Some("offline"));
        assert!(host.to_html().contains("offline"));
    }

    #[tokio::test]
    async fn test_bus_filters_entry_and_type() {
        let mut host = rendered(transport()).await;
        host.handle_bus_event(&json!([
            {"data_type": "accounts", "entry_id": "other", "data": [{"uuid": "a1", "name": "Giro", "balance": 1}]},
            {"data_type": "mystery", "entry_id": "e1", "data": {}},
            {"data_type": "last_file_update", "entry_id": "e1", "data": {"last_file_update": "2024-06-01"}}
        ]));
        assert_eq!(host.stores().caches.snapshot.account("a1").unwrap().balance, Some(100.0));
        assert_eq!(host.view().unwrap().header.last_file_update.as_deref(), Some("2024-06-01"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_positions_for_collapsed_portfolio_are_queued_then_dropped() {
        let mut host = rendered(transport()).await;
        host.handle_bus_event(&json!({
            "data_type": "portfolio_positions", "entry_id": "e1",
            "data": {"portfolio_uuid": "p1", "positions": [position("s1", 12.0)]}
        }));
        assert!(host.stores().pending.contains("p1"));
        assert!(host.stores().caches.positions.has_portfolio_positions("p1"));

        host.run_timers().await;
        assert!(!host.stores().pending.contains("p1"));
        assert!(host.timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_flushed_on_expand() {
        let mut host = rendered(transport()).await;
        host.handle_bus_event(&json!({
            "data_type": "portfolio_positions", "entry_id": "e1",
            "data": {"portfolio_uuid": "p1", "positions": [position("s1", 12.0)]}
        }));
        assert!(host.toggle_portfolio("p1").await);
        assert!(!host.stores().pending.contains("p1"));
        let html = host.to_html();
        assert!(html.contains(r#"data-security="s1""#));
        assert!(host.timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_positions_and_flash_removal() {
        let mut transport = transport();
        transport.respond(
            RequestKind::PortfolioPositions,
            Some("p1"),
            json!({"portfolio_uuid": "p1", "positions": [position("s1", 12.0)]}),
        );
        let mut host = rendered(transport).await;
        assert!(host.toggle_portfolio("p1").await);

        let chunk = |index: u64, uuid: &str| {
            json!({"data_type": "portfolio_positions", "entry_id": "e1", "data": {
                "portfolio_uuid": "p1", "chunk_index": index, "chunk_count": 2,
                "positions": [position(uuid, 20.0)]
            }})
        };
        host.handle_bus_event(&chunk(2, "s2"));
        assert_eq!(host.stores().caches.positions.get_portfolio_positions("p1").len(), 1);
        host.handle_bus_event(&chunk(1, "s1"));
        let positions = host.stores().caches.positions.get_portfolio_positions("p1");
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].security_uuid, "s1");

        assert!(host.to_html().contains(FLASH_CLASS));
        tokio::time::advance(Duration::from_millis(800)).await;
        host.process_timers(Instant::now());
        assert!(!host.to_html().contains(FLASH_CLASS));
    }

    #[tokio::test]
    async fn test_backend_error_shows_retry_and_clears_chunks() {
        let mut transport = transport();
        transport.respond(
            RequestKind::PortfolioPositions,
            Some("p1"),
            json!({"portfolio_uuid": "p1", "error": "Depot nicht gefunden"}),
        );
        let mut host = rendered(transport).await;
        host.toggle_portfolio("p1").await;
        let html = host.to_html();
        assert!(html.contains("Depot nicht gefunden"));
        assert!(html.contains(r#"class="retry-pos""#));

        host.handle_bus_event(&json!({"data_type": "portfolio_positions", "entry_id": "e1", "data": {
            "portfolio_uuid": "p1", "chunk_index": 1, "chunk_count": 2, "positions": []
        }}));
        assert!(host.stores().chunks.is_assembling("p1"));
        host.handle_bus_event(&json!({"data_type": "portfolio_positions", "entry_id": "e1", "data": {
            "portfolio_uuid": "p1", "error": "again"
        }}));
        assert!(!host.stores().chunks.is_assembling("p1"));
    }

    #[tokio::test]
    async fn test_positions_update_invalidates_security_history() {
        let mut host = rendered(transport()).await;
        host.stores
            .security
            .cache_history("s1", HistoryRange::OneYear, vec![], vec![]);
        let mut observer = host.subscribe();
        host.handle_bus_event(&json!({
            "data_type": "portfolio_positions", "entry_id": "e1",
            "data": {"portfolio_uuid": "p1", "positions": [position("s1", 12.0)]}
        }));
        assert!(host.stores().security.history("s1", HistoryRange::OneYear).is_none());
        let mut names = Vec::new();
        while let Ok(event) = observer.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&crate::events::POSITIONS_UPDATED_EVENT));
    }

    fn security_transport() -> FixtureTransport {
        let mut transport = transport();
        transport.respond(
            RequestKind::SecuritySnapshot,
            Some("s1"),
            json!({"snapshot": {
                "security_uuid": "s1", "name": "Apple", "ticker_symbol": "AAPL",
                "current_holdings": 2, "purchase_value": 100, "current_value": 150
            }}),
        );
        transport.respond(
            RequestKind::SecurityHistory,
            Some("s1"),
            json!({"prices": [{"date": "2024-01-02", "close": 10}, {"date": "2024-01-03", "close": 11}]}),
        );
        transport.respond(RequestKind::NewsPrompt, None, json!({"prompt": "Was gibt es Neues zu {TICKER}?"}));
        transport
    }

    #[tokio::test]
    async fn test_security_detail_page() {
        let mut host = rendered(security_transport()).await;

        host.open_security("s1").await.unwrap();
        assert_eq!(host.tabs().current().id, "security:s1");
        let html = host.to_html();
        assert!(html.contains("Apple"));
        assert!(html.contains(r#"data-points="2""#));
        assert_eq!(
            host.news_prompt("s1").await.unwrap(),
            "Was gibt es Neues zu AAPL?"
        );

        assert_eq!(host.next_page(), "overview");
        host.remember_scroll_position(42.0);
        host.next_page();
        assert_eq!(host.scroll_position(), 0.0);
        host.previous_page();
        assert_eq!(host.scroll_position(), 42.0);
    }

    #[tokio::test]
    async fn test_positions_update_keeps_open_security_page() {
        let mut host = rendered(security_transport()).await;
        host.open_security("s1").await.unwrap();
        assert!(host.to_html().contains(r#"data-points="2""#));
        assert!(!host.refresh_open_security().await.unwrap());

        host.handle_bus_event(&json!({
            "data_type": "portfolio_positions", "entry_id": "e1",
            "data": {"portfolio_uuid": "p1", "positions": [position("s1", 12.0)]}
        }));
        let html = host.to_html();
        assert!(html.contains("Apple"));
        assert!(html.contains("history-loading"));
        assert!(!html.contains("Lade Wertpapier"));

        assert!(host.refresh_open_security().await.unwrap());
        assert!(host.to_html().contains(r#"data-points="2""#));
        assert!(host.news_prompt("s1").await.is_ok());

        host.next_page();
        assert!(!host.refresh_open_security().await.unwrap());
    }

    #[tokio::test]
    async fn test_external_render_flushes_pending_for_open_sections() {
        let mut host = rendered(transport()).await;
        host.handle_bus_event(&json!({
            "data_type": "portfolio_positions", "entry_id": "e1",
            "data": {"portfolio_uuid": "p1", "positions": [position("s1", 12.0)]}
        }));
        assert!(host.stores().pending.contains("p1"));
        // opened by the page without going through toggle_portfolio
        host.view.as_mut().unwrap().set_expanded("p1", true);

        host.handle_external_render().await;
        assert!(!host.stores().pending.contains("p1"));
        assert!(host.timers().is_empty());
        let html = host.to_html();
        assert!(html.contains(r#"data-security="s1""#));
        assert!(html.contains(r#"aria-expanded="true""#));
    }

    #[tokio::test]
    async fn test_security_snapshot_missing_field_is_reported() {
        let mut transport = transport();
        transport.respond(
            RequestKind::SecuritySnapshot,
            Some("s9"),
            json!({"security_uuid": "s9", "name": "Broken"}),
        );
        let mut host = rendered(transport).await;
        let err = host.open_security("s9").await.unwrap_err();
        assert!(matches!(err, DashboardError::Mapping(_)));
        assert!(host.security_html("s9").contains("current_holdings"));
    }
}

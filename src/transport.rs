//! Backend channel: request/response calls and bus envelopes.
//!
//! The channel itself is provided by the host application; [`Transport`] is
//! the seam. [`FixtureTransport`] answers from recorded responses.

use std::collections::HashMap;

use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{DashboardError, TransportError};

pub const PANEL_COMPONENT: &str = "pp-reader-panel";

/// Request types understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Accounts,
    Portfolios,
    LastFileUpdate,
    PortfolioPositions,
    SecuritySnapshot,
    SecurityHistory,
    NewsPrompt,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Accounts => "pp_reader/get_accounts",
            RequestKind::Portfolios => "pp_reader/get_portfolio_data",
            RequestKind::LastFileUpdate => "pp_reader/get_last_file_update",
            RequestKind::PortfolioPositions => "pp_reader/get_portfolio_positions",
            RequestKind::SecuritySnapshot => "pp_reader/get_security_snapshot",
            RequestKind::SecurityHistory => "pp_reader/get_security_history",
            RequestKind::NewsPrompt => "pp_reader/get_news_prompt",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub entry_id: String,
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(kind: RequestKind, entry_id: &str) -> Self {
        Self {
            kind,
            entry_id: entry_id.to_string(),
            params: Map::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Wire form: `{"type": ..., "entry_id": ..., ...params}`.
    pub fn to_message(&self) -> Value {
        let mut message = self.params.clone();
        message.insert("type".to_string(), json!(self.kind.as_str()));
        message.insert("entry_id".to_string(), json!(self.entry_id));
        Value::Object(message)
    }
}

pub trait Transport: Send + Sync {
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Value, TransportError>>;
}

/// Looks up the config entry the panel belongs to: the panel's own
/// `_panel_custom` config first, then any registered panel using the
/// pp-reader component.
pub fn resolve_entry_id(panel: Option<&Value>, hass: Option<&Value>) -> Option<String> {
    let from_config = |panel: &Value| {
        panel
            .pointer("/config/_panel_custom/config/entry_id")
            .or_else(|| panel.pointer("/config/entry_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    };
    if let Some(id) = panel.and_then(from_config) {
        return Some(id);
    }
    let panels = hass?.get("panels")?.as_object()?;
    panels.values().find_map(|panel| {
        let name = panel.pointer("/config/_panel_custom/name").and_then(Value::as_str);
        if name == Some(PANEL_COMPONENT) {
            from_config(panel)
        } else {
            None
        }
    })
}

/// One bus delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub data_type: String,
    #[serde(default)]
    pub entry_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDataType {
    Accounts,
    LastFileUpdate,
    PortfolioValues,
    PortfolioPositions,
}

impl BusDataType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "accounts" => Some(BusDataType::Accounts),
            "last_file_update" => Some(BusDataType::LastFileUpdate),
            "portfolio_values" => Some(BusDataType::PortfolioValues),
            "portfolio_positions" => Some(BusDataType::PortfolioPositions),
            _ => None,
        }
    }
}

/// A bus event carries one envelope or an array of them. Entries that are
/// not envelopes are skipped.
pub fn parse_bus_payload(payload: &Value) -> Vec<BusEnvelope> {
    let items: &[Value] = match payload {
        Value::Array(items) => items,
        single => std::slice::from_ref(single),
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<BusEnvelope>(item.clone()) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                debug!(error = %err, "skipping malformed bus envelope");
                None
            }
        })
        .collect()
}

/// Positions update as delivered on the bus or by a positions fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionsMessage {
    pub portfolio_uuid: String,
    pub positions: Value,
    pub error: Option<String>,
    pub chunk_index: Option<usize>,
    pub chunk_count: Option<usize>,
}

impl PositionsMessage {
    pub fn parse(data: &Value) -> Option<Self> {
        let portfolio_uuid = data
            .get("portfolio_uuid")
            .or_else(|| data.get("portfolioUuid"))
            .and_then(Value::as_str)
            .filter(|uuid| !uuid.is_empty())?
            .to_string();
        let error = positions_error(data);
        let chunk = |key: &str| data.get(key).and_then(Value::as_u64).map(|v| v as usize);
        Some(Self {
            portfolio_uuid,
            positions: data.get("positions").cloned().unwrap_or(Value::Array(Vec::new())),
            error,
            chunk_index: chunk("chunk_index"),
            chunk_count: chunk("chunk_count"),
        })
    }
}

/// Backend-reported error of a positions payload.
pub fn positions_error(data: &Value) -> Option<String> {
    match data.get("error") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => None,
        Some(Value::String(message)) => Some(message.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Text of `last_file_update` payloads, which come bare or wrapped.
pub fn last_file_update_value(data: &Value) -> Option<String> {
    match data {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("last_file_update")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

pub fn require_param<'a>(name: &'static str, value: &'a str) -> Result<&'a str, DashboardError> {
    if value.trim().is_empty() {
        Err(DashboardError::MissingParameter(name))
    } else {
        Ok(value)
    }
}

/// Recorded responses and bus events, as loaded by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub entry_id: String,
    pub accounts: Value,
    pub portfolios: Value,
    pub last_file_update: Value,
    pub positions: HashMap<String, Value>,
    pub security_snapshots: HashMap<String, Value>,
    pub security_history: HashMap<String, Value>,
    pub news_prompt: Option<String>,
    /// Bus payloads replayed after the first render.
    pub events: Vec<Value>,
    /// Portfolios to expand after the first render.
    pub expand: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FixtureTransport {
    responses: HashMap<String, Result<Value, TransportError>>,
}

fn response_key(kind: RequestKind, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("{}:{id}", kind.as_str()),
        None => kind.as_str().to_string(),
    }
}

fn request_id(request: &Request) -> Option<&str> {
    match request.kind {
        RequestKind::PortfolioPositions => request.str_param("portfolio_uuid"),
        RequestKind::SecuritySnapshot | RequestKind::SecurityHistory => {
            request.str_param("security_uuid")
        }
        _ => None,
    }
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: &Fixture) -> Self {
        let mut transport = Self::new();
        transport.respond(RequestKind::Accounts, None, fixture.accounts.clone());
        transport.respond(RequestKind::Portfolios, None, fixture.portfolios.clone());
        transport.respond(
            RequestKind::LastFileUpdate,
            None,
            fixture.last_file_update.clone(),
        );
        for (uuid, positions) in &fixture.positions {
            transport.respond(RequestKind::PortfolioPositions, Some(uuid.as_str()), positions.clone());
        }
        for (uuid, snapshot) in &fixture.security_snapshots {
            transport.respond(RequestKind::SecuritySnapshot, Some(uuid.as_str()), snapshot.clone());
        }
        for (uuid, history) in &fixture.security_history {
            transport.respond(RequestKind::SecurityHistory, Some(uuid.as_str()), history.clone());
        }
        if let Some(prompt) = &fixture.news_prompt {
            transport.respond(RequestKind::NewsPrompt, None, json!({ "prompt": prompt }));
        }
        transport
    }

    pub fn respond(&mut self, kind: RequestKind, id: Option<&str>, response: Value) {
        self.responses.insert(response_key(kind, id), Ok(response));
    }

    pub fn fail(&mut self, kind: RequestKind, id: Option<&str>, error: TransportError) {
        self.responses.insert(response_key(kind, id), Err(error));
    }
}

impl Transport for FixtureTransport {
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Value, TransportError>> {
        let specific = request_id(&request).map(|id| response_key(request.kind, Some(id)));
        let response = specific
            .and_then(|key| self.responses.get(&key))
            .or_else(|| self.responses.get(&response_key(request.kind, None)))
            .cloned()
            .unwrap_or_else(|| Err(TransportError::Unhandled(request.kind.as_str().to_string())));
        Box::pin(future::ready(response))
    }
}

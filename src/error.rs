//! Error types for pp_reader_dashboard
//!
//! Only the fetch/orchestration layer and the strict snapshot mapper
//! produce errors. Normalizers and caches represent bad input as `None`
//! or an empty list instead.

use thiserror::Error;

/// Failures surfaced by the host while talking to the backend.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("hass object is not available")]
    MissingHass,

    #[error("no entry_id configured for the pp-reader panel")]
    MissingEntryId,

    #[error("{0} is required")]
    MissingParameter(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("backend reported an error: {0}")]
    Backend(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Failures of the request/response channel itself.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("{0}")]
    Message(String),

    /// The backend rejected the call with a non-string payload.
    #[error("{0}")]
    Payload(serde_json::Value),

    #[error("no response registered for request type {0}")]
    Unhandled(String),
}

/// Errors of the strict position snapshot mapper.
///
/// The bulk normalizers drop such records silently; the snapshot path used by
/// the security detail view reports them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("position snapshot is not an object")]
    NotAnObject,

    #[error("position snapshot is missing field `{0}`")]
    MissingField(&'static str),

    #[error("position snapshot field `{0}` has an invalid value")]
    InvalidField(&'static str),
}

pub const UNKNOWN_ERROR_MESSAGE: &str = "Unbekannter Fehler";

/// Turns a transport failure into the message shown inside an inline error
/// banner.
pub fn describe_error(err: &DashboardError) -> String {
    match err {
        DashboardError::Transport(TransportError::Payload(value)) => {
            match serde_json::to_string(value) {
                Ok(json) if !json.is_empty() && json != "null" => json,
                _ => UNKNOWN_ERROR_MESSAGE.to_string(),
            }
        }
        other => {
            let message = other.to_string();
            if message.trim().is_empty() {
                UNKNOWN_ERROR_MESSAGE.to_string()
            } else {
                message
            }
        }
    }
}

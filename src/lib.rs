//! View model of the pp-reader portfolio dashboard.
//!
//! Backend payloads are normalized into typed records, cached, rendered into
//! a retained table tree and patched in place when push updates arrive.

pub mod cache;
pub mod chunks;
pub mod config;
pub mod diagnostics;
pub mod dom;
pub mod error;
pub mod events;
pub mod format;
pub mod host;
pub mod model;
pub mod nav;
pub mod normalize;
pub mod patch;
pub mod pending;
pub mod render;
pub mod security;
pub mod timers;
pub mod transport;

pub use error::DashboardError;
pub use host::DashboardHost;

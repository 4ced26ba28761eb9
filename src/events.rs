//! Side-channel events for observers outside the rendering path.
//!
//! Dispatch is best-effort: nobody listening is not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::diagnostics::DiagnosticEvent;

pub const DIAGNOSTICS_EVENT: &str = "pp-reader:diagnostics";
pub const POSITIONS_UPDATED_EVENT: &str = "pp-reader:portfolio-positions-updated";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "detail")]
pub enum DashboardEvent {
    #[serde(rename = "pp-reader:diagnostics")]
    Diagnostics(DiagnosticEvent),
    #[serde(rename = "pp-reader:portfolio-positions-updated")]
    PortfolioPositionsUpdated {
        #[serde(rename = "portfolioUuid")]
        portfolio_uuid: String,
        #[serde(rename = "securityUuids")]
        security_uuids: Vec<String>,
    },
}

impl DashboardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DashboardEvent::Diagnostics(_) => DIAGNOSTICS_EVENT,
            DashboardEvent::PortfolioPositionsUpdated { .. } => POSITIONS_UPDATED_EVENT,
        }
    }
}

/// Fan-out channel standing in for DOM custom events.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<DashboardEvent>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.tx.subscribe()
    }

    /// Returns whether at least one subscriber received the event.
    pub fn dispatch(&self, event: DashboardEvent) -> bool {
        let name = event.name();
        match self.tx.send(event) {
            Ok(_) => true,
            Err(_) => {
                warn!(event = name, "no listener for dashboard event, dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_reaches_subscribers() {
        let dispatcher = EventDispatcher::new(4);
        let mut rx = dispatcher.subscribe();
        let event = DashboardEvent::PortfolioPositionsUpdated {
            portfolio_uuid: "p1".into(),
            security_uuids: vec!["s1".into()],
        };
        assert!(dispatcher.dispatch(event.clone()));
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_dispatch_without_listener_is_swallowed() {
        let dispatcher = EventDispatcher::new(4);
        let delivered = dispatcher.dispatch(DashboardEvent::PortfolioPositionsUpdated {
            portfolio_uuid: "p1".into(),
            security_uuids: Vec::new(),
        });
        assert!(!delivered);
    }

    #[test]
    fn test_event_serializes_with_dom_names() {
        let event = DashboardEvent::PortfolioPositionsUpdated {
            portfolio_uuid: "p1".into(),
            security_uuids: vec!["s1".into()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], POSITIONS_UPDATED_EVENT);
        assert_eq!(json["detail"]["portfolioUuid"], "p1");
    }
}

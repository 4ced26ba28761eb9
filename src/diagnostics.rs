//! Change tracking for per-entity metric metadata.
//!
//! The tracker remembers the last coverage ratio, provenance, metric run and
//! generation time seen for every `{kind}:{uuid}` and reports a
//! [`DiagnosticEvent`] only when one of them changes.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::events::{DashboardEvent, EventDispatcher};

/// Tracked metadata. `None` means the key was absent; `Some(Value::Null)` is an
/// explicit null and compares unequal to absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_ratio: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_run_uuid: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<Value>,
}

impl MetricMetadata {
    fn fields(&self) -> [(&'static str, &Option<Value>); 4] {
        [
            ("coverage_ratio", &self.coverage_ratio),
            ("provenance", &self.provenance),
            ("metric_run_uuid", &self.metric_run_uuid),
            ("generated_at", &self.generated_at),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, value)| value.is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEvent {
    pub kind: String,
    pub uuid: String,
    pub source: String,
    pub changed: BTreeMap<String, FieldChange>,
    /// The metadata now in effect, `None` after a withdrawal.
    pub snapshot: Option<MetricMetadata>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DiagnosticsTracker {
    last_seen: HashMap<String, MetricMetadata>,
    dispatcher: Option<EventDispatcher>,
}

impl DiagnosticsTracker {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self {
            last_seen: HashMap::new(),
            dispatcher: Some(dispatcher),
        }
    }

    /// Compares `metadata` with what was last seen for `kind:uuid` and emits
    /// an event when anything changed.
    pub fn track(
        &mut self,
        kind: &str,
        source: &str,
        uuid: &str,
        metadata: Option<MetricMetadata>,
    ) -> Option<DiagnosticEvent> {
        let key = format!("{kind}:{uuid}");
        let event = match metadata {
            None => {
                let previous = self.last_seen.remove(&key)?;
                let changed: BTreeMap<String, FieldChange> = previous
                    .fields()
                    .into_iter()
                    .filter(|(_, value)| value.is_some())
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            FieldChange {
                                previous: value.clone(),
                                current: None,
                            },
                        )
                    })
                    .collect();
                if changed.is_empty() {
                    return None;
                }
                DiagnosticEvent {
                    kind: kind.to_string(),
                    uuid: uuid.to_string(),
                    source: source.to_string(),
                    changed,
                    snapshot: None,
                    timestamp: Utc::now(),
                }
            }
            Some(current) => {
                let previous = self.last_seen.get(&key).cloned().unwrap_or_default();
                let changed: BTreeMap<String, FieldChange> = previous
                    .fields()
                    .into_iter()
                    .zip(current.fields())
                    .filter(|((_, old), (_, new))| old != new)
                    .map(|((name, old), (_, new))| {
                        (
                            name.to_string(),
                            FieldChange {
                                previous: old.clone(),
                                current: new.clone(),
                            },
                        )
                    })
                    .collect();
                if changed.is_empty() {
                    return None;
                }
                self.last_seen.insert(key, current.clone());
                DiagnosticEvent {
                    kind: kind.to_string(),
                    uuid: uuid.to_string(),
                    source: source.to_string(),
                    changed,
                    snapshot: Some(current),
                    timestamp: Utc::now(),
                }
            }
        };

        self.emit(&event);
        Some(event)
    }

    fn emit(&self, event: &DiagnosticEvent) {
        info!(
            kind = %event.kind,
            uuid = %event.uuid,
            source = %event.source,
            fields = ?event.changed.keys().collect::<Vec<_>>(),
            "metric metadata changed"
        );
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(DashboardEvent::Diagnostics(event.clone()));
        }
    }

    pub fn last_seen(&self, kind: &str, uuid: &str) -> Option<&MetricMetadata> {
        self.last_seen.get(&format!("{kind}:{uuid}"))
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

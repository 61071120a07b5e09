use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Batch,
    Debug,
}

/// How a consumer should surface the event to a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Progress,
    Success,
    Info,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: String,
    pub correlation_id: String,
    pub event_type: String,
    pub category: EventCategory,
    pub level: NotificationLevel,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(
        correlation_id: impl Into<String>,
        event_type: impl Into<String>,
        category: EventCategory,
        level: NotificationLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            category,
            level,
            message: message.into(),
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryTelemetrySink {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl InMemoryTelemetrySink {
    pub fn events(&self) -> Vec<EngineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<EngineEvent> {
        self.events().into_iter().filter(|event| event.event_type == event_type).collect()
    }
}

impl TelemetrySink for InMemoryTelemetrySink {
    fn emit(&self, event: EngineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Forwards events to the `tracing` subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: EngineEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        match event.level {
            NotificationLevel::Error => tracing::error!(
                event_name = %event.event_type,
                correlation_id = %event.correlation_id,
                metadata = %metadata,
                "{}",
                event.message
            ),
            NotificationLevel::Progress => tracing::debug!(
                event_name = %event.event_type,
                correlation_id = %event.correlation_id,
                metadata = %metadata,
                "{}",
                event.message
            ),
            NotificationLevel::Success | NotificationLevel::Info => tracing::info!(
                event_name = %event.event_type,
                correlation_id = %event.correlation_id,
                metadata = %metadata,
                "{}",
                event.message
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::telemetry::{
        EngineEvent, EventCategory, InMemoryTelemetrySink, NotificationLevel, TelemetrySink,
    };

    #[test]
    fn in_memory_sink_records_events_with_correlation_fields() {
        let sink = InMemoryTelemetrySink::default();
        sink.emit(
            EngineEvent::new(
                "batch-42",
                "batch.run_completed",
                EventCategory::Batch,
                NotificationLevel::Progress,
                "run 1 of 3 finished",
            )
            .with_metadata("completed_runs", "1")
            .with_metadata("run_count", "3"),
        );
        sink.emit(EngineEvent::new(
            "batch-42",
            "batch.completed",
            EventCategory::Batch,
            NotificationLevel::Success,
            "Completed 3 runs",
        ));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].correlation_id, "batch-42");
        assert_eq!(events[0].metadata.get("completed_runs").map(String::as_str), Some("1"));
        assert_eq!(sink.events_of_type("batch.completed").len(), 1);
        assert_ne!(events[0].event_id, events[1].event_id);
    }
}

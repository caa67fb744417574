//! Typed domain events published on the in-process bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of event topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "processing.started")]
    ProcessingStarted,
    #[serde(rename = "processing.progress")]
    ProcessingProgress,
    #[serde(rename = "processing.completed")]
    ProcessingCompleted,
    #[serde(rename = "processing.failed")]
    ProcessingFailed,
    #[serde(rename = "inspection.created")]
    InspectionCreated,
    #[serde(rename = "inspection.updated")]
    InspectionUpdated,
    #[serde(rename = "finding.added")]
    FindingAdded,
    #[serde(rename = "user.registered")]
    UserRegistered,
    #[serde(rename = "test")]
    Test,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProcessingStarted => "processing.started",
            EventType::ProcessingProgress => "processing.progress",
            EventType::ProcessingCompleted => "processing.completed",
            EventType::ProcessingFailed => "processing.failed",
            EventType::InspectionCreated => "inspection.created",
            EventType::InspectionUpdated => "inspection.updated",
            EventType::FindingAdded => "finding.added",
            EventType::UserRegistered => "user.registered",
            EventType::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing.started" => Some(EventType::ProcessingStarted),
            "processing.progress" => Some(EventType::ProcessingProgress),
            "processing.completed" => Some(EventType::ProcessingCompleted),
            "processing.failed" => Some(EventType::ProcessingFailed),
            "inspection.created" => Some(EventType::InspectionCreated),
            "inspection.updated" => Some(EventType::InspectionUpdated),
            "finding.added" => Some(EventType::FindingAdded),
            "user.registered" => Some(EventType::UserRegistered),
            "test" => Some(EventType::Test),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as published on the bus and delivered to webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "event")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Topic string used for bus pattern matching.
    pub fn topic(&self) -> &'static str {
        self.event_type.as_str()
    }
}

/// Returns true when `topic` matches `pattern`.
///
/// Patterns are either an exact topic (`processing.completed`), a segment
/// prefix with a trailing wildcard (`processing.*`), or the global `*`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    false
}

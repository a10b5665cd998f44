//! # Swarm Events
//!
//! Progress events emitted by the supervisor while a session runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of swarm event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwarmEventKind {
    /// Session mode changed
    ModeChanged,
    /// Section plan accepted during decomposition
    PlanAccepted,
    /// Ownership map built and validated
    OwnershipMapBuilt,
    /// Worker started on a section
    SectionStarted,
    /// Section passed the validation gate
    SectionCompleted,
    /// Section completed through an audited bypass
    SectionBypassed,
    /// Section failed validation
    SectionFailed,
    /// Shared-file changes applied after a wave
    SharedChangesMerged,
    /// Tool sequence recorded for crystallization
    PatternObserved,
    SessionFinished,
    SessionAborted,
}

/// An event in the swarm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: SwarmEventKind,
    /// Section the event concerns, if any
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl SwarmEvent {
    pub fn new(kind: SwarmEventKind) -> Self {
        Self {
            id: event_id(),
            timestamp: Utc::now(),
            kind,
            section_id: None,
            data: None,
        }
    }

    pub fn for_section(mut self, section_id: &str) -> Self {
        self.section_id = Some(section_id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Time-ordered id with a random suffix; not cryptographic
fn event_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let micros = Utc::now().timestamp_micros();
    let suffix = RandomState::new().build_hasher().finish() as u32;
    format!("{:x}-{:08x}", micros, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = SwarmEvent::new(SwarmEventKind::SectionStarted)
            .for_section("api")
            .with_data(serde_json::json!({ "retry": 1 }));

        assert_eq!(event.section_id.as_deref(), Some("api"));
        assert_eq!(event.data.unwrap()["retry"], 1);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_value(SwarmEventKind::SharedChangesMerged).unwrap();
        assert_eq!(json, "shared_changes_merged");
    }
}

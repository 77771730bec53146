//! Call lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of lifecycle event published on a session's event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Invite,
    Ringing,
    Connected,
    Bye,
    Cancel,
    Dtmf,
    Error,
    RtpStarted,
    RtpStopped,
}

/// A single lifecycle event for one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub kind: EventType,
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CallEvent {
    pub fn new(kind: EventType, call_id: impl Into<String>) -> Self {
        Self {
            kind,
            call_id: call_id.into(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

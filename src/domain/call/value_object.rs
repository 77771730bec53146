//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    /// Call received from a remote peer
    Inbound,
    /// Call originated by this engine
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call state
///
/// ```text
/// Initializing -> Ringing -> Connected <-> OnHold -> Ending -> Ended
///        \___________\____________\__________\________\-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Session created, no provisional response yet
    Initializing,
    /// Remote side is alerting
    Ringing,
    /// Dialog confirmed, media flowing
    Connected,
    /// Media paused by a hold offer
    OnHold,
    /// Teardown in progress
    Ending,
    /// Call finished normally
    Ended,
    /// Call setup or the established call failed
    Failed,
}

impl CallState {
    /// Check if state transition is valid
    ///
    /// Ended and Failed are reachable from every non-terminal state; nothing
    /// leaves a terminal state.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Ended) | (_, Failed) => true,

            (Initializing, Ringing) => true,
            (Initializing, Connected) => true,

            (Ringing, Connected) => true,
            (Ringing, Ending) => true,

            (Connected, OnHold) => true,
            (Connected, Ending) => true,

            (OnHold, Connected) => true,
            (OnHold, Ending) => true,

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Ringing, connected or on hold
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::Ringing | CallState::Connected | CallState::OnHold
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Initializing => "initializing",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::OnHold => "on_hold",
            CallState::Ending => "ending",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

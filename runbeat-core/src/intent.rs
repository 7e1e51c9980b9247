//! Process-wide training intent.

use crate::recovery::Priority;
use serde::{Deserialize, Serialize};

/// What the user is currently doing with the app.
///
/// This is the single signal for "training is active"; recovery aggressiveness and the
/// real-time subscription lifecycle are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Training,
    #[default]
    Idle,
    Disconnected,
}

/// Side effects implied by moving from one intent to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentTransition {
    /// Entering training. Aggressive recovery becomes enabled through gating alone.
    Activate,
    /// Leaving training for idle: cancel critical/enhancing recoveries and drop the
    /// real-time subscription, but keep the connection.
    Deactivate,
    /// Explicit disconnect: cancel every recovery and close the channels.
    Disconnect,
    NoOp,
}

impl Intent {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Idle => "idle",
            Self::Disconnected => "disconnected",
        }
    }

    /// Whether a recovery of `priority` may still run under this intent.
    #[must_use]
    pub const fn permits(self, priority: Priority) -> bool {
        match self {
            Self::Training => true,
            Self::Idle => matches!(priority, Priority::Background),
            Self::Disconnected => false,
        }
    }

    /// Classify the move from `self` to `next`.
    #[must_use]
    pub const fn transition_to(self, next: Self) -> IntentTransition {
        match (self, next) {
            (Self::Training, Self::Training)
            | (Self::Idle, Self::Idle)
            | (Self::Disconnected, Self::Disconnected) => IntentTransition::NoOp,
            (_, Self::Training) => IntentTransition::Activate,
            (_, Self::Disconnected) => IntentTransition::Disconnect,
            (Self::Training, Self::Idle) => IntentTransition::Deactivate,
            (Self::Disconnected, Self::Idle) => IntentTransition::NoOp,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

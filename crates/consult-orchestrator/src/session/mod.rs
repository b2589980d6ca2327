//! Session state machine, participant bookkeeping and identity types.

mod lifecycle;
mod metadata;
mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use lifecycle::SessionLifecycleManager;
pub use metadata::ConnectionMetadata;
pub use registry::{RemoteParticipant, RemoteParticipantRegistry};

use crate::error::FailureReason;

/// Lifecycle of one orchestrator's session.
///
/// `Idle -> Connecting -> Active -> Leaving -> Closed`, with
/// `Connecting -> Failed -> Idle` and `Active -> Failed -> Idle` on
/// failures. `Closed` is terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Leaving,
    Closed,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// States a `leave()` waits out instead of acting on.
    pub fn is_settled(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Advisor,
    Client,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Advisor => Role::Client,
            Role::Client => Role::Advisor,
        }
    }

    /// Accepts the role spellings seen in connection payloads.
    pub fn parse_loose(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ADVISOR" | "EXPERT" | "CONSULTANT" => Some(Role::Advisor),
            "CLIENT" | "USER" | "MEMBER" | "CUSTOMER" => Some(Role::Client),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Advisor => "ADVISOR",
            Role::Client => "CLIENT",
        })
    }
}

/// Who is joining from this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    /// Application payload attached to the backend connection.
    pub fn app_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            serde_json::json!({ "displayName": self.display_name, "role": self.role }).to_string()
        })
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session lifecycle status.
///
/// Transitions are monotonic toward a terminal state: `completed` and
/// `terminated` are final, `paused` may resume to `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Terminated,
    Paused,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    /// Whether moving to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical grouping of traces for one agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub action_count: u64,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
}

impl Session {
    /// New active session; created on the first trace for an unseen id.
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Active,
            total_cost: 0.0,
            action_count: 0,
            score: 0.0,
            metadata: Value::Null,
        }
    }
}

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub agent_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        self.agent_id
            .as_ref()
            .is_none_or(|a| &session.agent_id == a)
            && self.status.as_ref().is_none_or(|s| &session.status == s)
    }
}

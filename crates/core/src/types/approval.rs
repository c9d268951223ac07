use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approval lifecycle; monotonic from `pending` to exactly one terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted human-approval record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub session_id: String,
    pub trace_id: String,
    pub policy_name: String,
    /// Opaque description shown to the approver.
    #[serde(default)]
    pub action_summary: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: String,
}

/// What happens when an approval deadline passes unresolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutEffect {
    Allow,
    #[default]
    Deny,
}

/// A request submitted to the approval queue by the policy engine.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub trace_id: String,
    pub agent_id: String,
    pub policy_name: String,
    pub action_summary: String,
    pub approvers: Vec<String>,
    pub timeout: std::time::Duration,
    pub timeout_effect: TimeoutEffect,
}

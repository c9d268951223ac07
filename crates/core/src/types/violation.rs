use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable record of a deny/terminate decision, keyed by trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub trace_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub policy_name: String,
    /// `deny`, `terminate`, or `error` for fail-mode denials.
    pub effect: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Violation {
    pub fn new(
        trace_id: impl Into<String>,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        policy_name: impl Into<String>,
        effect: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            policy_name: policy_name.into(),
            effect: effect.into(),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

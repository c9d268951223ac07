use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::ActionType;

/// Outcome recorded for a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Allowed,
    Denied,
    Terminated,
    Approved,
    Pending,
    Throttled,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Terminated => "terminated",
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Throttled => "throttled",
        }
    }
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One intercepted action, linked into its session's hash chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// ULID; lexicographic order follows creation order.
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub action_name: String,
    /// Opaque request payload as supplied by the adapter.
    #[serde(default)]
    pub request_body: String,
    /// Opaque response payload, empty until the action completes.
    #[serde(default)]
    pub response_body: String,
    pub status: TraceStatus,
    #[serde(default)]
    pub policy_name: String,
    #[serde(default)]
    pub policy_reason: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub metadata: Value,
    /// Hash of the previous trace in the session (or the session seed).
    #[serde(default)]
    pub prev_hash: String,
    /// SHA-256 over this trace's identity fields and `prev_hash`.
    #[serde(default)]
    pub hash: String,
}

impl Trace {
    /// Create an unsealed trace; `prev_hash`/`hash` are set by [`Trace::seal`].
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        action_type: ActionType,
        action_name: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            action_type,
            action_name: action_name.into(),
            request_body: String::new(),
            response_body: String::new(),
            status: TraceStatus::Pending,
            policy_name: String::new(),
            policy_reason: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            latency_ms: 0,
            model: String::new(),
            metadata: Value::Null,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    pub fn with_request(mut self, body: impl Into<String>) -> Self {
        self.request_body = body.into();
        self
    }

    pub fn with_response(mut self, body: impl Into<String>) -> Self {
        self.response_body = body.into();
        self
    }

    pub fn with_status(mut self, status: TraceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_policy(mut self, name: impl Into<String>, reason: impl Into<String>) -> Self {
        self.policy_name = name.into();
        self.policy_reason = reason.into();
        self
    }

    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64, cost_usd: f64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self.cost_usd = cost_usd;
        self
    }

    /// Link this trace into the chain: set `prev_hash` and compute `hash`.
    pub fn seal(&mut self, prev_hash: impl Into<String>) {
        self.prev_hash = prev_hash.into();
        self.hash = crate::hash::trace_hash(self);
    }
}

/// Filter for trace listings.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub action_type: Option<ActionType>,
    pub status: Option<TraceStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TraceFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    /// In-memory predicate mirroring the SQL filter semantics.
    pub fn matches(&self, trace: &Trace) -> bool {
        self.session_id
            .as_ref()
            .is_none_or(|s| &trace.session_id == s)
            && self.agent_id.as_ref().is_none_or(|a| &trace.agent_id == a)
            && self
                .action_type
                .as_ref()
                .is_none_or(|t| &trace.action_type == t)
            && self.status.as_ref().is_none_or(|s| &trace.status == s)
            && self.since.is_none_or(|s| trace.timestamp >= s)
            && self.until.is_none_or(|u| trace.timestamp <= u)
    }
}

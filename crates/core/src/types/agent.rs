use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A governed agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub current_version: u32,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: Utc::now(),
            current_version: 0,
            config: Value::Null,
            metadata: Value::Null,
        }
    }
}

/// Lifecycle status of an agent version.
///
/// At most one version per agent is `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentVersionStatus {
    Active,
    Candidate,
    Shadow,
    Retired,
    RolledBack,
}

impl AgentVersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Candidate => "candidate",
            Self::Shadow => "shadow",
            Self::Retired => "retired",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// One version of an agent's prompt/config lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVersion {
    pub agent_id: String,
    pub version_number: u32,
    pub status: AgentVersionStatus,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub diff_from_prev: String,
    #[serde(default)]
    pub diff_reason: String,
    #[serde(default)]
    pub shadow_results: Value,
    pub created_at: DateTime<Utc>,
}

/// Aggregate view of one agent's history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent_id: String,
    pub total_sessions: u64,
    pub total_actions: u64,
    pub total_cost: f64,
    pub violation_count: u64,
}

/// Aggregate view of the whole node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_traces: u64,
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_violations: u64,
    pub total_cost: f64,
    pub pending_approvals: u64,
}

//! Contracts between AgentWarden components.
//!
//! The core never talks to concrete storage, LLM providers, or alert sinks;
//! it consumes these traits and treats every failure as §fail-mode input.

use async_trait::async_trait;

use crate::error::Result;
use crate::hash::ChainVerification;
use crate::types::{
    Agent, AgentStats, AgentVersion, Alert, Approval, ApprovalStatus, Session, SessionFilter,
    SessionStatus, SystemStats, Trace, TraceFilter, Violation,
};

// =============================================================================
// Store
// =============================================================================

/// Persistent storage for traces, sessions, agents, approvals and violations.
///
/// Any operation may fail with a transport error; callers apply the
/// configured fail-mode. `upsert_session` is keyed by id, `resolve_approval`
/// is idempotent for the same terminal status, and `prune_older_than`
/// deletes only rows strictly older than the cutoff.
#[async_trait]
pub trait Store: Send + Sync {
    // Traces
    async fn insert_trace(&self, trace: &Trace) -> Result<()>;
    async fn get_trace(&self, id: &str) -> Result<Option<Trace>>;
    async fn list_traces(&self, filter: &TraceFilter) -> Result<Vec<Trace>>;
    /// Substring search over action names and payloads.
    async fn search_traces(&self, query: &str, limit: usize) -> Result<Vec<Trace>>;

    // Sessions
    async fn upsert_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>>;
    async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()>;
    /// Accumulate cost and action count; both are monotonically non-decreasing.
    async fn update_session_cost(&self, id: &str, cost: f64, action_count: u64) -> Result<()>;
    async fn score_session(&self, id: &str, score: f64) -> Result<()>;

    // Agents & versions
    async fn upsert_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn list_agents(&self) -> Result<Vec<Agent>>;
    async fn get_agent_stats(&self, id: &str) -> Result<AgentStats>;
    async fn insert_agent_version(&self, version: &AgentVersion) -> Result<()>;
    async fn get_agent_version(&self, agent_id: &str, version: u32) -> Result<Option<AgentVersion>>;
    async fn list_agent_versions(&self, agent_id: &str) -> Result<Vec<AgentVersion>>;

    // Approvals
    async fn insert_approval(&self, approval: &Approval) -> Result<()>;
    async fn get_approval(&self, id: &str) -> Result<Option<Approval>>;
    async fn list_pending_approvals(&self) -> Result<Vec<Approval>>;
    async fn resolve_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        resolved_by: &str,
    ) -> Result<()>;

    // Violations
    async fn insert_violation(&self, violation: &Violation) -> Result<()>;
    async fn list_violations(&self, session_id: Option<&str>, limit: usize)
        -> Result<Vec<Violation>>;

    // Maintenance
    /// Delete traces strictly older than `days`; returns the number removed.
    async fn prune_older_than(&self, days: u32) -> Result<u64>;
    /// Read the session's traces ascending by timestamp and verify linkage.
    async fn verify_hash_chain(&self, session_id: &str) -> Result<ChainVerification>;
    async fn get_system_stats(&self) -> Result<SystemStats>;
}

// =============================================================================
// LLM (judges & playbooks)
// =============================================================================

/// One chat completion request to an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            user: user.into(),
            temperature: 0.0,
            max_tokens: 512,
        }
    }
}

/// Minimal LLM surface used by judge policies and playbooks.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the first choice's content.
    async fn chat(&self, request: &ChatRequest) -> Result<String>;
}

// =============================================================================
// Alert sinks
// =============================================================================

/// One external alert destination.
#[async_trait]
pub trait AlertSender: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &Alert) -> Result<()>;
}

//! In-memory store for testing and development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use agent_warden_core::traits::Store;
use agent_warden_core::types::{
    Agent, AgentStats, AgentVersion, AgentVersionStatus, Approval, ApprovalStatus, Session,
    SessionFilter, SessionStatus, SystemStats, Trace, TraceFilter, Violation,
};
use agent_warden_core::{verify_chain, ChainVerification, Error, Result};

#[derive(Default)]
struct Inner {
    traces: Vec<Trace>,
    sessions: HashMap<String, Session>,
    agents: HashMap<String, Agent>,
    versions: HashMap<String, Vec<AgentVersion>>,
    approvals: HashMap<String, Approval>,
    violations: Vec<Violation>,
}

/// In-memory `Store`; state is lost on drop, deliberately.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_trace(&self, trace: &Trace) -> Result<()> {
        self.inner.lock().unwrap().traces.push(trace.clone());
        Ok(())
    }

    async fn get_trace(&self, id: &str) -> Result<Option<Trace>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.traces.iter().find(|t| t.id == id).cloned())
    }

    async fn list_traces(&self, filter: &TraceFilter) -> Result<Vec<Trace>> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<Trace> = inner
            .traces
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let offset = filter.offset.unwrap_or(0);
        let result: Vec<Trace> = result.into_iter().skip(offset).collect();
        match filter.limit {
            Some(limit) => Ok(result.into_iter().take(limit).collect()),
            None => Ok(result),
        }
    }

    async fn search_traces(&self, query: &str, limit: usize) -> Result<Vec<Trace>> {
        let inner = self.inner.lock().unwrap();
        let needle = query.to_lowercase();
        let mut result: Vec<Trace> = inner
            .traces
            .iter()
            .filter(|t| {
                t.action_name.to_lowercase().contains(&needle)
                    || t.request_body.to_lowercase().contains(&needle)
                    || t.response_body.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        result.truncate(limit);
        Ok(result)
    }

    async fn upsert_session(&self, session: &Session) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(id).cloned())
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let offset = filter.offset.unwrap_or(0);
        let result: Vec<Session> = result.into_iter().skip(offset).collect();
        match filter.limit {
            Some(limit) => Ok(result.into_iter().take(limit).collect()),
            None => Ok(result),
        }
    }

    async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::store(format!("session not found: {id}")))?;
        if !session.status.can_transition_to(status) {
            return Err(Error::store(format!(
                "session {id} is {} and cannot become {status}",
                session.status
            )));
        }
        session.status = status;
        if status.is_terminal() {
            session.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_session_cost(&self, id: &str, cost: f64, action_count: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::store(format!("session not found: {id}")))?;
        session.total_cost += cost;
        session.action_count += action_count;
        Ok(())
    }

    async fn score_session(&self, id: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::store(format!("session not found: {id}")))?;
        session.score = score;
        Ok(())
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.inner.lock().unwrap().agents.get(id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let inner = self.inner.lock().unwrap();
        let mut agents: Vec<Agent> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn get_agent_stats(&self, id: &str) -> Result<AgentStats> {
        let inner = self.inner.lock().unwrap();
        let sessions = inner.sessions.values().filter(|s| s.agent_id == id);
        let (mut total_sessions, mut total_cost) = (0u64, 0f64);
        for session in sessions {
            total_sessions += 1;
            total_cost += session.total_cost;
        }
        Ok(AgentStats {
            agent_id: id.to_string(),
            total_sessions,
            total_actions: inner.traces.iter().filter(|t| t.agent_id == id).count() as u64,
            total_cost,
            violation_count: inner.violations.iter().filter(|v| v.agent_id == id).count() as u64,
        })
    }

    async fn insert_agent_version(&self, version: &AgentVersion) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let versions = inner.versions.entry(version.agent_id.clone()).or_default();
        // A newly active version retires the previous active one.
        if version.status == AgentVersionStatus::Active {
            for existing in versions.iter_mut() {
                if existing.status == AgentVersionStatus::Active {
                    existing.status = AgentVersionStatus::Retired;
                }
            }
        }
        versions.retain(|v| v.version_number != version.version_number);
        versions.push(version.clone());
        versions.sort_by_key(|v| v.version_number);
        Ok(())
    }

    async fn get_agent_version(
        &self,
        agent_id: &str,
        version: u32,
    ) -> Result<Option<AgentVersion>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .versions
            .get(agent_id)
            .and_then(|vs| vs.iter().find(|v| v.version_number == version))
            .cloned())
    }

    async fn list_agent_versions(&self, agent_id: &str) -> Result<Vec<AgentVersion>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.versions.get(agent_id).cloned().unwrap_or_default())
    }

    async fn insert_approval(&self, approval: &Approval) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .approvals
            .insert(approval.id.clone(), approval.clone());
        Ok(())
    }

    async fn get_approval(&self, id: &str) -> Result<Option<Approval>> {
        Ok(self.inner.lock().unwrap().approvals.get(id).cloned())
    }

    async fn list_pending_approvals(&self) -> Result<Vec<Approval>> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<Approval> = inner
            .approvals
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn resolve_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        resolved_by: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let approval = inner
            .approvals
            .get_mut(id)
            .ok_or_else(|| Error::ApprovalUnknown(id.to_string()))?;
        if approval.status == status {
            return Ok(());
        }
        if approval.status != ApprovalStatus::Pending {
            return Err(Error::ApprovalUnknown(id.to_string()));
        }
        approval.status = status;
        approval.resolved_at = Some(Utc::now());
        approval.resolved_by = resolved_by.to_string();
        Ok(())
    }

    async fn insert_violation(&self, violation: &Violation) -> Result<()> {
        self.inner.lock().unwrap().violations.push(violation.clone());
        Ok(())
    }

    async fn list_violations(
        &self,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Violation>> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<Violation> = inner
            .violations
            .iter()
            .filter(|v| session_id.is_none_or(|s| v.session_id == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn prune_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let mut inner = self.inner.lock().unwrap();
        let before = inner.traces.len();
        inner.traces.retain(|t| t.timestamp >= cutoff);
        Ok((before - inner.traces.len()) as u64)
    }

    async fn verify_hash_chain(&self, session_id: &str) -> Result<ChainVerification> {
        let inner = self.inner.lock().unwrap();
        let mut traces: Vec<Trace> = inner
            .traces
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        traces.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(verify_chain(session_id, &traces))
    }

    async fn get_system_stats(&self) -> Result<SystemStats> {
        let inner = self.inner.lock().unwrap();
        Ok(SystemStats {
            total_traces: inner.traces.len() as u64,
            total_sessions: inner.sessions.len() as u64,
            active_sessions: inner
                .sessions
                .values()
                .filter(|s| s.status == SessionStatus::Active)
                .count() as u64,
            total_violations: inner.violations.len() as u64,
            total_cost: inner.sessions.values().map(|s| s.total_cost).sum(),
            pending_approvals: inner
                .approvals
                .values()
                .filter(|a| a.status == ApprovalStatus::Pending)
                .count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_warden_core::types::ActionType;

    #[tokio::test]
    async fn upsert_session_is_keyed_by_id() {
        let store = MemoryStore::new();
        let mut session = Session::new("s-1", "agent-1");
        store.upsert_session(&session).await.unwrap();

        session.total_cost = 3.5;
        store.upsert_session(&session).await.unwrap();

        let sessions = store.list_sessions(&SessionFilter::default()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].total_cost, 3.5);
    }

    #[tokio::test]
    async fn terminal_session_rejects_reactivation() {
        let store = MemoryStore::new();
        store.upsert_session(&Session::new("s-1", "a")).await.unwrap();
        store
            .update_session_status("s-1", SessionStatus::Terminated)
            .await
            .unwrap();
        assert!(store
            .update_session_status("s-1", SessionStatus::Active)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn resolve_approval_is_idempotent_for_same_status() {
        let store = MemoryStore::new();
        let approval = Approval {
            id: "ap-1".into(),
            session_id: "s-1".into(),
            trace_id: "t-1".into(),
            policy_name: "hitl".into(),
            action_summary: String::new(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            timeout_at: Utc::now(),
            resolved_at: None,
            resolved_by: String::new(),
        };
        store.insert_approval(&approval).await.unwrap();

        store
            .resolve_approval("ap-1", ApprovalStatus::Approved, "alice")
            .await
            .unwrap();
        // Same terminal status again: no error.
        store
            .resolve_approval("ap-1", ApprovalStatus::Approved, "alice")
            .await
            .unwrap();
        // Conflicting terminal status: rejected.
        assert!(store
            .resolve_approval("ap-1", ApprovalStatus::Denied, "bob")
            .await
            .is_err());
        // Unknown id: rejected.
        assert!(store
            .resolve_approval("ap-404", ApprovalStatus::Approved, "alice")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn active_version_insert_retires_previous_active() {
        let store = MemoryStore::new();
        let version = |n: u32, status: AgentVersionStatus| AgentVersion {
            agent_id: "agent-1".into(),
            version_number: n,
            status,
            system_prompt: String::new(),
            config: serde_json::Value::Null,
            diff_from_prev: String::new(),
            diff_reason: String::new(),
            shadow_results: serde_json::Value::Null,
            created_at: Utc::now(),
        };
        store
            .insert_agent_version(&version(1, AgentVersionStatus::Active))
            .await
            .unwrap();
        store
            .insert_agent_version(&version(2, AgentVersionStatus::Active))
            .await
            .unwrap();

        let versions = store.list_agent_versions("agent-1").await.unwrap();
        let active: Vec<u32> = versions
            .iter()
            .filter(|v| v.status == AgentVersionStatus::Active)
            .map(|v| v.version_number)
            .collect();
        assert_eq!(active, vec![2]);
    }

    #[tokio::test]
    async fn search_matches_payloads_case_insensitively() {
        let store = MemoryStore::new();
        let trace = Trace::new("s-1", "a", ActionType::ToolCall, "shell")
            .with_request("curl https://Example.com");
        store.insert_trace(&trace).await.unwrap();

        let hits = store.search_traces("example.com", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.search_traces("absent", 10).await.unwrap().is_empty());
    }
}

//! SQLite store.
//!
//! A single `rusqlite::Connection` behind a mutex; every call runs on the
//! blocking pool. Timestamps are stored as fixed-width RFC 3339 text so that
//! lexicographic ordering matches chronological ordering.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use agent_warden_core::traits::Store;
use agent_warden_core::types::{
    Agent, AgentStats, AgentVersion, AgentVersionStatus, Approval, ApprovalStatus, Session,
    SessionFilter, SessionStatus, SystemStats, Trace, TraceFilter, Violation,
};
use agent_warden_core::{verify_chain, ChainVerification, Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traces (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    action_type TEXT NOT NULL,
    action_name TEXT NOT NULL,
    request_body TEXT NOT NULL DEFAULT '',
    response_body TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    policy_name TEXT NOT NULL DEFAULT '',
    policy_reason TEXT NOT NULL DEFAULT '',
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    model TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT 'null',
    prev_hash TEXT NOT NULL,
    hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_traces_session ON traces (session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_traces_agent ON traces (agent_id);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    status TEXT NOT NULL,
    total_cost REAL NOT NULL DEFAULT 0,
    action_count INTEGER NOT NULL DEFAULT 0,
    score REAL NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT 'null'
);
CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions (agent_id);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    current_version INTEGER NOT NULL DEFAULT 0,
    config TEXT NOT NULL DEFAULT 'null',
    metadata TEXT NOT NULL DEFAULT 'null'
);

CREATE TABLE IF NOT EXISTS agent_versions (
    agent_id TEXT NOT NULL,
    version_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    system_prompt TEXT NOT NULL DEFAULT '',
    config TEXT NOT NULL DEFAULT 'null',
    diff_from_prev TEXT NOT NULL DEFAULT '',
    diff_reason TEXT NOT NULL DEFAULT '',
    shadow_results TEXT NOT NULL DEFAULT 'null',
    created_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, version_number)
);

CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    policy_name TEXT NOT NULL,
    action_summary TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    timeout_at TEXT NOT NULL,
    resolved_at TEXT,
    resolved_by TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals (status);

CREATE TABLE IF NOT EXISTS violations (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    policy_name TEXT NOT NULL,
    effect TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_violations_session ON violations (session_id);
";

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// Parse a status/type string back into its serde enum.
fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

fn db_err(e: impl std::fmt::Display) -> Error {
    Error::store(e.to_string())
}

/// SQLite-backed `Store`.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            op(&mut *conn)
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    }
}

fn trace_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trace> {
    Ok(Trace {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        timestamp: parse_ts(&row.get::<_, String>(3)?)?,
        action_type: parse_enum(&row.get::<_, String>(4)?)?,
        action_name: row.get(5)?,
        request_body: row.get(6)?,
        response_body: row.get(7)?,
        status: parse_enum(&row.get::<_, String>(8)?)?,
        policy_name: row.get(9)?,
        policy_reason: row.get(10)?,
        tokens_in: row.get::<_, i64>(11)? as u64,
        tokens_out: row.get::<_, i64>(12)? as u64,
        cost_usd: row.get(13)?,
        latency_ms: row.get::<_, i64>(14)? as u64,
        model: row.get(15)?,
        metadata: parse_json(&row.get::<_, String>(16)?),
        prev_hash: row.get(17)?,
        hash: row.get(18)?,
    })
}

const TRACE_COLUMNS: &str = "id, session_id, agent_id, timestamp, action_type, action_name, \
     request_body, response_body, status, policy_name, policy_reason, tokens_in, tokens_out, \
     cost_usd, latency_ms, model, metadata, prev_hash, hash";

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        started_at: parse_ts(&row.get::<_, String>(2)?)?,
        ended_at: row
            .get::<_, Option<String>>(3)?
            .map(|raw| parse_ts(&raw))
            .transpose()?,
        status: parse_enum(&row.get::<_, String>(4)?)?,
        total_cost: row.get(5)?,
        action_count: row.get::<_, i64>(6)? as u64,
        score: row.get(7)?,
        metadata: parse_json(&row.get::<_, String>(8)?),
    })
}

fn approval_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Approval> {
    Ok(Approval {
        id: row.get(0)?,
        session_id: row.get(1)?,
        trace_id: row.get(2)?,
        policy_name: row.get(3)?,
        action_summary: row.get(4)?,
        status: parse_enum(&row.get::<_, String>(5)?)?,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
        timeout_at: parse_ts(&row.get::<_, String>(7)?)?,
        resolved_at: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_ts(&raw))
            .transpose()?,
        resolved_by: row.get(9)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_trace(&self, trace: &Trace) -> Result<()> {
        let t = trace.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO traces (id, session_id, agent_id, timestamp, action_type, \
                 action_name, request_body, response_body, status, policy_name, policy_reason, \
                 tokens_in, tokens_out, cost_usd, latency_ms, model, metadata, prev_hash, hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    t.id,
                    t.session_id,
                    t.agent_id,
                    fmt_ts(&t.timestamp),
                    t.action_type.as_str(),
                    t.action_name,
                    t.request_body,
                    t.response_body,
                    t.status.as_str(),
                    t.policy_name,
                    t.policy_reason,
                    t.tokens_in as i64,
                    t.tokens_out as i64,
                    t.cost_usd,
                    t.latency_ms as i64,
                    t.model,
                    t.metadata.to_string(),
                    t.prev_hash,
                    t.hash,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_trace(&self, id: &str) -> Result<Option<Trace>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {TRACE_COLUMNS} FROM traces WHERE id = ?1"),
                params![id],
                trace_from_row,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn list_traces(&self, filter: &TraceFilter) -> Result<Vec<Trace>> {
        let filter = filter.clone();
        self.blocking(move |conn| {
            let mut query = format!("SELECT {TRACE_COLUMNS} FROM traces WHERE 1=1");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(session_id) = &filter.session_id {
                query.push_str(" AND session_id = ?");
                args.push(Box::new(session_id.clone()));
            }
            if let Some(agent_id) = &filter.agent_id {
                query.push_str(" AND agent_id = ?");
                args.push(Box::new(agent_id.clone()));
            }
            if let Some(action_type) = &filter.action_type {
                query.push_str(" AND action_type = ?");
                args.push(Box::new(action_type.as_str().to_string()));
            }
            if let Some(status) = &filter.status {
                query.push_str(" AND status = ?");
                args.push(Box::new(status.as_str().to_string()));
            }
            if let Some(since) = &filter.since {
                query.push_str(" AND timestamp >= ?");
                args.push(Box::new(fmt_ts(since)));
            }
            if let Some(until) = &filter.until {
                query.push_str(" AND timestamp <= ?");
                args.push(Box::new(fmt_ts(until)));
            }
            query.push_str(" ORDER BY timestamp ASC, id ASC");
            if let Some(limit) = filter.limit {
                query.push_str(&format!(" LIMIT {limit}"));
                if let Some(offset) = filter.offset {
                    query.push_str(&format!(" OFFSET {offset}"));
                }
            } else if let Some(offset) = filter.offset {
                query.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
            }

            let mut stmt = conn.prepare(&query).map_err(db_err)?;
            let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
            let traces = stmt
                .query_map(&arg_refs[..], trace_from_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(traces)
        })
        .await
    }

    async fn search_traces(&self, query: &str, limit: usize) -> Result<Vec<Trace>> {
        let needle = format!("%{}%", query.to_lowercase());
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TRACE_COLUMNS} FROM traces WHERE lower(action_name) LIKE ?1 \
                     OR lower(request_body) LIKE ?1 OR lower(response_body) LIKE ?1 \
                     ORDER BY timestamp DESC LIMIT ?2"
                ))
                .map_err(db_err)?;
            let traces = stmt
                .query_map(params![needle, limit as i64], trace_from_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(traces)
        })
        .await
    }

    async fn upsert_session(&self, session: &Session) -> Result<()> {
        let s = session.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, agent_id, started_at, ended_at, status, total_cost, \
                 action_count, score, metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(id) DO UPDATE SET agent_id = ?2, ended_at = ?4, status = ?5, \
                 total_cost = ?6, action_count = ?7, score = ?8, metadata = ?9",
                params![
                    s.id,
                    s.agent_id,
                    fmt_ts(&s.started_at),
                    s.ended_at.as_ref().map(fmt_ts),
                    s.status.as_str(),
                    s.total_cost,
                    s.action_count as i64,
                    s.score,
                    s.metadata.to_string(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT id, agent_id, started_at, ended_at, status, total_cost, action_count, \
                 score, metadata FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let filter = filter.clone();
        self.blocking(move |conn| {
            let mut query = "SELECT id, agent_id, started_at, ended_at, status, total_cost, \
                 action_count, score, metadata FROM sessions WHERE 1=1"
                .to_string();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(agent_id) = &filter.agent_id {
                query.push_str(" AND agent_id = ?");
                args.push(Box::new(agent_id.clone()));
            }
            if let Some(status) = &filter.status {
                query.push_str(" AND status = ?");
                args.push(Box::new(status.as_str().to_string()));
            }
            query.push_str(" ORDER BY started_at DESC");
            if let Some(limit) = filter.limit {
                query.push_str(&format!(" LIMIT {limit}"));
                if let Some(offset) = filter.offset {
                    query.push_str(&format!(" OFFSET {offset}"));
                }
            }

            let mut stmt = conn.prepare(&query).map_err(db_err)?;
            let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
            let sessions = stmt
                .query_map(&arg_refs[..], session_from_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(sessions)
        })
        .await
    }

    async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let current: SessionStatus = match current {
                Some(raw) => parse_enum(&raw).map_err(db_err)?,
                None => return Err(Error::store(format!("session not found: {id}"))),
            };
            if !current.can_transition_to(status) {
                return Err(Error::store(format!(
                    "session {id} is {current} and cannot become {status}"
                )));
            }
            let ended_at = status.is_terminal().then(|| fmt_ts(&Utc::now()));
            conn.execute(
                "UPDATE sessions SET status = ?2, ended_at = COALESCE(?3, ended_at) WHERE id = ?1",
                params![id, status.as_str(), ended_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn update_session_cost(&self, id: &str, cost: f64, action_count: u64) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE sessions SET total_cost = total_cost + ?2, \
                     action_count = action_count + ?3 WHERE id = ?1",
                    params![id, cost, action_count as i64],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(Error::store(format!("session not found: {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn score_session(&self, id: &str, score: f64) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE sessions SET score = ?2 WHERE id = ?1",
                    params![id, score],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(Error::store(format!("session not found: {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let a = agent.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO agents (id, name, created_at, current_version, config, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(id) DO UPDATE SET name = ?2, current_version = ?4, config = ?5, \
                 metadata = ?6",
                params![
                    a.id,
                    a.name,
                    fmt_ts(&a.created_at),
                    a.current_version,
                    a.config.to_string(),
                    a.metadata.to_string(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT id, name, created_at, current_version, config, metadata \
                 FROM agents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Agent {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: parse_ts(&row.get::<_, String>(2)?)?,
                        current_version: row.get(3)?,
                        config: parse_json(&row.get::<_, String>(4)?),
                        metadata: parse_json(&row.get::<_, String>(5)?),
                    })
                },
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, created_at, current_version, config, metadata \
                     FROM agents ORDER BY id",
                )
                .map_err(db_err)?;
            let agents = stmt
                .query_map([], |row| {
                    Ok(Agent {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: parse_ts(&row.get::<_, String>(2)?)?,
                        current_version: row.get(3)?,
                        config: parse_json(&row.get::<_, String>(4)?),
                        metadata: parse_json(&row.get::<_, String>(5)?),
                    })
                })
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(agents)
        })
        .await
    }

    async fn get_agent_stats(&self, id: &str) -> Result<AgentStats> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let (total_sessions, total_cost): (i64, f64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(total_cost), 0) FROM sessions \
                     WHERE agent_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(db_err)?;
            let total_actions: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM traces WHERE agent_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            let violation_count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM violations WHERE agent_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(AgentStats {
                agent_id: id,
                total_sessions: total_sessions as u64,
                total_actions: total_actions as u64,
                total_cost,
                violation_count: violation_count as u64,
            })
        })
        .await
    }

    async fn insert_agent_version(&self, version: &AgentVersion) -> Result<()> {
        let v = version.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            if v.status == AgentVersionStatus::Active {
                tx.execute(
                    "UPDATE agent_versions SET status = 'retired' \
                     WHERE agent_id = ?1 AND status = 'active'",
                    params![v.agent_id],
                )
                .map_err(db_err)?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO agent_versions (agent_id, version_number, status, \
                 system_prompt, config, diff_from_prev, diff_reason, shadow_results, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    v.agent_id,
                    v.version_number,
                    v.status.as_str(),
                    v.system_prompt,
                    v.config.to_string(),
                    v.diff_from_prev,
                    v.diff_reason,
                    v.shadow_results.to_string(),
                    fmt_ts(&v.created_at),
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_agent_version(
        &self,
        agent_id: &str,
        version: u32,
    ) -> Result<Option<AgentVersion>> {
        let agent_id = agent_id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT agent_id, version_number, status, system_prompt, config, diff_from_prev, \
                 diff_reason, shadow_results, created_at FROM agent_versions \
                 WHERE agent_id = ?1 AND version_number = ?2",
                params![agent_id, version],
                version_from_row,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn list_agent_versions(&self, agent_id: &str) -> Result<Vec<AgentVersion>> {
        let agent_id = agent_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT agent_id, version_number, status, system_prompt, config, \
                     diff_from_prev, diff_reason, shadow_results, created_at \
                     FROM agent_versions WHERE agent_id = ?1 ORDER BY version_number",
                )
                .map_err(db_err)?;
            let versions = stmt
                .query_map(params![agent_id], version_from_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(versions)
        })
        .await
    }

    async fn insert_approval(&self, approval: &Approval) -> Result<()> {
        let a = approval.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO approvals (id, session_id, trace_id, policy_name, action_summary, \
                 status, created_at, timeout_at, resolved_at, resolved_by) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    a.id,
                    a.session_id,
                    a.trace_id,
                    a.policy_name,
                    a.action_summary,
                    a.status.as_str(),
                    fmt_ts(&a.created_at),
                    fmt_ts(&a.timeout_at),
                    a.resolved_at.as_ref().map(fmt_ts),
                    a.resolved_by,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_approval(&self, id: &str) -> Result<Option<Approval>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT id, session_id, trace_id, policy_name, action_summary, status, \
                 created_at, timeout_at, resolved_at, resolved_by FROM approvals WHERE id = ?1",
                params![id],
                approval_from_row,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn list_pending_approvals(&self) -> Result<Vec<Approval>> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, trace_id, policy_name, action_summary, status, \
                     created_at, timeout_at, resolved_at, resolved_by FROM approvals \
                     WHERE status = 'pending' ORDER BY created_at",
                )
                .map_err(db_err)?;
            let approvals = stmt
                .query_map([], approval_from_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(approvals)
        })
        .await
    }

    async fn resolve_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        resolved_by: &str,
    ) -> Result<()> {
        let id = id.to_string();
        let resolved_by = resolved_by.to_string();
        self.blocking(move |conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM approvals WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let current: ApprovalStatus = match current {
                Some(raw) => parse_enum(&raw).map_err(db_err)?,
                None => return Err(Error::ApprovalUnknown(id)),
            };
            if current == status {
                return Ok(());
            }
            if current != ApprovalStatus::Pending {
                return Err(Error::ApprovalUnknown(id));
            }
            conn.execute(
                "UPDATE approvals SET status = ?2, resolved_at = ?3, resolved_by = ?4 \
                 WHERE id = ?1",
                params![id, status.as_str(), fmt_ts(&Utc::now()), resolved_by],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn insert_violation(&self, violation: &Violation) -> Result<()> {
        let v = violation.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO violations (id, trace_id, session_id, agent_id, policy_name, \
                 effect, reason, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    v.id,
                    v.trace_id,
                    v.session_id,
                    v.agent_id,
                    v.policy_name,
                    v.effect,
                    v.reason,
                    fmt_ts(&v.created_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn list_violations(
        &self,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Violation>> {
        let session_id = session_id.map(str::to_string);
        self.blocking(move |conn| {
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Violation> {
                Ok(Violation {
                    id: row.get(0)?,
                    trace_id: row.get(1)?,
                    session_id: row.get(2)?,
                    agent_id: row.get(3)?,
                    policy_name: row.get(4)?,
                    effect: row.get(5)?,
                    reason: row.get(6)?,
                    created_at: parse_ts(&row.get::<_, String>(7)?)?,
                })
            };
            let base = "SELECT id, trace_id, session_id, agent_id, policy_name, effect, reason, \
                 created_at FROM violations";
            let violations = match session_id {
                Some(sid) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "{base} WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2"
                        ))
                        .map_err(db_err)?;
                    let rows = stmt
                        .query_map(params![sid, limit as i64], map_row)
                        .map_err(db_err)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(db_err)?;
                    rows
                }
                None => {
                    let mut stmt = conn
                        .prepare(&format!("{base} ORDER BY created_at DESC LIMIT ?1"))
                        .map_err(db_err)?;
                    let rows = stmt
                        .query_map(params![limit as i64], map_row)
                        .map_err(db_err)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(db_err)?;
                    rows
                }
            };
            Ok(violations)
        })
        .await
    }

    async fn prune_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = fmt_ts(&(Utc::now() - Duration::days(days as i64)));
        self.blocking(move |conn| {
            let deleted = conn
                .execute("DELETE FROM traces WHERE timestamp < ?1", params![cutoff])
                .map_err(db_err)?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn verify_hash_chain(&self, session_id: &str) -> Result<ChainVerification> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TRACE_COLUMNS} FROM traces WHERE session_id = ?1 \
                     ORDER BY timestamp ASC, id ASC"
                ))
                .map_err(db_err)?;
            let traces = stmt
                .query_map(params![session_id], trace_from_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(verify_chain(&session_id, &traces))
        })
        .await
    }

    async fn get_system_stats(&self) -> Result<SystemStats> {
        self.blocking(move |conn| {
            let count = |conn: &Connection, sql: &str| -> Result<i64> {
                conn.query_row(sql, [], |row| row.get(0)).map_err(db_err)
            };
            let total_cost: f64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(total_cost), 0) FROM sessions",
                    [],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(SystemStats {
                total_traces: count(conn, "SELECT COUNT(*) FROM traces")? as u64,
                total_sessions: count(conn, "SELECT COUNT(*) FROM sessions")? as u64,
                active_sessions: count(
                    conn,
                    "SELECT COUNT(*) FROM sessions WHERE status = 'active'",
                )? as u64,
                total_violations: count(conn, "SELECT COUNT(*) FROM violations")? as u64,
                total_cost,
                pending_approvals: count(
                    conn,
                    "SELECT COUNT(*) FROM approvals WHERE status = 'pending'",
                )? as u64,
            })
        })
        .await
    }
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentVersion> {
    Ok(AgentVersion {
        agent_id: row.get(0)?,
        version_number: row.get(1)?,
        status: parse_enum(&row.get::<_, String>(2)?)?,
        system_prompt: row.get(3)?,
        config: parse_json(&row.get::<_, String>(4)?),
        diff_from_prev: row.get(5)?,
        diff_reason: row.get(6)?,
        shadow_results: parse_json(&row.get::<_, String>(7)?),
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

//! End-to-end pipeline tests against the in-memory store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use agent_warden_core::config::{PolicyConfig, PolicyType, WardenConfig};
use agent_warden_core::traits::Store;
use agent_warden_core::types::{
    ActionContext, ActionInfo, ActionType, AgentInfo, Effect, SessionInfo, SessionStatus,
    TimeoutEffect, TraceFilter, TraceStatus,
};
use agent_warden_governance::capability::{AgentCapabilities, FilesystemCapability};
use agent_warden_runtime::{KillTarget, Warden};
use agent_warden_store::MemoryStore;

fn ctx(
    session: &str,
    agent: &str,
    kind: ActionType,
    name: &str,
    params: serde_json::Value,
) -> ActionContext {
    ActionContext::new(
        ActionInfo {
            kind,
            name: name.into(),
            params,
            target: String::new(),
        },
        SessionInfo {
            id: session.into(),
            cost: 0.0,
            action_count: 0,
            duration_seconds: 0.0,
        },
        AgentInfo {
            id: agent.into(),
            name: agent.into(),
            version: "1".into(),
        },
    )
}

fn policy(name: &str, condition: &str, effect: Effect) -> PolicyConfig {
    PolicyConfig {
        name: name.into(),
        condition: condition.into(),
        effect,
        message: String::new(),
        policy_type: PolicyType::Deterministic,
        delay_ms: 0,
        prompt: String::new(),
        model: String::new(),
        context_doc: String::new(),
        approvers: vec![],
        timeout_seconds: 300,
        timeout_effect: TimeoutEffect::Deny,
    }
}

fn warden_with(config: WardenConfig) -> (Arc<Warden>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let warden = Warden::new(config, store.clone(), None);
    (warden, store)
}

#[tokio::test]
async fn allowed_actions_build_a_verifiable_chain() {
    let (warden, store) = warden_with(WardenConfig::default());
    let cancel = CancellationToken::new();

    for i in 0..5 {
        let verdict = warden
            .evaluate(
                &ctx(
                    "s-1",
                    "agent-1",
                    ActionType::ToolCall,
                    "shell",
                    serde_json::json!({"command": format!("echo {i}"), "cost_usd": 0.01}),
                ),
                &cancel,
            )
            .await;
        assert_eq!(verdict.effect, Effect::Allow);
    }

    let result = store.verify_hash_chain("s-1").await.unwrap();
    assert!(result.valid, "broken at {}", result.broken_index);

    let session = store.get_session("s-1").await.unwrap().unwrap();
    assert_eq!(session.action_count, 5);
    assert!((session.total_cost - 0.05).abs() < 1e-9);
    assert_eq!(session.status, SessionStatus::Active);

    // The agent row was auto-registered on first contact.
    assert!(store.get_agent("agent-1").await.unwrap().is_some());
}

#[tokio::test]
async fn policy_denial_records_a_violation_and_chains_the_trace() {
    let mut config = WardenConfig::default();
    config.policies = vec![
        policy("deny-expensive", "session.cost > 10.0", Effect::Deny),
        policy("allow-everything", "true", Effect::Allow),
    ];
    let (warden, store) = warden_with(config);
    let cancel = CancellationToken::new();

    let mut expensive = ctx(
        "s-1",
        "agent-1",
        ActionType::LlmChat,
        "chat",
        serde_json::json!({}),
    );
    expensive.session.cost = 12.0;
    let verdict = warden.evaluate(&expensive, &cancel).await;
    assert_eq!(verdict.effect, Effect::Deny);

    let mut cheap = expensive.clone();
    cheap.session.cost = 5.0;
    assert_eq!(warden.evaluate(&cheap, &cancel).await.effect, Effect::Allow);

    let violations = store.list_violations(Some("s-1"), 10).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].policy_name, "deny-expensive");

    // Denied and allowed traces share one chain.
    let traces = store
        .list_traces(&TraceFilter::for_session("s-1"))
        .await
        .unwrap();
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0].status, TraceStatus::Denied);
    assert_eq!(traces[1].status, TraceStatus::Allowed);
    assert!(store.verify_hash_chain("s-1").await.unwrap().valid);
}

#[tokio::test]
async fn terminate_policy_ends_the_session() {
    let mut config = WardenConfig::default();
    config.policies = vec![policy(
        "kill-financial",
        "action.type == \"financial.transfer\"",
        Effect::Terminate,
    )];
    let (warden, store) = warden_with(config);

    let verdict = warden
        .evaluate(
            &ctx(
                "s-1",
                "agent-1",
                ActionType::FinancialTransfer,
                "transfer",
                serde_json::json!({"amount": 10.0}),
            ),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(verdict.effect, Effect::Terminate);

    let session = store.get_session("s-1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Terminated);
    assert!(session.ended_at.is_some());
}

#[tokio::test]
async fn capability_boundary_overrides_everything() {
    let (warden, store) = warden_with(WardenConfig::default());
    warden.capabilities().set(
        "agent-1",
        AgentCapabilities {
            filesystem: FilesystemCapability {
                allowed_paths: vec!["/data/**".into()],
                ..Default::default()
            },
            ..Default::default()
        },
    );

    let cancel = CancellationToken::new();
    let allowed = warden
        .evaluate(
            &ctx(
                "s-1",
                "agent-1",
                ActionType::FileRead,
                "read_file",
                serde_json::json!({"path": "/data/report.csv"}),
            ),
            &cancel,
        )
        .await;
    assert_eq!(allowed.effect, Effect::Allow);

    let denied = warden
        .evaluate(
            &ctx(
                "s-1",
                "agent-1",
                ActionType::FileRead,
                "read_file",
                serde_json::json!({"path": "/etc/passwd"}),
            ),
            &cancel,
        )
        .await;
    assert_eq!(denied.effect, Effect::Deny);

    // An unregistered agent is not constrained.
    let ghost = warden
        .evaluate(
            &ctx(
                "s-2",
                "ghost",
                ActionType::FileRead,
                "read_file",
                serde_json::json!({"path": "/etc/passwd"}),
            ),
            &cancel,
        )
        .await;
    assert_eq!(ghost.effect, Effect::Allow);

    let violations = store.list_violations(Some("s-1"), 10).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].policy_name, "capability");
}

#[tokio::test]
async fn spawn_requests_flow_through_the_governor() {
    let mut config = WardenConfig::default();
    config.spawn.max_depth = 2;
    config.spawn.child_budget_max = 0.0;
    let (warden, _store) = warden_with(config);
    warden.spawn_governor().register_root("root", 100.0);
    let cancel = CancellationToken::new();

    let spawn = |parent: &str, child: &str| {
        ctx(
            "s-1",
            parent,
            ActionType::AgentSpawn,
            "spawn",
            serde_json::json!({"child_id": child}),
        )
    };

    assert_eq!(
        warden.evaluate(&spawn("root", "child"), &cancel).await.effect,
        Effect::Allow
    );
    assert_eq!(
        warden
            .evaluate(&spawn("child", "grandchild"), &cancel)
            .await
            .effect,
        Effect::Allow
    );
    let verdict = warden
        .evaluate(&spawn("grandchild", "too-deep"), &cancel)
        .await;
    assert_eq!(verdict.effect, Effect::Deny);
    assert!(verdict.message.contains("depth"));
}

#[tokio::test]
async fn kill_cascades_and_terminates_sessions() {
    let mut config = WardenConfig::default();
    config.spawn.child_budget_max = 0.0;
    let (warden, store) = warden_with(config);
    let governor = warden.spawn_governor();
    governor.register_root("root", 100.0);
    assert!(governor.request_spawn("root", "A", 0.0).allowed);
    assert!(governor.request_spawn("A", "A1", 0.0).allowed);
    assert!(governor.request_spawn("root", "B", 0.0).allowed);

    // Give each agent a live session.
    let cancel = CancellationToken::new();
    for agent in ["root", "A", "A1", "B"] {
        warden
            .evaluate(
                &ctx(
                    &format!("s-{agent}"),
                    agent,
                    ActionType::LlmChat,
                    "chat",
                    serde_json::json!({}),
                ),
                &cancel,
            )
            .await;
    }

    let killed = warden.kill(KillTarget::Agent("root".into())).await.unwrap();
    assert_eq!(killed.len(), 4);
    assert_eq!(governor.agent_count(), 0);
    for agent in ["root", "A", "A1", "B"] {
        let session = store.get_session(&format!("s-{agent}")).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Terminated, "{agent}");
    }
}

#[tokio::test]
async fn messaging_rate_limit_applies_per_agent() {
    let mut config = WardenConfig::default();
    config
        .messaging
        .rate_limits
        .insert("whatsapp".into(), "5/hour".into());
    let (warden, _store) = warden_with(config);
    let cancel = CancellationToken::new();

    let message = |agent: &str, i: usize| {
        ctx(
            &format!("s-{agent}"),
            agent,
            ActionType::MessageSend,
            "send",
            serde_json::json!({"channel": "whatsapp", "content": format!("update {i}")}),
        )
    };

    for i in 0..5 {
        assert_eq!(
            warden.evaluate(&message("agent-1", i), &cancel).await.effect,
            Effect::Allow
        );
    }
    let sixth = warden.evaluate(&message("agent-1", 5), &cancel).await;
    assert_eq!(sixth.effect, Effect::Deny);
    assert!(sixth.message.contains("rate limit"));

    // A different agent is unaffected.
    assert_eq!(
        warden.evaluate(&message("agent-2", 0), &cancel).await.effect,
        Effect::Allow
    );
}

#[tokio::test]
async fn throttle_policy_delays_but_allows() {
    let mut config = WardenConfig::default();
    let mut slow = policy("slow-down", "true", Effect::Throttle);
    slow.delay_ms = 200;
    config.policies = vec![slow];
    let (warden, _store) = warden_with(config);

    let started = Instant::now();
    let verdict = warden
        .evaluate(
            &ctx(
                "s-1",
                "agent-1",
                ActionType::ToolCall,
                "shell",
                serde_json::json!({"command": "ls"}),
            ),
            &CancellationToken::new(),
        )
        .await;
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(verdict.effect, Effect::Allow);
    assert_eq!(verdict.delay_ms, 200);
}

#[tokio::test]
async fn approval_policy_blocks_until_resolved() {
    let mut config = WardenConfig::default();
    let mut gate = policy("hitl", "action.type == \"financial.transfer\"", Effect::Approve);
    gate.timeout_seconds = 10;
    config.policies = vec![gate];
    let (warden, store) = warden_with(config);

    let resolver_queue = warden.approvals();
    tokio::spawn(async move {
        loop {
            let ids = resolver_queue.pending_ids();
            if let Some(id) = ids.first() {
                resolver_queue.resolve(id, true, "alice").await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let verdict = warden
        .evaluate(
            &ctx(
                "s-1",
                "agent-1",
                ActionType::FinancialTransfer,
                "transfer",
                serde_json::json!({"amount": 25.0}),
            ),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(verdict.effect, Effect::Allow);

    let traces = store
        .list_traces(&TraceFilter::for_session("s-1"))
        .await
        .unwrap();
    assert_eq!(traces[0].status, TraceStatus::Approved);
}

#[tokio::test]
async fn loop_detection_pauses_the_session() {
    let mut config = WardenConfig::default();
    config.detection.loop_detection.threshold = 2;
    config.detection.loop_detection.window_seconds = 60;
    config.detection.loop_detection.action =
        agent_warden_core::types::EnforcementAction::Pause;
    let (warden, store) = warden_with(config);
    let cancel = CancellationToken::new();

    let repeated = ctx(
        "s-1",
        "agent-1",
        ActionType::ToolCall,
        "shell",
        serde_json::json!({"command": "retry-the-same-thing"}),
    );
    for _ in 0..3 {
        warden.evaluate(&repeated, &cancel).await;
    }
    // Detection runs off the hot path.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let session = store.get_session("s-1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Paused);
}

#[tokio::test]
async fn fail_mode_decides_what_errors_do() {
    struct DownStore;

    #[async_trait::async_trait]
    impl Store for DownStore {
        async fn insert_trace(&self, _: &agent_warden_core::types::Trace) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn get_trace(&self, _: &str) -> agent_warden_core::Result<Option<agent_warden_core::types::Trace>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn list_traces(&self, _: &TraceFilter) -> agent_warden_core::Result<Vec<agent_warden_core::types::Trace>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn search_traces(&self, _: &str, _: usize) -> agent_warden_core::Result<Vec<agent_warden_core::types::Trace>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn upsert_session(&self, _: &agent_warden_core::types::Session) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn get_session(&self, _: &str) -> agent_warden_core::Result<Option<agent_warden_core::types::Session>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn list_sessions(&self, _: &agent_warden_core::types::SessionFilter) -> agent_warden_core::Result<Vec<agent_warden_core::types::Session>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn update_session_status(&self, _: &str, _: SessionStatus) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn update_session_cost(&self, _: &str, _: f64, _: u64) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn score_session(&self, _: &str, _: f64) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn upsert_agent(&self, _: &agent_warden_core::types::Agent) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn get_agent(&self, _: &str) -> agent_warden_core::Result<Option<agent_warden_core::types::Agent>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn list_agents(&self) -> agent_warden_core::Result<Vec<agent_warden_core::types::Agent>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn get_agent_stats(&self, _: &str) -> agent_warden_core::Result<agent_warden_core::types::AgentStats> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn insert_agent_version(&self, _: &agent_warden_core::types::AgentVersion) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn get_agent_version(&self, _: &str, _: u32) -> agent_warden_core::Result<Option<agent_warden_core::types::AgentVersion>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn list_agent_versions(&self, _: &str) -> agent_warden_core::Result<Vec<agent_warden_core::types::AgentVersion>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn insert_approval(&self, _: &agent_warden_core::types::Approval) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn get_approval(&self, _: &str) -> agent_warden_core::Result<Option<agent_warden_core::types::Approval>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn list_pending_approvals(&self) -> agent_warden_core::Result<Vec<agent_warden_core::types::Approval>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn resolve_approval(&self, _: &str, _: agent_warden_core::types::ApprovalStatus, _: &str) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn insert_violation(&self, _: &agent_warden_core::types::Violation) -> agent_warden_core::Result<()> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn list_violations(&self, _: Option<&str>, _: usize) -> agent_warden_core::Result<Vec<agent_warden_core::types::Violation>> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn prune_older_than(&self, _: u32) -> agent_warden_core::Result<u64> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn verify_hash_chain(&self, _: &str) -> agent_warden_core::Result<agent_warden_core::ChainVerification> {
            Err(agent_warden_core::Error::store("db down"))
        }
        async fn get_system_stats(&self) -> agent_warden_core::Result<agent_warden_core::types::SystemStats> {
            Err(agent_warden_core::Error::store("db down"))
        }
    }

    let action = ctx(
        "s-1",
        "agent-1",
        ActionType::ToolCall,
        "shell",
        serde_json::json!({"command": "ls"}),
    );
    let cancel = CancellationToken::new();

    // Closed (default): the store failure denies the action.
    let warden = Warden::new(WardenConfig::default(), Arc::new(DownStore), None);
    let verdict = warden.evaluate(&action, &cancel).await;
    assert_eq!(verdict.effect, Effect::Deny);
    assert!(verdict.message.contains("store_unavailable"));

    // Open: the same failure allows with the error kind in the message.
    let mut config = WardenConfig::default();
    config.server.fail_mode = agent_warden_core::config::FailMode::Open;
    let warden = Warden::new(config, Arc::new(DownStore), None);
    let verdict = warden.evaluate(&action, &cancel).await;
    assert_eq!(verdict.effect, Effect::Allow);
    assert!(verdict.message.contains("store_unavailable"));
}

#[tokio::test]
async fn reload_swaps_policies_atomically() {
    let (warden, _store) = warden_with(WardenConfig::default());
    let cancel = CancellationToken::new();
    let action = ctx(
        "s-1",
        "agent-1",
        ActionType::ToolCall,
        "shell",
        serde_json::json!({"command": "ls"}),
    );

    assert_eq!(warden.evaluate(&action, &cancel).await.effect, Effect::Allow);

    let mut stricter = WardenConfig::default();
    stricter.policies = vec![policy(
        "deny-shell",
        "action.type == \"tool.call\"",
        Effect::Deny,
    )];
    warden.reload(stricter);

    assert_eq!(warden.evaluate(&action, &cancel).await.effect, Effect::Deny);
}

#[tokio::test]
async fn lifecycle_start_stop_is_clean() {
    let (warden, _store) = warden_with(WardenConfig::default());
    warden.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    warden.stop().await;
}

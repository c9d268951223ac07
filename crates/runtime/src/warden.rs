//! The governance facade.
//!
//! One `Warden` per process. `evaluate` runs the full decision pipeline for
//! one action: capability boundary, ordered policies, spawn/messaging gates,
//! hash-chained trace recording, then asynchronous behavioral detection.
//! Infrastructure failures follow the configured fail-mode: closed denies,
//! open allows with a warning.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use agent_warden_core::config::{FailMode, WardenConfig};
use agent_warden_core::traits::{LlmClient, Store};
use agent_warden_core::types::{
    ActionContext, ActionEvent, ActionType, Agent, Alert, AlertSeverity, DetectionEvent,
    DetectionType, Effect, EnforcementAction, Session, SessionFilter, SessionStatus, Trace,
    TraceFilter, TraceStatus, Verdict, Violation,
};
use agent_warden_core::{action_signature, session_seed, Error, Result};
use agent_warden_detection::{DetectionEngine, PlaybookExecutor};
use agent_warden_governance::policy::load_policy_dir;
use agent_warden_governance::{
    AlertManager, ApprovalQueue, CapabilityEngine, MessagingInterceptor, PolicyEngine,
    SpawnGovernor,
};

const ALERT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Target of a kill switch request.
#[derive(Debug, Clone)]
pub enum KillTarget {
    Agent(String),
    Session(String),
    All,
}

/// The core facade handed to adapters.
pub struct Warden {
    config: Arc<RwLock<WardenConfig>>,
    store: Arc<dyn Store>,
    capabilities: Arc<CapabilityEngine>,
    policies: RwLock<Arc<PolicyEngine>>,
    approvals: Arc<ApprovalQueue>,
    alerts: Arc<AlertManager>,
    spawn_governor: Arc<SpawnGovernor>,
    messaging: Arc<MessagingInterceptor>,
    detection: Arc<DetectionEngine>,
    llm: Option<Arc<dyn LlmClient>>,
    /// Last chain hash per session; the store is the fallback on warm start.
    chain_tips: DashMap<String, String>,
    /// Serializes seal+insert per session so linkage follows insertion order.
    session_lanes: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn assemble_policies(config: &WardenConfig) -> Vec<agent_warden_core::config::PolicyConfig> {
    let mut policies = config.policies.clone();
    if !config.policies_dir.is_empty() {
        policies.extend(load_policy_dir(&config.policies_dir));
    }
    policies
}

fn playbook_params(config: &WardenConfig, kind: DetectionType) -> (String, EnforcementAction) {
    let d = &config.detection;
    match kind {
        DetectionType::Loop => (d.loop_detection.playbook_model.clone(), d.loop_detection.fallback_action),
        DetectionType::Velocity => (d.velocity.playbook_model.clone(), d.velocity.fallback_action),
        DetectionType::CostAnomaly => (d.cost_anomaly.playbook_model.clone(), d.cost_anomaly.fallback_action),
        DetectionType::Spiral => (d.spiral.playbook_model.clone(), d.spiral.fallback_action),
        DetectionType::Drift => (d.drift.playbook_model.clone(), d.drift.fallback_action),
        DetectionType::PromptInjection => (d.injection.playbook_model.clone(), d.injection.fallback_action),
    }
}

impl Warden {
    pub fn new(
        config: WardenConfig,
        store: Arc<dyn Store>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Arc<Self> {
        let alerts = Arc::new(AlertManager::from_config(&config.alerts));
        let approvals = Arc::new(ApprovalQueue::new(store.clone(), alerts.clone()));

        let capabilities = Arc::new(CapabilityEngine::new());
        if !config.agents_dir.is_empty() {
            let loaded = capabilities.load_dir(&config.agents_dir);
            tracing::info!(count = loaded, "loaded capability documents");
        }

        let policies = Arc::new(PolicyEngine::new(
            assemble_policies(&config),
            approvals.clone(),
            llm.clone(),
        ));
        let spawn_governor = Arc::new(SpawnGovernor::new(config.spawn.clone()));
        let messaging = Arc::new(MessagingInterceptor::new(config.messaging.clone()));
        let detection = Arc::new(DetectionEngine::new(&config.detection));
        let playbooks = Arc::new(PlaybookExecutor::new(
            config.playbooks_dir.clone(),
            llm.clone(),
        ));

        let config = Arc::new(RwLock::new(config));
        detection.set_handler(detection_handler(
            store.clone(),
            alerts.clone(),
            playbooks,
            config.clone(),
        ));

        Arc::new(Self {
            config,
            store,
            capabilities,
            policies: RwLock::new(policies),
            approvals,
            alerts,
            spawn_governor,
            messaging,
            detection,
            llm,
            chain_tips: DashMap::new(),
            session_lanes: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Launch the background tasks: approval sweeper, alert dedup pruner,
    /// and trace retention enforcement.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.approvals.clone().spawn_sweeper(self.cancel.clone()));

        let alerts = self.alerts.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ALERT_PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => alerts.prune_dedup(),
                    _ = cancel.cancelled() => break,
                }
            }
        }));

        let retention_days = self.config.read().unwrap().storage.retention_days;
        if retention_days > 0 {
            let store = self.store.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match store.prune_older_than(retention_days).await {
                                Ok(0) => {}
                                Ok(n) => tracing::info!(pruned = n, "trace retention applied"),
                                Err(e) => tracing::warn!(error = %e, "retention pruning failed"),
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }
        tracing::info!("warden background tasks started");
    }

    /// Stop background tasks; pending in-memory approvals are lost by design.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("warden stopped");
    }

    /// Swap the configuration atomically; detectors and policies rebuild,
    /// spawn-tree and messaging state survive.
    pub fn reload(&self, new_config: WardenConfig) {
        self.detection.update_config(&new_config.detection);
        *self.policies.write().unwrap() = Arc::new(PolicyEngine::new(
            assemble_policies(&new_config),
            self.approvals.clone(),
            self.llm.clone(),
        ));
        if !new_config.agents_dir.is_empty() {
            self.capabilities.load_dir(&new_config.agents_dir);
        }
        *self.config.write().unwrap() = new_config;
        tracing::info!("configuration reloaded");
    }

    // =========================================================================
    // Evaluation pipeline
    // =========================================================================

    /// Decide one action. Never panics and never returns an error: failures
    /// collapse into the configured fail-mode verdict.
    pub async fn evaluate(&self, ctx: &ActionContext, cancel: &CancellationToken) -> Verdict {
        let verdict = match self.evaluate_inner(ctx, cancel).await {
            Ok(verdict) => verdict,
            Err(e) => self.apply_fail_mode(ctx, e).await,
        };
        metrics::counter!("warden_actions_total", "effect" => verdict.effect.as_str())
            .increment(1);
        verdict
    }

    async fn evaluate_inner(
        &self,
        ctx: &ActionContext,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        let params_json = ctx.action.params.to_string();
        let mut trace = Trace::new(
            &ctx.session.id,
            &ctx.agent.id,
            ctx.action.kind,
            &ctx.action.name,
        )
        .with_request(params_json.clone());

        // 1. Capability boundary.
        let gate = self.capabilities.check(&ctx.agent.id, ctx);
        if !gate.allowed {
            return self
                .block(trace, ctx, "capability", &gate.reason, Effect::Deny)
                .await;
        }

        // 2. Ordered policies (may block on approvals and judge calls).
        let engine = self.policies.read().unwrap().clone();
        let decision = engine.evaluate(ctx, &trace.id, cancel).await?;
        if decision.effect.is_blocking() {
            return self
                .block(trace, ctx, &decision.policy_name, &decision.reason, decision.effect)
                .await;
        }

        // 3. Spawn governor.
        if ctx.action.kind == ActionType::AgentSpawn {
            let child_id = match ctx.param_str("child_id") {
                "" => ctx.param_str("agent_id").to_string(),
                id => id.to_string(),
            };
            let gate = self.spawn_governor.request_spawn(
                &ctx.agent.id,
                &child_id,
                ctx.param_f64("budget"),
            );
            if !gate.allowed {
                return self
                    .block(trace, ctx, "spawn_governor", &gate.reason, Effect::Deny)
                    .await;
            }
        }

        // 4. Outbound-message gate.
        if ctx.action.kind.is_message() {
            let channel = match ctx.param_str("channel") {
                "" => ctx.action.target.clone(),
                c => c.to_string(),
            };
            let gate =
                self.messaging
                    .evaluate(&ctx.agent.id, &channel, ctx.param_str("content"));
            if !gate.allowed {
                return self
                    .block(trace, ctx, "messaging", &gate.reason, Effect::Deny)
                    .await;
            }
        }

        // 5. Record the allowed action into the chain.
        trace.status = if decision.via_approval {
            TraceStatus::Approved
        } else if decision.delay_ms > 0 {
            TraceStatus::Throttled
        } else {
            TraceStatus::Allowed
        };
        if !decision.policy_name.is_empty() {
            trace.policy_name = decision.policy_name.clone();
            trace.policy_reason = decision.reason.clone();
        }
        trace.tokens_in = ctx.param_f64("tokens_in") as u64;
        trace.tokens_out = ctx.param_f64("tokens_out") as u64;
        trace.cost_usd = ctx.param_f64("cost_usd");
        trace.model = ctx.param_str("model").to_string();
        let trace = self.commit_trace(trace, ctx).await?;

        // 6. Behavioral detection, off the hot path.
        let event = ActionEvent {
            session_id: ctx.session.id.clone(),
            agent_id: ctx.agent.id.clone(),
            action_type: ctx.action.kind,
            action_name: ctx.action.name.clone(),
            signature: action_signature(ctx.action.kind.as_str(), &ctx.action.name, &params_json),
            cost_usd: trace.cost_usd,
            content: ctx.param_str("content").to_string(),
        };
        let detection = self.detection.clone();
        tokio::spawn(async move {
            detection.analyze(&event);
        });

        Ok(Verdict {
            effect: Effect::Allow,
            message: decision.reason,
            delay_ms: decision.delay_ms,
        })
    }

    /// Deny/terminate path: trace, violation, session status, verdict.
    async fn block(
        &self,
        mut trace: Trace,
        ctx: &ActionContext,
        policy_name: &str,
        reason: &str,
        effect: Effect,
    ) -> Result<Verdict> {
        trace.status = if effect == Effect::Terminate {
            TraceStatus::Terminated
        } else {
            TraceStatus::Denied
        };
        trace.policy_name = policy_name.to_string();
        trace.policy_reason = reason.to_string();
        let trace = self.commit_trace(trace, ctx).await?;

        let violation = Violation::new(
            &trace.id,
            &ctx.session.id,
            &ctx.agent.id,
            policy_name,
            effect.as_str(),
            reason,
        );
        self.store.insert_violation(&violation).await?;

        if effect == Effect::Terminate {
            self.store
                .update_session_status(&ctx.session.id, SessionStatus::Terminated)
                .await?;
            self.detection.reset_session(&ctx.session.id);
            return Ok(Verdict::terminate(reason));
        }
        Ok(Verdict::deny(reason))
    }

    /// Seal and insert under the session's lane so linkage follows insertion
    /// order even under parallel entry.
    async fn commit_trace(&self, mut trace: Trace, ctx: &ActionContext) -> Result<Trace> {
        let lane = self
            .session_lanes
            .entry(trace.session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lane.lock().await;

        self.ensure_session(ctx).await?;
        let tip = match self.chain_tips.get(&trace.session_id) {
            Some(tip) => tip.clone(),
            None => {
                // Warm start: pick the chain up where the store left it.
                let stored = self
                    .store
                    .list_traces(&TraceFilter::for_session(&trace.session_id))
                    .await?;
                stored
                    .last()
                    .map(|t| t.hash.clone())
                    .unwrap_or_else(|| session_seed(&trace.session_id))
            }
        };
        trace.seal(tip);
        self.store.insert_trace(&trace).await?;
        self.chain_tips
            .insert(trace.session_id.clone(), trace.hash.clone());
        self.store
            .update_session_cost(&trace.session_id, trace.cost_usd, 1)
            .await?;
        Ok(trace)
    }

    async fn ensure_session(&self, ctx: &ActionContext) -> Result<()> {
        if self.chain_tips.contains_key(&ctx.session.id) {
            return Ok(());
        }
        if self.store.get_session(&ctx.session.id).await?.is_none() {
            self.store
                .upsert_session(&Session::new(&ctx.session.id, &ctx.agent.id))
                .await?;
        }
        if self.store.get_agent(&ctx.agent.id).await?.is_none() {
            let name = if ctx.agent.name.is_empty() {
                ctx.agent.id.clone()
            } else {
                ctx.agent.name.clone()
            };
            self.store
                .upsert_agent(&Agent::new(&ctx.agent.id, name))
                .await?;
        }
        Ok(())
    }

    async fn apply_fail_mode(&self, ctx: &ActionContext, error: Error) -> Verdict {
        let fail_mode = self.config.read().unwrap().server.fail_mode;
        let message = format!("{}: {error}", error.kind());
        match fail_mode {
            FailMode::Closed => {
                tracing::error!(error = %error, session_id = %ctx.session.id, "evaluation failed, denying (fail-closed)");
                // Best effort: the store may be the thing that is down.
                let violation = Violation::new(
                    "",
                    &ctx.session.id,
                    &ctx.agent.id,
                    "fail_mode",
                    "error",
                    &message,
                );
                if let Err(e) = self.store.insert_violation(&violation).await {
                    tracing::warn!(error = %e, "could not record fail-mode violation");
                }
                Verdict::deny(message)
            }
            FailMode::Open => {
                tracing::warn!(error = %error, session_id = %ctx.session.id, "evaluation failed, allowing (fail-open)");
                Verdict {
                    effect: Effect::Allow,
                    message,
                    delay_ms: 0,
                }
            }
        }
    }

    // =========================================================================
    // Kill switch & accounting
    // =========================================================================

    /// Kill an agent (with its spawn subtree), a session, or everything.
    pub async fn kill(&self, target: KillTarget) -> Result<Vec<String>> {
        match target {
            KillTarget::Agent(agent_id) => {
                let mut killed = self.spawn_governor.kill_agent(&agent_id);
                if killed.is_empty() {
                    killed.push(agent_id);
                }
                for agent in &killed {
                    self.terminate_agent_sessions(agent).await?;
                }
                Ok(killed)
            }
            KillTarget::Session(session_id) => {
                self.store
                    .update_session_status(&session_id, SessionStatus::Terminated)
                    .await?;
                self.detection.reset_session(&session_id);
                Ok(vec![session_id])
            }
            KillTarget::All => {
                let mut killed: Vec<String> =
                    self.spawn_governor.get_tree().into_keys().collect();
                killed.sort();
                for agent in &killed {
                    self.spawn_governor.kill_agent(agent);
                }
                let active = self
                    .store
                    .list_sessions(&SessionFilter {
                        status: Some(SessionStatus::Active),
                        ..Default::default()
                    })
                    .await?;
                for session in active {
                    self.store
                        .update_session_status(&session.id, SessionStatus::Terminated)
                        .await?;
                    self.detection.reset_session(&session.id);
                }
                Ok(killed)
            }
        }
    }

    async fn terminate_agent_sessions(&self, agent_id: &str) -> Result<()> {
        let sessions = self
            .store
            .list_sessions(&SessionFilter {
                agent_id: Some(agent_id.to_string()),
                status: Some(SessionStatus::Active),
                ..Default::default()
            })
            .await?;
        for session in sessions {
            self.store
                .update_session_status(&session.id, SessionStatus::Terminated)
                .await?;
            self.detection.reset_session(&session.id);
        }
        Ok(())
    }

    /// Fold LLM spend reported by the adapter into session accounting.
    pub async fn record_llm_usage(
        &self,
        session_id: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
    ) -> Result<()> {
        metrics::counter!("warden_tokens_total", "direction" => "in").increment(tokens_in);
        metrics::counter!("warden_tokens_total", "direction" => "out").increment(tokens_out);
        self.store.update_session_cost(session_id, cost, 0).await
    }

    // =========================================================================
    // Component access for adapters and management surfaces
    // =========================================================================

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn approvals(&self) -> Arc<ApprovalQueue> {
        self.approvals.clone()
    }

    pub fn capabilities(&self) -> Arc<CapabilityEngine> {
        self.capabilities.clone()
    }

    pub fn spawn_governor(&self) -> Arc<SpawnGovernor> {
        self.spawn_governor.clone()
    }

    pub fn detection(&self) -> Arc<DetectionEngine> {
        self.detection.clone()
    }

    pub fn alerts(&self) -> Arc<AlertManager> {
        self.alerts.clone()
    }
}

/// Handler wired into the detection engine: map the event's enforcement
/// action (running the playbook when asked), apply it, and alert.
fn detection_handler(
    store: Arc<dyn Store>,
    alerts: Arc<AlertManager>,
    playbooks: Arc<PlaybookExecutor>,
    config: Arc<RwLock<WardenConfig>>,
) -> agent_warden_detection::EventHandler {
    Arc::new(move |event: DetectionEvent| {
        let store = store.clone();
        let alerts = alerts.clone();
        let playbooks = playbooks.clone();
        let (playbook_model, fallback) = playbook_params(&config.read().unwrap(), event.kind);
        tokio::spawn(async move {
            handle_detection(store, alerts, playbooks, playbook_model, fallback, event).await;
        });
    })
}

async fn handle_detection(
    store: Arc<dyn Store>,
    alerts: Arc<AlertManager>,
    playbooks: Arc<PlaybookExecutor>,
    playbook_model: String,
    fallback: EnforcementAction,
    event: DetectionEvent,
) {
    metrics::counter!("warden_detections_total", "kind" => event.kind.as_str()).increment(1);

    let mut action = event.action;
    let mut reason = event.message.clone();
    if action == EnforcementAction::Playbook {
        let decision = playbooks.execute(&event, &playbook_model, fallback).await;
        match decision.action {
            Some(resolved) => {
                action = resolved;
                if !decision.reason.is_empty() {
                    reason = decision.reason;
                }
            }
            None => {
                // Playbook chose to let the session continue; alert only.
                action = EnforcementAction::Alert;
            }
        }
    }

    match action {
        EnforcementAction::Pause => {
            if !event.session_id.is_empty() {
                if let Err(e) = store
                    .update_session_status(&event.session_id, SessionStatus::Paused)
                    .await
                {
                    tracing::warn!(error = %e, "could not pause session");
                }
            }
        }
        EnforcementAction::Terminate => {
            if !event.session_id.is_empty() {
                if let Err(e) = store
                    .update_session_status(&event.session_id, SessionStatus::Terminated)
                    .await
                {
                    tracing::warn!(error = %e, "could not terminate session");
                }
            }
        }
        EnforcementAction::Alert | EnforcementAction::Backoff | EnforcementAction::Playbook => {}
    }

    let severity = if action == EnforcementAction::Terminate {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    };
    let alert = Alert::from_detection(&event, severity).with_details(serde_json::json!({
        "enforcement": action.as_str(),
        "reason": reason,
        "original": event.details,
    }));
    alerts.send(alert);
}

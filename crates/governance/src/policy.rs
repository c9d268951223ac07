//! Ordered policy evaluation.
//!
//! Policies run in declared order. The first matching non-allow policy
//! produces the verdict; matching allow policies keep evaluating, so
//! explicit allow-listing is written as denies-before-allows. Deterministic
//! conditions run in a sandboxed expression language; `ai-judge` policies
//! consult an LLM instead.

use std::sync::Arc;
use std::time::Duration;

use evalexpr::{
    eval_boolean_with_context, ContextWithMutableFunctions, ContextWithMutableVariables, Function,
    HashMapContext, Value as ExprValue,
};
use tokio_util::sync::CancellationToken;

use agent_warden_core::config::{PolicyConfig, PolicyType};
use agent_warden_core::traits::{ChatRequest, LlmClient};
use agent_warden_core::types::{ActionContext, ApprovalRequest, Effect};
use agent_warden_core::{Error, Result};
use agent_warden_llm::{parse_verdict, JudgeVerdict};

use crate::approval::ApprovalQueue;

const DEFAULT_JUDGE_MODEL: &str = "gpt-4o-mini";

/// Outcome of evaluating one action against the policy set.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub effect: Effect,
    pub policy_name: String,
    pub reason: String,
    /// Non-zero when a throttle policy delayed the action.
    pub delay_ms: u64,
    /// True when the decision came out of the approval queue.
    pub via_approval: bool,
}

impl PolicyDecision {
    fn allow_default() -> Self {
        Self {
            effect: Effect::Allow,
            policy_name: String::new(),
            reason: String::new(),
            delay_ms: 0,
            via_approval: false,
        }
    }
}

/// The ordered policy evaluator.
pub struct PolicyEngine {
    policies: Vec<PolicyConfig>,
    approvals: Arc<ApprovalQueue>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl PolicyEngine {
    pub fn new(
        policies: Vec<PolicyConfig>,
        approvals: Arc<ApprovalQueue>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        Self {
            policies,
            approvals,
            llm,
        }
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.name.clone()).collect()
    }

    /// Evaluate the policy set against one action.
    pub async fn evaluate(
        &self,
        ctx: &ActionContext,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PolicyDecision> {
        for policy in &self.policies {
            let matched_reason = match policy.policy_type {
                PolicyType::Deterministic => {
                    if eval_condition(&policy.condition, ctx)
                        .map_err(|e| Error::policy_eval(&policy.name, e.to_string()))?
                    {
                        Some(format!("condition matched: {}", policy.condition))
                    } else {
                        None
                    }
                }
                PolicyType::AiJudge => {
                    let verdict = self.consult_judge(policy, ctx, cancel).await?;
                    if verdict.action == "allow" {
                        None
                    } else {
                        Some(judge_reason(&verdict))
                    }
                }
            };

            let Some(fallback_reason) = matched_reason else {
                continue;
            };
            let reason = if policy.message.is_empty() {
                fallback_reason
            } else {
                policy.message.clone()
            };

            match policy.effect {
                Effect::Allow => continue,
                Effect::Deny | Effect::Terminate => {
                    tracing::info!(policy = %policy.name, effect = %policy.effect, %reason, "policy matched");
                    return Ok(PolicyDecision {
                        effect: policy.effect,
                        policy_name: policy.name.clone(),
                        reason,
                        delay_ms: 0,
                        via_approval: false,
                    });
                }
                Effect::Throttle => {
                    tracing::debug!(policy = %policy.name, delay_ms = policy.delay_ms, "throttling");
                    tokio::time::sleep(Duration::from_millis(policy.delay_ms)).await;
                    return Ok(PolicyDecision {
                        effect: Effect::Allow,
                        policy_name: policy.name.clone(),
                        reason,
                        delay_ms: policy.delay_ms,
                        via_approval: false,
                    });
                }
                Effect::Approve => {
                    let request = ApprovalRequest {
                        session_id: ctx.session.id.clone(),
                        trace_id: trace_id.to_string(),
                        agent_id: ctx.agent.id.clone(),
                        policy_name: policy.name.clone(),
                        action_summary: format!(
                            "{} {} by {}",
                            ctx.action.kind, ctx.action.name, ctx.agent.id
                        ),
                        approvers: policy.approvers.clone(),
                        timeout: Duration::from_secs(policy.timeout_seconds),
                        timeout_effect: policy.timeout_effect,
                    };
                    let approved = self.approvals.submit(request, cancel).await?;
                    return Ok(PolicyDecision {
                        effect: if approved { Effect::Allow } else { Effect::Deny },
                        policy_name: policy.name.clone(),
                        reason: if approved {
                            "approved".to_string()
                        } else {
                            format!("approval denied or timed out: {reason}")
                        },
                        delay_ms: 0,
                        via_approval: true,
                    });
                }
            }
        }
        Ok(PolicyDecision::allow_default())
    }

    async fn consult_judge(
        &self,
        policy: &PolicyConfig,
        ctx: &ActionContext,
        cancel: &CancellationToken,
    ) -> Result<JudgeVerdict> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| Error::judge("no LLM client configured"))?;

        let mut system = policy.prompt.clone();
        if !policy.context_doc.is_empty() {
            system.push_str("\n\n");
            system.push_str(&policy.context_doc);
        }
        system.push_str(
            "\n\nRespond with a single JSON object: \
             {\"action\": \"allow|pause|terminate|alert|backoff\", \
             \"reason\": \"...\", \"confidence\": 0.0}",
        );
        let model = if policy.model.is_empty() {
            DEFAULT_JUDGE_MODEL
        } else {
            policy.model.as_str()
        };
        let request = ChatRequest::new(model, system, serde_json::to_string_pretty(ctx)?);

        let content = tokio::select! {
            result = llm.chat(&request) => result?,
            _ = cancel.cancelled() => {
                return Err(Error::CancelRequested(format!(
                    "judge call for policy '{}' abandoned", policy.name
                )));
            }
        };
        parse_verdict(&content)
    }
}

fn judge_reason(verdict: &JudgeVerdict) -> String {
    if verdict.reason.is_empty() {
        format!("judge verdict: {}", verdict.action)
    } else {
        format!(
            "judge verdict: {} ({}, confidence {:.2})",
            verdict.action, verdict.reason, verdict.confidence
        )
    }
}

/// Load additional policy documents from a directory of YAML files, each a
/// list of policies; files merge in filename order after the inline set.
pub fn load_policy_dir(dir: impl AsRef<std::path::Path>) -> Vec<PolicyConfig> {
    let dir = dir.as_ref();
    let mut files: Vec<std::path::PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "policy dir unreadable");
            return vec![];
        }
    };
    files.sort();

    let mut policies = Vec::new();
    for path in files {
        match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_yaml::from_str::<Vec<PolicyConfig>>(&raw).map_err(|e| e.to_string()))
        {
            Ok(mut loaded) => policies.append(&mut loaded),
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping policy document"),
        }
    }
    policies
}

// =============================================================================
// Condition language
// =============================================================================

/// Evaluate a deterministic condition against the action context.
///
/// The expression sees dotted variables (`action.type`, `session.cost`,
/// `agent.id`, `now`, flattened `action.params.*`) plus `contains`,
/// `starts_with`, `ends_with` and `one_of` helpers. The language is
/// sandboxed: no I/O, no side effects, no host access.
pub fn eval_condition(condition: &str, ctx: &ActionContext) -> Result<bool> {
    let context = build_context(ctx)?;
    eval_boolean_with_context(condition, &context)
        .map_err(|e| Error::internal(format!("condition error: {e}")))
}

fn build_context(ctx: &ActionContext) -> Result<HashMapContext> {
    let mut context = HashMapContext::new();
    let internal = |e: evalexpr::EvalexprError| Error::internal(e.to_string());

    context
        .set_value("action.type".into(), ExprValue::from(ctx.action.kind.as_str()))
        .map_err(internal)?;
    context
        .set_value("action.name".into(), ExprValue::from(ctx.action.name.as_str()))
        .map_err(internal)?;
    context
        .set_value(
            "action.target".into(),
            ExprValue::from(ctx.action.target.as_str()),
        )
        .map_err(internal)?;
    context
        .set_value("session.id".into(), ExprValue::from(ctx.session.id.as_str()))
        .map_err(internal)?;
    context
        .set_value("session.cost".into(), ExprValue::Float(ctx.session.cost))
        .map_err(internal)?;
    context
        .set_value(
            "session.action_count".into(),
            ExprValue::Int(ctx.session.action_count as i64),
        )
        .map_err(internal)?;
    context
        .set_value(
            "session.duration_seconds".into(),
            ExprValue::Float(ctx.session.duration_seconds),
        )
        .map_err(internal)?;
    context
        .set_value("agent.id".into(), ExprValue::from(ctx.agent.id.as_str()))
        .map_err(internal)?;
    context
        .set_value("agent.name".into(), ExprValue::from(ctx.agent.name.as_str()))
        .map_err(internal)?;
    context
        .set_value(
            "agent.version".into(),
            ExprValue::from(ctx.agent.version.as_str()),
        )
        .map_err(internal)?;
    context
        .set_value("now".into(), ExprValue::Int(ctx.now.timestamp()))
        .map_err(internal)?;

    if let Some(params) = ctx.action.params.as_object() {
        for (key, value) in params {
            let expr_value = match value {
                serde_json::Value::String(s) => ExprValue::from(s.as_str()),
                serde_json::Value::Number(n) => match n.as_f64() {
                    Some(f) => ExprValue::Float(f),
                    None => continue,
                },
                serde_json::Value::Bool(b) => ExprValue::from(*b),
                _ => continue,
            };
            context
                .set_value(format!("action.params.{key}"), expr_value)
                .map_err(internal)?;
        }
    }

    context
        .set_function(
            "contains".into(),
            Function::new(|argument| {
                let args = argument.as_fixed_len_tuple(2)?;
                let haystack = args[0].as_string()?;
                let needle = args[1].as_string()?;
                Ok(ExprValue::Boolean(haystack.contains(&needle)))
            }),
        )
        .map_err(internal)?;
    context
        .set_function(
            "starts_with".into(),
            Function::new(|argument| {
                let args = argument.as_fixed_len_tuple(2)?;
                let subject = args[0].as_string()?;
                let prefix = args[1].as_string()?;
                Ok(ExprValue::Boolean(subject.starts_with(&prefix)))
            }),
        )
        .map_err(internal)?;
    context
        .set_function(
            "ends_with".into(),
            Function::new(|argument| {
                let args = argument.as_fixed_len_tuple(2)?;
                let subject = args[0].as_string()?;
                let suffix = args[1].as_string()?;
                Ok(ExprValue::Boolean(subject.ends_with(&suffix)))
            }),
        )
        .map_err(internal)?;
    context
        .set_function(
            "one_of".into(),
            Function::new(|argument| {
                let args = argument.as_fixed_len_tuple(2)?;
                let subject = args[0].as_string()?;
                let list = args[1].as_string()?;
                Ok(ExprValue::Boolean(
                    list.split(',').any(|item| item.trim() == subject),
                ))
            }),
        )
        .map_err(internal)?;

    Ok(context)
}

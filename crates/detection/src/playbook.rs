//! Incident playbooks.
//!
//! When a detection's configured action is `playbook`, the executor loads
//! the named playbook document, asks the LLM to pick a response, and maps
//! the verdict onto an enforcement action. Every failure path falls back to
//! the detection's configured `fallback_action`.

use std::path::PathBuf;
use std::sync::Arc;

use agent_warden_core::traits::{ChatRequest, LlmClient};
use agent_warden_core::types::{DetectionEvent, DetectionType, EnforcementAction};
use agent_warden_core::{Error, Result};
use agent_warden_llm::parse_verdict;

const DEFAULT_PLAYBOOK_MODEL: &str = "gpt-4o-mini";

/// Playbook document name for a detection family, if one exists.
pub fn playbook_name(kind: DetectionType) -> Option<&'static str> {
    match kind {
        DetectionType::Loop => Some("LOOP"),
        DetectionType::Spiral => Some("SPIRAL"),
        DetectionType::CostAnomaly => Some("BUDGET_BREACH"),
        DetectionType::Drift => Some("DRIFT"),
        DetectionType::Velocity | DetectionType::PromptInjection => None,
    }
}

/// What the playbook decided. `action: None` means let the session continue.
#[derive(Debug, Clone)]
pub struct EnforcementDecision {
    pub action: Option<EnforcementAction>,
    pub reason: String,
    pub confidence: f64,
}

/// Loads playbook documents and turns detection events into enforcement
/// decisions via the LLM.
pub struct PlaybookExecutor {
    playbooks_dir: PathBuf,
    llm: Option<Arc<dyn LlmClient>>,
}

impl PlaybookExecutor {
    pub fn new(playbooks_dir: impl Into<PathBuf>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            playbooks_dir: playbooks_dir.into(),
            llm,
        }
    }

    fn load_playbook(&self, name: &str) -> Result<String> {
        let path = self.playbooks_dir.join(format!("{name}.md"));
        std::fs::read_to_string(&path)
            .map_err(|e| Error::internal(format!("playbook {} unreadable: {e}", path.display())))
    }

    async fn consult(
        &self,
        document: &str,
        event: &DetectionEvent,
        model: &str,
    ) -> Result<EnforcementDecision> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| Error::judge("no LLM client configured"))?;

        let system = format!(
            "{document}\n\nRespond with a single JSON object: \
             {{\"action\": \"allow|pause|terminate|alert|backoff\", \
             \"reason\": \"...\", \"confidence\": 0.0}}"
        );
        let model = if model.is_empty() {
            DEFAULT_PLAYBOOK_MODEL
        } else {
            model
        };
        let request = ChatRequest::new(model, system, serde_json::to_string_pretty(event)?);
        let verdict = parse_verdict(&llm.chat(&request).await?)?;

        let action = match verdict.action.as_str() {
            "allow" => None,
            "pause" => Some(EnforcementAction::Pause),
            "terminate" => Some(EnforcementAction::Terminate),
            "alert" => Some(EnforcementAction::Alert),
            "backoff" => Some(EnforcementAction::Backoff),
            other => {
                return Err(Error::judge(format!("unexpected playbook action '{other}'")));
            }
        };
        Ok(EnforcementDecision {
            action,
            reason: verdict.reason,
            confidence: verdict.confidence,
        })
    }

    /// Run the playbook for one event; on any failure, fall back.
    pub async fn execute(
        &self,
        event: &DetectionEvent,
        model: &str,
        fallback: EnforcementAction,
    ) -> EnforcementDecision {
        // `playbook` as its own fallback would loop; degrade it to an alert.
        let fallback = if fallback == EnforcementAction::Playbook {
            EnforcementAction::Alert
        } else {
            fallback
        };

        let outcome = match playbook_name(event.kind) {
            Some(name) => match self.load_playbook(name) {
                Ok(document) => self.consult(&document, event, model).await,
                Err(e) => Err(e),
            },
            None => Err(Error::internal(format!(
                "no playbook for detection type {}",
                event.kind
            ))),
        };

        match outcome {
            Ok(decision) => {
                tracing::info!(
                    kind = %event.kind,
                    action = ?decision.action,
                    confidence = decision.confidence,
                    "playbook verdict"
                );
                decision
            }
            Err(e) => {
                tracing::warn!(kind = %event.kind, error = %e, "playbook failed, using fallback");
                EnforcementDecision {
                    action: Some(fallback),
                    reason: format!("playbook fallback: {e}"),
                    confidence: 0.0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct ScriptedLlm {
        response: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _request: &ChatRequest) -> Result<String> {
            Ok(self.response.clone())
        }
    }

    fn event(kind: DetectionType) -> DetectionEvent {
        DetectionEvent {
            kind,
            session_id: "s-1".into(),
            agent_id: "agent-1".into(),
            action: EnforcementAction::Playbook,
            message: "looping".into(),
            details: serde_json::Value::Null,
        }
    }

    fn executor_with(dir: &std::path::Path, response: &str) -> PlaybookExecutor {
        PlaybookExecutor::new(
            dir,
            Some(Arc::new(ScriptedLlm {
                response: response.into(),
            })),
        )
    }

    #[tokio::test]
    async fn verdict_maps_to_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("LOOP.md"), "# Loop playbook\nBe strict.").unwrap();

        let executor = executor_with(
            dir.path(),
            r#"{"action": "terminate", "reason": "hopeless loop", "confidence": 0.95}"#,
        );
        let decision = executor
            .execute(&event(DetectionType::Loop), "", EnforcementAction::Alert)
            .await;
        assert_eq!(decision.action, Some(EnforcementAction::Terminate));
        assert_eq!(decision.reason, "hopeless loop");
    }

    #[tokio::test]
    async fn allow_verdict_means_no_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SPIRAL.md"), "# Spiral playbook").unwrap();

        let executor = executor_with(dir.path(), r#"{"action": "allow", "confidence": 0.6}"#);
        let decision = executor
            .execute(&event(DetectionType::Spiral), "", EnforcementAction::Pause)
            .await;
        assert_eq!(decision.action, None);
    }

    #[tokio::test]
    async fn missing_document_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_with(dir.path(), r#"{"action": "terminate"}"#);
        let decision = executor
            .execute(&event(DetectionType::Loop), "", EnforcementAction::Backoff)
            .await;
        assert_eq!(decision.action, Some(EnforcementAction::Backoff));
        assert!(decision.reason.contains("fallback"));
    }

    #[tokio::test]
    async fn garbage_verdict_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("DRIFT.md"), "# Drift playbook").unwrap();

        let executor = executor_with(dir.path(), "cannot comply");
        let decision = executor
            .execute(&event(DetectionType::Drift), "", EnforcementAction::Pause)
            .await;
        assert_eq!(decision.action, Some(EnforcementAction::Pause));
    }

    #[tokio::test]
    async fn playbookless_detection_type_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_with(dir.path(), r#"{"action": "allow"}"#);
        let decision = executor
            .execute(&event(DetectionType::Velocity), "", EnforcementAction::Alert)
            .await;
        assert_eq!(decision.action, Some(EnforcementAction::Alert));
    }

    #[tokio::test]
    async fn playbook_fallback_degrades_to_alert() {
        let dir = tempfile::tempdir().unwrap();
        let executor = PlaybookExecutor::new(dir.path(), None);
        let decision = executor
            .execute(&event(DetectionType::Loop), "", EnforcementAction::Playbook)
            .await;
        assert_eq!(decision.action, Some(EnforcementAction::Alert));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::ActionType;

// =============================================================================
// Detector input
// =============================================================================

/// The common event shape consumed by every behavioral detector.
#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub session_id: String,
    pub agent_id: String,
    pub action_type: ActionType,
    pub action_name: String,
    /// Identity of the action for repetition detection (type + name + params).
    pub signature: String,
    pub cost_usd: f64,
    /// LLM output or message content, when the action carries any.
    pub content: String,
}

// =============================================================================
// Detector output
// =============================================================================

/// Which detector family produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    Loop,
    Velocity,
    CostAnomaly,
    Spiral,
    Drift,
    PromptInjection,
}

impl DetectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loop => "loop",
            Self::Velocity => "velocity",
            Self::CostAnomaly => "cost_anomaly",
            Self::Spiral => "spiral",
            Self::Drift => "drift",
            Self::PromptInjection => "prompt_injection",
        }
    }
}

impl std::fmt::Display for DetectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enforcement applied when a detector fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    Pause,
    #[default]
    Alert,
    Terminate,
    Backoff,
    Playbook,
}

impl EnforcementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Alert => "alert",
            Self::Terminate => "terminate",
            Self::Backoff => "backoff",
            Self::Playbook => "playbook",
        }
    }
}

/// An anomaly emitted by a detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(rename = "type")]
    pub kind: DetectionType,
    pub session_id: String,
    pub agent_id: String,
    /// Configured enforcement for this detector.
    pub action: EnforcementAction,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

// =============================================================================
// Alerts
// =============================================================================

/// Alert severity for sinks and violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deduplicated notification fanned out to external sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Stable type string, e.g. `loop_detected`, `approval_required`.
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: impl Into<String>, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            severity,
            message: message.into(),
            agent_id: String::new(),
            session_id: String::new(),
            details: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Dedup key: alerts with the same type/agent/session collapse inside the
    /// dedup TTL.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.kind, self.agent_id, self.session_id)
    }

    /// Build an alert from a detection event.
    pub fn from_detection(event: &DetectionEvent, severity: AlertSeverity) -> Self {
        Self::new(format!("{}_detected", event.kind), severity, event.message.clone())
            .with_agent(event.agent_id.clone())
            .with_session(event.session_id.clone())
            .with_details(event.details.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_info_to_critical() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Critical);
    }

    #[test]
    fn dedup_key_joins_type_agent_session() {
        let alert = Alert::new("loop_detected", AlertSeverity::Warning, "looping")
            .with_agent("agent-1")
            .with_session("s-1");
        assert_eq!(alert.dedup_key(), "loop_detected|agent-1|s-1");
    }
}

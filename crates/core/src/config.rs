//! Typed configuration bundle.
//!
//! The bundle is deserialized from YAML after `${NAME}` / `${NAME:-default}`
//! env substitution. Loading and hot reload are the configuration provider's
//! job; this module only defines the types, the substitution rule, and
//! validation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Effect, EnforcementAction, TimeoutEffect};

/// Behavior when policy/capability/store evaluation itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Errors deny the in-flight action.
    #[default]
    Closed,
    /// Errors allow the in-flight action with a logged warning.
    Open,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub grpc_port: u16,
    pub dashboard: bool,
    pub log_level: String,
    pub cors: Vec<String>,
    pub fail_mode: FailMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8420,
            grpc_port: 8421,
            dashboard: false,
            log_level: "info".into(),
            cors: vec![],
            fail_mode: FailMode::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `sqlite` or `memory`.
    pub driver: String,
    pub path: String,
    pub connection: String,
    /// Trace/session retention in days; 0 disables pruning.
    #[serde(rename = "retention")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".into(),
            path: "warden.db".into(),
            connection: String::new(),
            retention_days: 30,
        }
    }
}

// =============================================================================
// Policies
// =============================================================================

/// Deterministic expression policy or LLM judge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    #[default]
    #[serde(rename = "")]
    Deterministic,
    #[serde(rename = "ai-judge")]
    AiJudge,
}

/// One ordered policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    /// Expression over `action`/`session`/`agent`/`now`; unused for judges.
    #[serde(default)]
    pub condition: String,
    pub effect: Effect,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub policy_type: PolicyType,
    /// Throttle delay in milliseconds.
    #[serde(default, alias = "delay")]
    pub delay_ms: u64,
    /// Judge prompt.
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    /// Extra grounding document passed to the judge.
    #[serde(default)]
    pub context_doc: String,
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Approval timeout in seconds.
    #[serde(default = "default_approval_timeout", alias = "timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub timeout_effect: TimeoutEffect,
}

fn default_approval_timeout() -> u64 {
    300
}

// =============================================================================
// Detection
// =============================================================================

macro_rules! detector_defaults {
    ($name:ident { $($field:ident: $ty:ty = $value:expr),* $(,)? }) => {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            pub enabled: bool,
            $(pub $field: $ty,)*
            pub action: EnforcementAction,
            pub fallback_action: EnforcementAction,
            pub playbook_model: String,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    enabled: true,
                    $($field: $value,)*
                    action: EnforcementAction::Alert,
                    fallback_action: EnforcementAction::Alert,
                    playbook_model: String::new(),
                }
            }
        }
    };
}

detector_defaults!(LoopConfig {
    threshold: usize = 5,
    window_seconds: u64 = 60,
});

detector_defaults!(VelocityConfig {
    threshold: usize = 10,
    sustained_seconds: u64 = 5,
});

detector_defaults!(CostAnomalyConfig {
    multiplier: f64 = 5.0,
});

detector_defaults!(SpiralConfig {
    window: usize = 3,
    similarity_threshold: f64 = 0.9,
});

detector_defaults!(DriftConfig {
    threshold: f64 = 0.5,
});

detector_defaults!(InjectionConfig {});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    #[serde(rename = "loop")]
    pub loop_detection: LoopConfig,
    pub velocity: VelocityConfig,
    pub cost_anomaly: CostAnomalyConfig,
    pub spiral: SpiralConfig,
    pub drift: DriftConfig,
    pub injection: InjectionConfig,
}

// =============================================================================
// Alerts & evolution
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub webhook_url: String,
    pub channel: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub slack: SlackConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub enabled: bool,
}

// =============================================================================
// Spawn & messaging governance
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    pub enabled: bool,
    pub max_children_per_agent: usize,
    pub max_depth: usize,
    pub max_global_agents: usize,
    pub cascade_kill: bool,
    /// Max child budget as a fraction of the parent's; 0 disables the check.
    pub child_budget_max: f64,
    pub require_approval: bool,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_children_per_agent: 5,
            max_depth: 3,
            max_global_agents: 50,
            cascade_kill: true,
            child_budget_max: 0.5,
            require_approval: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentScanConfig {
    pub block_credentials: bool,
    pub block_pii: bool,
}

impl Default for ContentScanConfig {
    fn default() -> Self {
        Self {
            block_credentials: true,
            block_pii: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Per-channel limits in `"N/hour"` form; unlisted channels get 50/hour.
    pub rate_limits: std::collections::HashMap<String, String>,
    pub content_scan: ContentScanConfig,
    pub require_approval: bool,
}

// =============================================================================
// Bundle
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub policies: Vec<PolicyConfig>,
    pub detection: DetectionConfig,
    pub evolution: EvolutionConfig,
    pub spawn: SpawnConfig,
    pub messaging: MessagingConfig,
    pub alerts: AlertsConfig,
    pub agents_dir: String,
    pub policies_dir: String,
    pub playbooks_dir: String,
}

impl WardenConfig {
    /// Parse a YAML document after env substitution.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let substituted = substitute_env(raw);
        let config: WardenConfig = serde_yaml::from_str(&substituted)
            .map_err(|e| Error::config(format!("YAML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for policy in &self.policies {
            if policy.name.is_empty() {
                return Err(Error::config("policy with empty name"));
            }
            if policy.policy_type == PolicyType::AiJudge && policy.prompt.is_empty() {
                return Err(Error::config(format!(
                    "ai-judge policy '{}' has no prompt",
                    policy.name
                )));
            }
            if policy.policy_type == PolicyType::Deterministic && policy.condition.is_empty() {
                return Err(Error::config(format!(
                    "policy '{}' has no condition",
                    policy.name
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${NAME}` and `${NAME:-default}`; unresolved variables expand to
/// the empty string.
pub fn substitute_env(raw: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("env substitution regex");
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        }
    })
    .into_owned()
}

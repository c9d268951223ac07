use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Action types
// =============================================================================

/// The closed set of intercepted action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "llm.chat")]
    LlmChat,
    #[serde(rename = "llm.embedding")]
    LlmEmbedding,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "api.request")]
    ApiRequest,
    #[serde(rename = "db.query")]
    DbQuery,
    #[serde(rename = "file.read")]
    FileRead,
    #[serde(rename = "file.write")]
    FileWrite,
    #[serde(rename = "file.delete")]
    FileDelete,
    #[serde(rename = "code.exec")]
    CodeExec,
    #[serde(rename = "mcp.tool")]
    McpTool,
    #[serde(rename = "message.send")]
    MessageSend,
    #[serde(rename = "message.broadcast")]
    MessageBroadcast,
    #[serde(rename = "web.navigate")]
    WebNavigate,
    #[serde(rename = "financial.transfer")]
    FinancialTransfer,
    #[serde(rename = "agent.spawn")]
    AgentSpawn,
}

impl ActionType {
    /// Wire-format name, e.g. `tool.call`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmChat => "llm.chat",
            Self::LlmEmbedding => "llm.embedding",
            Self::ToolCall => "tool.call",
            Self::ApiRequest => "api.request",
            Self::DbQuery => "db.query",
            Self::FileRead => "file.read",
            Self::FileWrite => "file.write",
            Self::FileDelete => "file.delete",
            Self::CodeExec => "code.exec",
            Self::McpTool => "mcp.tool",
            Self::MessageSend => "message.send",
            Self::MessageBroadcast => "message.broadcast",
            Self::WebNavigate => "web.navigate",
            Self::FinancialTransfer => "financial.transfer",
            Self::AgentSpawn => "agent.spawn",
        }
    }

    pub fn is_file_op(&self) -> bool {
        matches!(self, Self::FileRead | Self::FileWrite | Self::FileDelete)
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Self::MessageSend | Self::MessageBroadcast)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| crate::Error::internal(format!("unknown action type: {s}")))
    }
}

// =============================================================================
// Action context (adapter -> core)
// =============================================================================

/// The action under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInfo {
    /// Action type from the closed set.
    #[serde(rename = "type")]
    pub kind: ActionType,
    /// Concrete name (tool name, model name, channel, ...).
    pub name: String,
    /// Opaque parameters as supplied by the adapter.
    #[serde(default)]
    pub params: Value,
    /// Primary target of the action (path, domain, channel, recipient).
    #[serde(default)]
    pub target: String,
}

/// Session facts exposed to policy conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub action_count: u64,
    #[serde(default)]
    pub duration_seconds: f64,
}

/// Agent facts exposed to policy conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Everything the governance pipeline needs to decide one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContext {
    pub action: ActionInfo,
    pub session: SessionInfo,
    pub agent: AgentInfo,
    pub now: DateTime<Utc>,
}

impl ActionContext {
    pub fn new(action: ActionInfo, session: SessionInfo, agent: AgentInfo) -> Self {
        Self {
            action,
            session,
            agent,
            now: Utc::now(),
        }
    }

    /// String parameter lookup, empty when absent or non-string.
    pub fn param_str(&self, key: &str) -> &str {
        self.action
            .params
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Numeric parameter lookup, zero when absent.
    pub fn param_f64(&self, key: &str) -> f64 {
        self.action
            .params
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or_default()
    }
}

// =============================================================================
// Verdict (core -> adapter)
// =============================================================================

/// Enforcement effect of a verdict or policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
    Terminate,
    Throttle,
    Approve,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Terminate => "terminate",
            Self::Throttle => "throttle",
            Self::Approve => "approve",
        }
    }

    /// Deny and terminate block the action.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Deny | Self::Terminate)
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision returned to the adapter for a single action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub effect: Effect,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub delay_ms: u64,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            effect: Effect::Allow,
            message: String::new(),
            delay_ms: 0,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            effect: Effect::Deny,
            message: message.into(),
            delay_ms: 0,
        }
    }

    pub fn terminate(message: impl Into<String>) -> Self {
        Self {
            effect: Effect::Terminate,
            message: message.into(),
            delay_ms: 0,
        }
    }

    pub fn throttled(message: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            effect: Effect::Throttle,
            message: message.into(),
            delay_ms,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self.effect, Effect::Allow | Effect::Throttle)
    }
}

//! Error types for AgentWarden.

use thiserror::Error;

/// Result type alias using AgentWarden's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for AgentWarden.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    // =========================================================================
    // Storage
    // =========================================================================
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Hash chain broken at index {index}: {reason}")]
    ChainBroken { index: i64, reason: String },

    // =========================================================================
    // Policy & capability evaluation
    // =========================================================================
    #[error("Policy evaluation failed for '{policy}': {reason}")]
    PolicyEvalFailure { policy: String, reason: String },

    #[error("Judge unreachable: {0}")]
    JudgeUnreachable(String),

    #[error("Capability denied: {0}")]
    CapabilityDenied(String),

    // =========================================================================
    // Approvals
    // =========================================================================
    #[error("Approval timed out: {0}")]
    ApprovalTimeout(String),

    #[error("Approval not found or already resolved: {0}")]
    ApprovalUnknown(String),

    // =========================================================================
    // Rate & spawn limits
    // =========================================================================
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Spawn limit exceeded: {0}")]
    SpawnLimitExceeded(String),

    // =========================================================================
    // Cancellation & generic
    // =========================================================================
    #[error("Cancelled: {0}")]
    CancelRequested(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a policy evaluation error.
    pub fn policy_eval(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyEvalFailure {
            policy: policy.into(),
            reason: reason.into(),
        }
    }

    /// Create a judge error.
    pub fn judge(msg: impl Into<String>) -> Self {
        Self::JudgeUnreachable(msg.into())
    }

    /// Create a capability denial.
    pub fn capability(msg: impl Into<String>) -> Self {
        Self::CapabilityDenied(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable kind string used in verdict messages and violation records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::ChainBroken { .. } => "chain_broken",
            Self::PolicyEvalFailure { .. } => "policy_eval_failure",
            Self::JudgeUnreachable(_) => "judge_unreachable",
            Self::CapabilityDenied(_) => "capability_denied",
            Self::ApprovalTimeout(_) => "approval_timeout",
            Self::ApprovalUnknown(_) => "approval_unknown",
            Self::RateLimited(_) => "rate_limited",
            Self::SpawnLimitExceeded(_) => "spawn_limit_exceeded",
            Self::CancelRequested(_) => "cancel_requested",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

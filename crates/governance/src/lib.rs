#![deny(unused)]
//! Governance components for AgentWarden.
//!
//! This crate provides:
//! - Capability boundaries an agent's prompt cannot talk around
//! - Ordered policy evaluation (expression policies + LLM judges)
//! - The blocking human-approval queue
//! - Deduplicated alert fan-out
//! - Spawn-tree accounting with cascade kill
//! - The outbound-message gate

pub mod alerts;
pub mod approval;
pub mod capability;
pub mod messaging;
pub mod policy;
pub mod spawn;

pub use alerts::{AlertManager, SlackSender, WebhookSender};
pub use approval::ApprovalQueue;
pub use capability::{AgentCapabilities, CapabilityEngine};
pub use messaging::MessagingInterceptor;
pub use policy::{PolicyDecision, PolicyEngine};
pub use spawn::{AgentNode, SpawnGovernor};

use serde::{Deserialize, Serialize};

/// Decision returned by the capability, spawn and messaging gates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub allowed: bool,
    #[serde(default)]
    pub reason: String,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

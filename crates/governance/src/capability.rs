//! Per-agent capability boundaries.
//!
//! Capabilities are a-priori limits enforced before any policy runs: a
//! prompt-injected agent can change what it *asks* for, never what it is
//! *allowed* to do. Agents without a capability record are allowed
//! everything, so unregistered agents keep working during rollout.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use agent_warden_core::types::{ActionContext, ActionType};

use crate::GateDecision;

// =============================================================================
// Capability documents
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemCapability {
    pub read_only: bool,
    /// Globs; empty means any path.
    pub allowed_paths: Vec<String>,
    /// Globs; deny wins over allow.
    pub denied_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellCapability {
    pub enabled: bool,
    /// Base commands; empty means any command.
    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
    /// Substrings matched against the whole command line.
    pub blocked_patterns: Vec<String>,
}

impl Default for ShellCapability {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_commands: vec![],
            blocked_commands: vec![],
            blocked_patterns: vec![],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkCapability {
    /// Substring matches; empty means any domain.
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingCapability {
    /// Exact channel names; empty means any channel.
    pub allowed_channels: Vec<String>,
    pub blocked_channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinancialCapability {
    /// Zero disables financial actions entirely.
    pub max_transaction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnCapability {
    pub enabled: bool,
}

impl Default for SpawnCapability {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// The full boundary document for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCapabilities {
    pub filesystem: FilesystemCapability,
    pub network: NetworkCapability,
    pub shell: ShellCapability,
    pub messaging: MessagingCapability,
    pub financial: FinancialCapability,
    pub spawn: SpawnCapability,
}

// =============================================================================
// Matching helpers
// =============================================================================

/// Glob path matching with two special cases: a trailing `/**` is a plain
/// directory-prefix match, and unparseable patterns fall back to a prefix
/// match after stripping trailing `/**` or `/*`.
fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path.starts_with(prefix);
    }
    match glob::Pattern::new(pattern) {
        Ok(compiled) => compiled.matches(path),
        Err(_) => {
            let prefix = pattern.trim_end_matches("/**").trim_end_matches("/*");
            path.starts_with(prefix)
        }
    }
}

/// Base command of a shell line: last path segment of the first token, so
/// `/usr/bin/curl -s ...` and `curl -s ...` resolve identically.
fn base_command(command: &str) -> &str {
    command
        .split_whitespace()
        .next()
        .and_then(|token| token.rsplit('/').next())
        .unwrap_or_default()
}

// =============================================================================
// Engine
// =============================================================================

/// Maps agent ids to their capability documents and answers per-action checks.
#[derive(Default)]
pub struct CapabilityEngine {
    table: DashMap<String, AgentCapabilities>,
}

impl CapabilityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, agent_id: impl Into<String>, capabilities: AgentCapabilities) {
        self.table.insert(agent_id.into(), capabilities);
    }

    pub fn remove(&self, agent_id: &str) -> bool {
        self.table.remove(agent_id).is_some()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentCapabilities> {
        self.table.get(agent_id).map(|entry| entry.clone())
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Load capability documents from a directory of YAML files; the file
    /// stem is the agent id. Unreadable files are skipped with a warning.
    pub fn load_dir(&self, dir: impl AsRef<std::path::Path>) -> usize {
        let dir = dir.as_ref();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "capability dir unreadable");
                return 0;
            }
        };
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml")
                && path.extension().and_then(|e| e.to_str()) != Some("yml")
            {
                continue;
            }
            let Some(agent_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_yaml::from_str::<AgentCapabilities>(&raw).map_err(|e| e.to_string()))
            {
                Ok(capabilities) => {
                    self.set(agent_id, capabilities);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping capability document");
                }
            }
        }
        loaded
    }

    /// Check one action against the agent's boundary.
    ///
    /// Agents with no record are allowed; unknown action types are allowed.
    pub fn check(&self, agent_id: &str, ctx: &ActionContext) -> GateDecision {
        let Some(caps) = self.table.get(agent_id) else {
            return GateDecision::allow();
        };

        match ctx.action.kind {
            ActionType::FileRead | ActionType::FileWrite | ActionType::FileDelete => {
                self.check_filesystem(&caps.filesystem, ctx)
            }
            ActionType::ToolCall => self.check_shell(&caps.shell, ctx),
            ActionType::WebNavigate | ActionType::ApiRequest => {
                self.check_network(&caps.network, ctx)
            }
            ActionType::MessageSend | ActionType::MessageBroadcast => {
                self.check_messaging(&caps.messaging, ctx)
            }
            ActionType::FinancialTransfer => self.check_financial(&caps.financial, ctx),
            ActionType::AgentSpawn => {
                if caps.spawn.enabled {
                    // Tree-level limits are the spawn governor's job.
                    GateDecision::allow()
                } else {
                    GateDecision::deny(format!("agent {agent_id} may not spawn sub-agents"))
                }
            }
            _ => GateDecision::allow(),
        }
    }

    fn check_filesystem(&self, caps: &FilesystemCapability, ctx: &ActionContext) -> GateDecision {
        let path = match ctx.param_str("path") {
            "" => ctx.action.target.as_str(),
            p => p,
        };
        if caps.read_only && ctx.action.kind != ActionType::FileRead {
            return GateDecision::deny(format!(
                "filesystem is read-only, {} rejected",
                ctx.action.kind
            ));
        }
        for pattern in &caps.denied_paths {
            if path_matches(pattern, path) {
                return GateDecision::deny(format!("path {path} is denied by {pattern}"));
            }
        }
        if !caps.allowed_paths.is_empty()
            && !caps.allowed_paths.iter().any(|p| path_matches(p, path))
        {
            return GateDecision::deny(format!("path {path} is outside the allowed paths"));
        }
        GateDecision::allow()
    }

    fn check_shell(&self, caps: &ShellCapability, ctx: &ActionContext) -> GateDecision {
        if !caps.enabled {
            return GateDecision::deny("shell access is disabled");
        }
        let command = match ctx.param_str("command") {
            "" => ctx.action.target.as_str(),
            c => c,
        };
        let base = base_command(command);
        if caps.blocked_commands.iter().any(|b| b == base) {
            return GateDecision::deny(format!("command {base} is blocked"));
        }
        for pattern in &caps.blocked_patterns {
            if command.contains(pattern.as_str()) {
                return GateDecision::deny(format!("command matches blocked pattern {pattern:?}"));
            }
        }
        if !caps.allowed_commands.is_empty() && !caps.allowed_commands.iter().any(|a| a == base) {
            return GateDecision::deny(format!("command {base} is not in the allowed commands"));
        }
        GateDecision::allow()
    }

    fn check_network(&self, caps: &NetworkCapability, ctx: &ActionContext) -> GateDecision {
        let domain = match ctx.param_str("domain") {
            "" => ctx.action.target.as_str(),
            d => d,
        };
        if caps.blocked_domains.iter().any(|b| domain.contains(b.as_str())) {
            return GateDecision::deny(format!("domain {domain} is blocked"));
        }
        if !caps.allowed_domains.is_empty()
            && !caps.allowed_domains.iter().any(|a| domain.contains(a.as_str()))
        {
            return GateDecision::deny(format!("domain {domain} is not in the allowed domains"));
        }
        GateDecision::allow()
    }

    fn check_messaging(&self, caps: &MessagingCapability, ctx: &ActionContext) -> GateDecision {
        let channel = match ctx.param_str("channel") {
            "" => ctx.action.target.as_str(),
            c => c,
        };
        if caps.blocked_channels.iter().any(|b| b == channel) {
            return GateDecision::deny(format!("channel {channel} is blocked"));
        }
        if !caps.allowed_channels.is_empty()
            && !caps.allowed_channels.iter().any(|a| a == channel)
        {
            return GateDecision::deny(format!("channel {channel} is not in the allowed channels"));
        }
        GateDecision::allow()
    }

    fn check_financial(&self, caps: &FinancialCapability, ctx: &ActionContext) -> GateDecision {
        let amount = ctx.param_f64("amount");
        if caps.max_transaction == 0.0 {
            if amount > 0.0 {
                return GateDecision::deny("financial actions are disabled");
            }
            return GateDecision::allow();
        }
        if amount > caps.max_transaction {
            return GateDecision::deny(format!(
                "amount {amount} exceeds the per-transaction limit {}",
                caps.max_transaction
            ));
        }
        GateDecision::allow()
    }
}

//! Agent-tree accounting for `agent.spawn`.
//!
//! The governor owns every node; `parent_id` is a lookup key, not a
//! reference. Kill with cascade walks depth-first and reports children
//! before parents so callers can tear down leaves first.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agent_warden_core::config::SpawnConfig;

use crate::GateDecision;

/// One live agent in the spawn tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    pub agent_id: String,
    pub parent_id: Option<String>,
    /// 0 for roots; equals the edge count to the root.
    pub depth: usize,
    pub children: Vec<String>,
    pub budget: f64,
    pub created_at: DateTime<Utc>,
}

/// Spawn-tree governor; one per process.
pub struct SpawnGovernor {
    agents: Mutex<HashMap<String, AgentNode>>,
    config: SpawnConfig,
}

impl SpawnGovernor {
    pub fn new(config: SpawnConfig) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Register a top-level agent. Idempotent: re-registering is a no-op.
    pub fn register_root(&self, agent_id: impl Into<String>, budget: f64) {
        let agent_id = agent_id.into();
        let mut agents = self.agents.lock().unwrap();
        agents.entry(agent_id.clone()).or_insert_with(|| AgentNode {
            agent_id,
            parent_id: None,
            depth: 0,
            children: vec![],
            budget,
            created_at: Utc::now(),
        });
    }

    /// Decide one spawn request and, when allowed, record the child.
    pub fn request_spawn(
        &self,
        parent_id: &str,
        child_id: &str,
        requested_budget: f64,
    ) -> GateDecision {
        if !self.config.enabled {
            return GateDecision::deny("agent spawning is disabled");
        }

        let mut agents = self.agents.lock().unwrap();
        if agents.len() >= self.config.max_global_agents {
            return GateDecision::deny(format!(
                "global agent limit reached ({})",
                self.config.max_global_agents
            ));
        }

        // Unknown parents become zero-budget roots so adapters that never
        // registered their top-level agent still get tree accounting.
        if !agents.contains_key(parent_id) {
            agents.insert(
                parent_id.to_string(),
                AgentNode {
                    agent_id: parent_id.to_string(),
                    parent_id: None,
                    depth: 0,
                    children: vec![],
                    budget: 0.0,
                    created_at: Utc::now(),
                },
            );
        }

        let parent = agents.get(parent_id).expect("parent just ensured");
        let child_depth = parent.depth + 1;
        if child_depth > self.config.max_depth {
            return GateDecision::deny(format!(
                "spawn would exceed max depth {}",
                self.config.max_depth
            ));
        }
        if parent.children.len() >= self.config.max_children_per_agent {
            return GateDecision::deny(format!(
                "parent {parent_id} already has {} children",
                parent.children.len()
            ));
        }
        if self.config.child_budget_max > 0.0
            && requested_budget > parent.budget * self.config.child_budget_max
        {
            return GateDecision::deny(format!(
                "requested budget {requested_budget} exceeds {} of parent budget {}",
                self.config.child_budget_max, parent.budget
            ));
        }
        if self.config.require_approval {
            return GateDecision::deny("spawn requires human approval");
        }

        agents.insert(
            child_id.to_string(),
            AgentNode {
                agent_id: child_id.to_string(),
                parent_id: Some(parent_id.to_string()),
                depth: child_depth,
                children: vec![],
                budget: requested_budget,
                created_at: Utc::now(),
            },
        );
        let parent = agents.get_mut(parent_id).expect("parent just ensured");
        parent.children.push(child_id.to_string());

        tracing::info!(parent = parent_id, child = child_id, depth = child_depth, "spawn granted");
        GateDecision::allow()
    }

    /// Kill an agent. With cascade enabled, all descendants die too; the
    /// returned list is post-order (children before parents).
    pub fn kill_agent(&self, agent_id: &str) -> Vec<String> {
        let mut agents = self.agents.lock().unwrap();
        if !agents.contains_key(agent_id) {
            return vec![];
        }

        let mut killed = Vec::new();
        if self.config.cascade_kill {
            collect_post_order(&agents, agent_id, &mut killed);
        } else {
            killed.push(agent_id.to_string());
        }

        for id in &killed {
            if let Some(node) = agents.remove(id) {
                if let Some(parent_id) = node.parent_id {
                    if let Some(parent) = agents.get_mut(&parent_id) {
                        parent.children.retain(|c| c != id);
                    }
                }
            }
        }
        tracing::info!(agent = agent_id, count = killed.len(), "killed agents");
        killed
    }

    /// Deep copy of the subtree below (and excluding) the given agent.
    pub fn get_descendants(&self, agent_id: &str) -> Vec<AgentNode> {
        let agents = self.agents.lock().unwrap();
        let mut ids = Vec::new();
        collect_post_order(&agents, agent_id, &mut ids);
        ids.pop(); // drop the agent itself
        ids.iter().filter_map(|id| agents.get(id).cloned()).collect()
    }

    /// Deep copy of the whole tree.
    pub fn get_tree(&self) -> HashMap<String, AgentNode> {
        self.agents.lock().unwrap().clone()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().unwrap().len()
    }
}

fn collect_post_order(agents: &HashMap<String, AgentNode>, id: &str, out: &mut Vec<String>) {
    let Some(node) = agents.get(id) else {
        return;
    };
    for child in &node.children {
        collect_post_order(agents, child, out);
    }
    out.push(id.to_string());
}

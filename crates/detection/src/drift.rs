//! Behavioral drift detection.
//!
//! Per agent, the action-type mix of the current period is compared against
//! a promoted baseline using KL divergence over Laplace-smoothed
//! distributions. A drifting agent is one whose behavior no longer looks
//! like the behavior a human signed off on.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use agent_warden_core::config::DriftConfig;
use agent_warden_core::types::{ActionEvent, DetectionEvent, DetectionType};

const EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Default)]
struct ActionDistribution {
    counts: HashMap<String, u64>,
    total: u64,
}

impl ActionDistribution {
    fn record(&mut self, action_type: &str) {
        *self.counts.entry(action_type.to_string()).or_default() += 1;
        self.total += 1;
    }

    fn probability(&self, key: &str, union_size: usize) -> f64 {
        let count = self.counts.get(key).copied().unwrap_or(0) as f64;
        (count + EPSILON) / (self.total as f64 + EPSILON * union_size as f64)
    }
}

#[derive(Default)]
struct AgentDrift {
    baseline: ActionDistribution,
    current: ActionDistribution,
}

/// KL-divergence drift detector, keyed by agent.
pub struct DriftDetector {
    config: DriftConfig,
    state: Mutex<HashMap<String, AgentDrift>>,
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Count one action into the agent's current distribution.
    pub fn record_action(&self, agent_id: &str, action_type: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .entry(agent_id.to_string())
            .or_default()
            .current
            .record(action_type);
    }

    /// `D_KL(current || baseline)`, or `None` without data on both sides.
    pub fn divergence(&self, agent_id: &str) -> Option<f64> {
        let state = self.state.lock().unwrap();
        let drift = state.get(agent_id)?;
        if drift.baseline.total == 0 || drift.current.total == 0 {
            return None;
        }

        let keys: HashSet<&String> = drift
            .baseline
            .counts
            .keys()
            .chain(drift.current.counts.keys())
            .collect();
        let n = keys.len();
        let mut kl = 0.0;
        for key in keys {
            let p = drift.current.probability(key, n);
            let q = drift.baseline.probability(key, n);
            kl += p * (p / q).ln();
        }
        Some(kl)
    }

    /// Compare the current distribution against the baseline.
    pub fn check_agent(&self, agent_id: &str) -> Option<DetectionEvent> {
        let kl = self.divergence(agent_id)?;
        if kl < self.config.threshold {
            return None;
        }
        Some(DetectionEvent {
            kind: DetectionType::Drift,
            session_id: String::new(),
            agent_id: agent_id.to_string(),
            action: self.config.action,
            message: format!(
                "action distribution diverged from baseline (KL {kl:.3} >= {})",
                self.config.threshold
            ),
            details: serde_json::json!({
                "kl_divergence": kl,
                "threshold": self.config.threshold,
            }),
        })
    }

    /// Record the event and check its agent in one step.
    pub fn check(&self, event: &ActionEvent) -> Option<DetectionEvent> {
        self.record_action(&event.agent_id, event.action_type.as_str());
        let mut fired = self.check_agent(&event.agent_id)?;
        fired.session_id = event.session_id.clone();
        Some(fired)
    }

    /// Deep-copy current into baseline and zero current.
    pub fn promote_baseline(&self, agent_id: &str) {
        let mut state = self.state.lock().unwrap();
        let drift = state.entry(agent_id.to_string()).or_default();
        drift.baseline = drift.current.clone();
        drift.current = ActionDistribution::default();
    }

    /// Session resets do not touch drift state; the distribution is an
    /// agent-lifetime signal, not a session one.
    pub fn reset_session(&self, _session_id: &str) {}

    pub fn reset_agent(&self, agent_id: &str) {
        self.state.lock().unwrap().remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold: f64) -> DriftDetector {
        DriftDetector::new(DriftConfig {
            threshold,
            ..Default::default()
        })
    }

    fn feed(detector: &DriftDetector, agent: &str, a: usize, b: usize) {
        for _ in 0..a {
            detector.record_action(agent, "llm.chat");
        }
        for _ in 0..b {
            detector.record_action(agent, "tool.call");
        }
    }

    #[test]
    fn inverted_mix_is_drifted() {
        let detector = detector(0.5);
        // Baseline: 90% chat, 10% tools.
        feed(&detector, "agent-1", 90, 10);
        detector.promote_baseline("agent-1");
        // Current: 10% chat, 90% tools.
        feed(&detector, "agent-1", 10, 90);

        let kl = detector.divergence("agent-1").unwrap();
        assert!(kl >= 0.5, "kl = {kl}");
        assert!(detector.check_agent("agent-1").is_some());
    }

    #[test]
    fn matching_mix_is_not_drifted() {
        let detector = detector(0.5);
        feed(&detector, "agent-1", 90, 10);
        detector.promote_baseline("agent-1");
        feed(&detector, "agent-1", 88, 12);

        let kl = detector.divergence("agent-1").unwrap();
        assert!(kl < 0.5, "kl = {kl}");
        assert!(detector.check_agent("agent-1").is_none());
    }

    #[test]
    fn no_baseline_means_no_verdict() {
        let detector = detector(0.1);
        feed(&detector, "agent-1", 5, 5);
        assert!(detector.divergence("agent-1").is_none());
        assert!(detector.check_agent("agent-1").is_none());
    }

    #[test]
    fn promotion_zeroes_the_current_period() {
        let detector = detector(0.1);
        feed(&detector, "agent-1", 10, 0);
        detector.promote_baseline("agent-1");
        // Current is empty until new actions arrive.
        assert!(detector.divergence("agent-1").is_none());

        // A key unseen in the baseline still yields a finite divergence.
        for _ in 0..10 {
            detector.record_action("agent-1", "file.write");
        }
        let kl = detector.divergence("agent-1").unwrap();
        assert!(kl.is_finite());
        assert!(kl > 1.0);
    }

    #[test]
    fn agents_are_independent() {
        let detector = detector(0.5);
        feed(&detector, "agent-1", 90, 10);
        detector.promote_baseline("agent-1");
        feed(&detector, "agent-1", 10, 90);
        feed(&detector, "agent-2", 90, 10);
        detector.promote_baseline("agent-2");
        feed(&detector, "agent-2", 90, 10);

        assert!(detector.check_agent("agent-1").is_some());
        assert!(detector.check_agent("agent-2").is_none());
    }
}

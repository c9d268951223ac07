//! Spend-rate anomaly detection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use agent_warden_core::config::CostAnomalyConfig;
use agent_warden_core::types::{ActionEvent, DetectionEvent, DetectionType};

/// Entries older than this leave the per-session sample.
const RETENTION: Duration = Duration::from_secs(60 * 60);
/// Boundary between the recent sample and the baseline.
const RECENT_WINDOW: Duration = Duration::from_secs(30);

/// Fires when the per-action spend rate of the last 30 seconds exceeds the
/// session's baseline rate by the configured multiplier. Needs at least
/// three samples and a non-empty baseline before it can fire.
pub struct CostAnomalyDetector {
    config: CostAnomalyConfig,
    state: Mutex<HashMap<String, Vec<(f64, Instant)>>>,
}

impl CostAnomalyDetector {
    pub fn new(config: CostAnomalyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, event: &ActionEvent) -> Option<DetectionEvent> {
        self.check_at(event, Instant::now())
    }

    fn check_at(&self, event: &ActionEvent, now: Instant) -> Option<DetectionEvent> {
        let mut state = self.state.lock().unwrap();
        let samples = state.entry(event.session_id.clone()).or_default();
        samples.push((event.cost_usd, now));
        samples.retain(|(_, t)| now.duration_since(*t) <= RETENTION);

        if samples.len() < 3 {
            return None;
        }

        let (mut recent_sum, mut recent_count) = (0.0f64, 0usize);
        let (mut baseline_sum, mut baseline_count) = (0.0f64, 0usize);
        for (cost, t) in samples.iter() {
            if now.duration_since(*t) <= RECENT_WINDOW {
                recent_sum += cost;
                recent_count += 1;
            } else {
                baseline_sum += cost;
                baseline_count += 1;
            }
        }
        if baseline_count == 0 {
            return None;
        }

        let recent_rate = recent_sum / recent_count.max(1) as f64;
        let baseline_rate = baseline_sum / baseline_count as f64;
        if recent_rate > baseline_rate * self.config.multiplier {
            Some(DetectionEvent {
                kind: DetectionType::CostAnomaly,
                session_id: event.session_id.clone(),
                agent_id: event.agent_id.clone(),
                action: self.config.action,
                message: format!(
                    "spend rate ${recent_rate:.4}/action is {:.1}x the baseline ${baseline_rate:.4}/action",
                    recent_rate / baseline_rate.max(f64::MIN_POSITIVE)
                ),
                details: serde_json::json!({
                    "recent_rate": recent_rate,
                    "baseline_rate": baseline_rate,
                    "multiplier": self.config.multiplier,
                }),
            })
        } else {
            None
        }
    }

    pub fn reset_session(&self, session_id: &str) {
        self.state.lock().unwrap().remove(session_id);
    }
}

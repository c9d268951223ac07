//! Sustained action-rate detection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use agent_warden_core::config::VelocityConfig;
use agent_warden_core::types::{ActionEvent, DetectionEvent, DetectionType};

struct SessionRate {
    timestamps: Vec<Instant>,
    breach_start: Option<Instant>,
}

/// Fires when a session exceeds `threshold` actions per second for
/// `sustained_seconds` in a row. One-second spikes are tolerated; a breach
/// must hold for the whole sustain window.
pub struct VelocityDetector {
    config: VelocityConfig,
    state: Mutex<HashMap<String, SessionRate>>,
}

impl VelocityDetector {
    pub fn new(config: VelocityConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, event: &ActionEvent) -> Option<DetectionEvent> {
        self.check_at(event, Instant::now())
    }

    fn check_at(&self, event: &ActionEvent, now: Instant) -> Option<DetectionEvent> {
        let retention = Duration::from_secs(self.config.sustained_seconds + 1);
        let sustain = Duration::from_secs(self.config.sustained_seconds);

        let mut state = self.state.lock().unwrap();
        let session = state
            .entry(event.session_id.clone())
            .or_insert_with(|| SessionRate {
                timestamps: Vec::new(),
                breach_start: None,
            });

        session.timestamps.push(now);
        session
            .timestamps
            .retain(|t| now.duration_since(*t) <= retention);
        let recent = session
            .timestamps
            .iter()
            .filter(|t| now.duration_since(**t) <= Duration::from_secs(1))
            .count();

        if recent > self.config.threshold {
            let started = *session.breach_start.get_or_insert(now);
            if now.duration_since(started) >= sustain {
                session.breach_start = None;
                return Some(DetectionEvent {
                    kind: DetectionType::Velocity,
                    session_id: event.session_id.clone(),
                    agent_id: event.agent_id.clone(),
                    action: self.config.action,
                    message: format!(
                        "{recent} actions/s sustained for {}s (limit {})",
                        self.config.sustained_seconds, self.config.threshold
                    ),
                    details: serde_json::json!({
                        "recent_per_second": recent,
                        "threshold": self.config.threshold,
                        "sustained_seconds": self.config.sustained_seconds,
                    }),
                });
            }
        } else {
            session.breach_start = None;
        }
        None
    }

    pub fn reset_session(&self, session_id: &str) {
        self.state.lock().unwrap().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ActionEvent {
        ActionEvent {
            session_id: "s-1".into(),
            agent_id: "agent-1".into(),
            action_type: agent_warden_core::types::ActionType::ToolCall,
            action_name: "shell".into(),
            signature: "sig".into(),
            cost_usd: 0.0,
            content: String::new(),
        }
    }

    fn detector(threshold: usize, sustained_seconds: u64) -> VelocityDetector {
        VelocityDetector::new(VelocityConfig {
            threshold,
            sustained_seconds,
            ..Default::default()
        })
    }

    #[test]
    fn sustained_burst_fires() {
        let detector = detector(2, 2);
        let base = Instant::now();
        let e = event();
        let mut fired = false;
        // 10 actions per second for 3 seconds.
        for tick in 0..30 {
            let now = base + Duration::from_millis(tick * 100);
            if detector.check_at(&e, now).is_some() {
                fired = true;
                break;
            }
        }
        assert!(fired);
    }

    #[test]
    fn short_spike_does_not_fire() {
        let detector = detector(2, 3);
        let base = Instant::now();
        let e = event();
        // A burst well above threshold, but only for one second.
        for tick in 0..10 {
            let now = base + Duration::from_millis(tick * 100);
            assert!(detector.check_at(&e, now).is_none());
        }
        // Then silence; the next slow action clears the breach.
        assert!(detector
            .check_at(&e, base + Duration::from_secs(10))
            .is_none());
    }

    #[test]
    fn dropping_below_threshold_resets_the_breach() {
        let detector = detector(2, 2);
        let base = Instant::now();
        let e = event();
        // One second of breach...
        for tick in 0..10 {
            assert!(detector
                .check_at(&e, base + Duration::from_millis(tick * 100))
                .is_none());
        }
        // ...then a quiet second resets, and a fresh one-second burst alone
        // is again not enough.
        for tick in 0..10 {
            assert!(detector
                .check_at(&e, base + Duration::from_millis(3000 + tick * 100))
                .is_none());
        }
    }
}

//! Repetition detection over action signatures.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use agent_warden_core::config::LoopConfig;
use agent_warden_core::types::{ActionEvent, DetectionEvent, DetectionType};

/// Fires when one `(session, signature)` pair repeats more than `threshold`
/// times inside the window; `threshold` is the largest tolerated count, so a
/// threshold of 3 fires on the 4th identical action.
pub struct LoopDetector {
    config: LoopConfig,
    windows: Mutex<HashMap<(String, String), Vec<Instant>>>,
}

impl LoopDetector {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, event: &ActionEvent) -> Option<DetectionEvent> {
        self.check_at(event, Instant::now())
    }

    fn check_at(&self, event: &ActionEvent, now: Instant) -> Option<DetectionEvent> {
        let window = Duration::from_secs(self.config.window_seconds);
        let mut windows = self.windows.lock().unwrap();
        let timestamps = windows
            .entry((event.session_id.clone(), event.signature.clone()))
            .or_default();
        timestamps.push(now);
        timestamps.retain(|t| now.duration_since(*t) <= window);
        let count = timestamps.len();

        if count > self.config.threshold {
            Some(DetectionEvent {
                kind: DetectionType::Loop,
                session_id: event.session_id.clone(),
                agent_id: event.agent_id.clone(),
                action: self.config.action,
                message: format!(
                    "action '{}' repeated {count} times within {}s",
                    event.action_name, self.config.window_seconds
                ),
                details: serde_json::json!({
                    "signature": event.signature,
                    "count": count,
                    "threshold": self.config.threshold,
                }),
            })
        } else {
            None
        }
    }

    pub fn reset_session(&self, session_id: &str) {
        self.windows
            .lock()
            .unwrap()
            .retain(|(session, _), _| session != session_id);
    }
}

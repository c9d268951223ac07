//! Output-spiral detection.
//!
//! An agent stuck re-generating near-identical answers produces a run of
//! outputs whose pairwise word-frequency cosine similarity stays high. The
//! detector keeps a short history per session and fires when every
//! consecutive pair in the last `window` outputs clears the threshold.

use std::collections::HashMap;
use std::sync::Mutex;

use agent_warden_core::config::SpiralConfig;
use agent_warden_core::types::{ActionEvent, DetectionEvent, DetectionType};

pub struct SpiralDetector {
    config: SpiralConfig,
    history: Mutex<HashMap<String, Vec<String>>>,
}

impl SpiralDetector {
    pub fn new(config: SpiralConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, event: &ActionEvent) -> Option<DetectionEvent> {
        if event.content.is_empty() {
            return None;
        }
        let window = self.config.window.max(2);

        let mut history = self.history.lock().unwrap();
        let outputs = history.entry(event.session_id.clone()).or_default();
        outputs.push(event.content.clone());
        if outputs.len() > 3 * window {
            let excess = outputs.len() - 2 * window;
            outputs.drain(..excess);
        }
        if outputs.len() < window {
            return None;
        }

        let tail = &outputs[outputs.len() - window..];
        let mut min_similarity = f64::INFINITY;
        for pair in tail.windows(2) {
            let similarity = cosine_similarity(&pair[0], &pair[1]);
            min_similarity = min_similarity.min(similarity);
            if similarity < self.config.similarity_threshold {
                return None;
            }
        }

        Some(DetectionEvent {
            kind: DetectionType::Spiral,
            session_id: event.session_id.clone(),
            agent_id: event.agent_id.clone(),
            action: self.config.action,
            message: format!(
                "last {window} outputs are {:.0}%+ similar",
                self.config.similarity_threshold * 100.0
            ),
            details: serde_json::json!({
                "window": window,
                "min_similarity": min_similarity,
                "threshold": self.config.similarity_threshold,
            }),
        })
    }

    pub fn reset_session(&self, session_id: &str) {
        self.history.lock().unwrap().remove(session_id);
    }
}

/// Lowercased, punctuation-stripped tokens of length > 1.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|token| token.trim_matches(|c| ".,!?;:\"'()[]{}".contains(c)))
        .filter(|token| token.len() > 1)
        .map(str::to_string)
        .collect()
}

/// Cosine similarity of the word-frequency vectors of two texts.
fn cosine_similarity(a: &str, b: &str) -> f64 {
    let mut freq_a: HashMap<String, f64> = HashMap::new();
    for token in tokenize(a) {
        *freq_a.entry(token).or_default() += 1.0;
    }
    let mut freq_b: HashMap<String, f64> = HashMap::new();
    for token in tokenize(b) {
        *freq_b.entry(token).or_default() += 1.0;
    }

    let dot: f64 = freq_a
        .iter()
        .filter_map(|(token, count)| freq_b.get(token).map(|other| count * other))
        .sum();
    let norm_a: f64 = freq_a.values().map(|c| c * c).sum::<f64>().sqrt();
    let norm_b: f64 = freq_b.values().map(|c| c * c).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

//! Detection orchestration.

use std::sync::{Arc, RwLock};

use agent_warden_core::config::DetectionConfig;
use agent_warden_core::types::{ActionEvent, DetectionEvent};

use crate::{
    CostAnomalyDetector, DriftDetector, InjectionDetector, LoopDetector, SpiralDetector,
    VelocityDetector,
};

/// The fixed set of detector variants. New detectors are new variants, not
/// trait objects, so the whole family stays visible at every dispatch site.
pub enum Detector {
    Loop(LoopDetector),
    Velocity(VelocityDetector),
    CostAnomaly(CostAnomalyDetector),
    Spiral(SpiralDetector),
    Drift(DriftDetector),
    Injection(InjectionDetector),
}

impl Detector {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Loop(_) => "loop",
            Self::Velocity(_) => "velocity",
            Self::CostAnomaly(_) => "cost_anomaly",
            Self::Spiral(_) => "spiral",
            Self::Drift(_) => "drift",
            Self::Injection(_) => "injection",
        }
    }

    pub fn check(&self, event: &ActionEvent) -> Option<DetectionEvent> {
        match self {
            Self::Loop(d) => d.check(event),
            Self::Velocity(d) => d.check(event),
            Self::CostAnomaly(d) => d.check(event),
            Self::Spiral(d) => d.check(event),
            Self::Drift(d) => d.check(event),
            Self::Injection(d) => d.check(event),
        }
    }

    pub fn reset_session(&self, session_id: &str) {
        match self {
            Self::Loop(d) => d.reset_session(session_id),
            Self::Velocity(d) => d.reset_session(session_id),
            Self::CostAnomaly(d) => d.reset_session(session_id),
            Self::Spiral(d) => d.reset_session(session_id),
            Self::Drift(d) => d.reset_session(session_id),
            Self::Injection(d) => d.reset_session(session_id),
        }
    }
}

/// Callback invoked for every confirmed detection event.
pub type EventHandler = Arc<dyn Fn(DetectionEvent) + Send + Sync>;

/// Owns the enabled detector set and fans events out to the handler.
pub struct DetectionEngine {
    detectors: RwLock<Vec<Detector>>,
    handler: RwLock<Option<EventHandler>>,
}

fn build_detectors(config: &DetectionConfig) -> Vec<Detector> {
    let mut detectors = Vec::new();
    if config.loop_detection.enabled {
        detectors.push(Detector::Loop(LoopDetector::new(
            config.loop_detection.clone(),
        )));
    }
    if config.velocity.enabled {
        detectors.push(Detector::Velocity(VelocityDetector::new(
            config.velocity.clone(),
        )));
    }
    if config.cost_anomaly.enabled {
        detectors.push(Detector::CostAnomaly(CostAnomalyDetector::new(
            config.cost_anomaly.clone(),
        )));
    }
    if config.spiral.enabled {
        detectors.push(Detector::Spiral(SpiralDetector::new(config.spiral.clone())));
    }
    if config.drift.enabled {
        detectors.push(Detector::Drift(DriftDetector::new(config.drift.clone())));
    }
    if config.injection.enabled {
        detectors.push(Detector::Injection(InjectionDetector::new(
            config.injection.clone(),
        )));
    }
    detectors
}

impl DetectionEngine {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            detectors: RwLock::new(build_detectors(config)),
            handler: RwLock::new(None),
        }
    }

    /// Register the event handler (alert fan-out + enforcement mapping).
    pub fn set_handler(&self, handler: EventHandler) {
        *self.handler.write().unwrap() = Some(handler);
    }

    /// Run every enabled detector against one event. Detector findings are
    /// handed to the handler; nothing here can fail the governed action.
    pub fn analyze(&self, event: &ActionEvent) {
        let fired: Vec<DetectionEvent> = {
            let detectors = self.detectors.read().unwrap();
            detectors.iter().filter_map(|d| d.check(event)).collect()
        };
        if fired.is_empty() {
            return;
        }
        let handler = self.handler.read().unwrap().clone();
        for detection in fired {
            tracing::warn!(
                kind = %detection.kind,
                session_id = %detection.session_id,
                action = detection.action.as_str(),
                "{}",
                detection.message
            );
            if let Some(handler) = &handler {
                handler(detection);
            }
        }
    }

    /// Swap the whole detector set atomically; per-session state restarts
    /// from scratch under the new thresholds.
    pub fn update_config(&self, config: &DetectionConfig) {
        let rebuilt = build_detectors(config);
        *self.detectors.write().unwrap() = rebuilt;
        tracing::info!("detection config updated, detectors rebuilt");
    }

    /// Wipe one session's state in every detector.
    pub fn reset_session(&self, session_id: &str) {
        for detector in self.detectors.read().unwrap().iter() {
            detector.reset_session(session_id);
        }
    }

    /// Promote the drift baseline for one agent.
    pub fn promote_drift_baseline(&self, agent_id: &str) {
        for detector in self.detectors.read().unwrap().iter() {
            if let Detector::Drift(drift) = detector {
                drift.promote_baseline(agent_id);
            }
        }
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.read().unwrap().iter().map(|d| d.name()).collect()
    }
}

#![deny(unused)]
//! Behavioral anomaly detection for AgentWarden.
//!
//! Six detectors over a common event shape:
//! - loop: identical actions repeating inside a sliding window
//! - velocity: sustained action bursts
//! - cost anomaly: recent spend rate vs the session baseline
//! - spiral: self-similar LLM output runs
//! - drift: KL divergence of an agent's action mix against its baseline
//! - injection: prompt-injection patterns in inputs
//!
//! The `DetectionEngine` owns the active set and fans confirmed events out
//! to the registered handler; detector findings never block the action that
//! triggered them.

mod cost;
mod drift;
mod engine;
mod injection;
mod loop_detector;
mod playbook;
mod spiral;
mod velocity;

pub use cost::CostAnomalyDetector;
pub use drift::DriftDetector;
pub use engine::{Detector, DetectionEngine, EventHandler};
pub use injection::{InjectionDetector, InjectionSeverity, ScanResult};
pub use loop_detector::LoopDetector;
pub use playbook::{playbook_name, EnforcementDecision, PlaybookExecutor};
pub use spiral::SpiralDetector;
pub use velocity::VelocityDetector;

#![deny(unused)]
//! The AgentWarden core facade.
//!
//! Adapters hand every outward-facing agent action to [`Warden::evaluate`]
//! and apply the returned verdict. The facade wires capabilities, policies,
//! the spawn governor, the messaging gate, the tamper-evident trace chain
//! and the detection engine into a single entry point.

pub mod telemetry;
pub mod warden;

pub use telemetry::init_tracing;
pub use warden::{KillTarget, Warden};

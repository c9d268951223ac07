#![deny(unused)]
//! Core types and contracts for AgentWarden.
//!
//! This crate provides:
//! - The trace/session/agent data model and the tamper-evident hash chain
//! - The `Store`, `LlmClient` and `AlertSender` contracts
//! - The typed configuration bundle with env substitution
//! - The error kinds shared by every component

pub mod config;
pub mod error;
pub mod hash;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use hash::{action_signature, session_seed, trace_hash, verify_chain, ChainVerification};

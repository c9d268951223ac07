#![deny(unused)]
//! Storage backends for AgentWarden.
//!
//! Two implementations of the core `Store` contract:
//! - [`MemoryStore`] for tests and single-shot tooling
//! - [`SqliteStore`] for the single-node production default

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#![deny(unused)]
//! LLM access for judge policies and incident playbooks.
//!
//! One OpenAI-compatible Chat Completions client plus the shared
//! `{action, reason, confidence}` verdict parser.

pub mod client;
pub mod verdict;

pub use client::OpenAiClient;
pub use verdict::{parse_verdict, JudgeVerdict};

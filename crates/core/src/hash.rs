//! Tamper-evident hash chain over session traces.
//!
//! For the traces of a session ordered by timestamp:
//! - the first trace's `prev_hash` is SHA-256 of the session id,
//! - each later trace's `prev_hash` is the previous trace's `hash`,
//! - every `hash` covers the trace identity fields plus `prev_hash`.
//!
//! Any in-place edit of a stored trace, or any reordering, changes a hash
//! somewhere and breaks verification at that index.

use sha2::{Digest, Sha256};

use crate::types::Trace;

/// Result of verifying one session's chain.
///
/// `broken_index` is `-1` iff the chain is valid, otherwise the index of the
/// first trace whose linkage or hash does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    pub broken_index: i64,
}

impl ChainVerification {
    pub fn valid() -> Self {
        Self {
            valid: true,
            broken_index: -1,
        }
    }

    pub fn broken_at(index: usize) -> Self {
        Self {
            valid: false,
            broken_index: index as i64,
        }
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Seed for a session's chain: hex(SHA-256(session_id)).
pub fn session_seed(session_id: &str) -> String {
    sha256_hex(session_id)
}

/// Identity of an action for repetition detection: same type, name and
/// parameters yield the same signature.
pub fn action_signature(action_type: &str, action_name: &str, params: &str) -> String {
    let digest = sha256_hex(&format!("{action_type}|{action_name}|{params}"));
    digest[..16].to_string()
}

/// Hash of one trace: hex(SHA-256(id|session_id|action_type|request|response|prev_hash)).
pub fn trace_hash(trace: &Trace) -> String {
    let input = format!(
        "{}|{}|{}|{}|{}|{}",
        trace.id,
        trace.session_id,
        trace.action_type,
        trace.request_body,
        trace.response_body,
        trace.prev_hash
    );
    sha256_hex(&input)
}

/// Verify a session's traces, assumed ascending by timestamp.
pub fn verify_chain(session_id: &str, traces: &[Trace]) -> ChainVerification {
    let mut expected_prev = session_seed(session_id);
    for (i, trace) in traces.iter().enumerate() {
        if trace.prev_hash != expected_prev {
            return ChainVerification::broken_at(i);
        }
        if trace_hash(trace) != trace.hash {
            return ChainVerification::broken_at(i);
        }
        expected_prev = trace.hash.clone();
    }
    ChainVerification::valid()
}

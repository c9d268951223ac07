//! Verdict parsing shared by judge policies and playbooks.
//!
//! Models are asked for a bare JSON object but routinely wrap it in code
//! fences or prose; the parser digs the first object out of whatever came
//! back, validates the action against the closed set, and clamps confidence
//! into [0, 1].

use serde::{Deserialize, Serialize};

use agent_warden_core::{Error, Result};

const VALID_ACTIONS: [&str; 5] = ["allow", "pause", "terminate", "alert", "backoff"];

/// Parsed `{action, reason, confidence}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub action: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Extract the first balanced JSON object from a model response.
fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse and validate a verdict; errors on missing JSON or an unknown action.
pub fn parse_verdict(content: &str) -> Result<JudgeVerdict> {
    let raw = extract_json(content)
        .ok_or_else(|| Error::judge(format!("no JSON object in response: {content:.120}")))?;
    let mut verdict: JudgeVerdict =
        serde_json::from_str(raw).map_err(|e| Error::judge(format!("bad verdict JSON: {e}")))?;

    verdict.action = verdict.action.to_lowercase();
    if !VALID_ACTIONS.contains(&verdict.action.as_str()) {
        return Err(Error::judge(format!(
            "verdict action '{}' is not one of {VALID_ACTIONS:?}",
            verdict.action
        )));
    }
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}

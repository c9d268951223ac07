//! Tracing setup.

use tracing_subscriber::EnvFilter;

use agent_warden_core::{Error, Result};

/// Install the global subscriber. `RUST_LOG` overrides `log_level` when set.
pub fn init_tracing(log_level: &str, json: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    result.map_err(|e| Error::config(format!("tracing init: {e}")))
}

pub mod agent;
pub mod gc;
pub mod init;
pub mod mail;
pub mod ports;
pub mod process;

use crate::error::{MusterError, Result};

/// An explicit `--agent`/`--from` value, or the ambient `MUSTER_AGENT`.
pub fn agent_or_env(explicit: Option<String>, flag: &str) -> Result<String> {
    explicit
        .or_else(crate::agent::resolve_agent)
        .ok_or_else(|| {
            MusterError::Invalid(format!("{flag} is required when MUSTER_AGENT is not set"))
        })
}

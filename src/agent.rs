/// Resolve the agent identity from the environment.
///
/// Checks `MUSTER_AGENT` (written into every agent's environment descriptor).
/// Returns `None` if unset, letting callers decide whether to require a flag.
pub fn resolve_agent() -> Option<String> {
    std::env::var("MUSTER_AGENT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Validate an agent name: non-empty, ASCII alphanumeric + hyphen + underscore.
///
/// Names double as file names and branch suffixes, so nothing else is allowed.
pub fn validate_name(name: &str) -> crate::error::Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::error::MusterError::InvalidName(name.into()));
    }
    Ok(())
}

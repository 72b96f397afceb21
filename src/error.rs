use std::fmt;

use thiserror::Error;

use crate::store::ports::PortRange;

/// Coarse error taxonomy surfaced to callers and mapped to CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ResourceExhausted,
    Process,
    Io,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Validation => 3,
            Self::NotFound => 4,
            Self::Conflict => 5,
            Self::ResourceExhausted => 6,
            Self::Process => 7,
            Self::Io => 8,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::ResourceExhausted => write!(f, "resource_exhausted"),
            Self::Process => write!(f, "process"),
            Self::Io => write!(f, "io"),
        }
    }
}

/// The step of `agent create` that failed; rollback undoes everything before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    ReservePorts,
    CreateWorkspace,
    WriteEnvironment,
    Activate,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservePorts => write!(f, "reserve_ports"),
            Self::CreateWorkspace => write!(f, "create_workspace"),
            Self::WriteEnvironment => write!(f, "write_environment"),
            Self::Activate => write!(f, "activate"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MusterError {
    #[error("not a muster repository (run `muster init` first)")]
    NotInitialized,

    #[error("muster already initialized in this repository")]
    AlreadyInitialized,

    #[error("invalid agent name '{0}': must be non-empty ASCII alphanumeric/hyphen/underscore")]
    InvalidName(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("port range {0} is not currently allocated")]
    PortRangeNotAllocated(PortRange),

    #[error("message '{0}' not found")]
    MessageNotFound(String),

    #[error("process '{0}' not found in registry")]
    ProcessNotFound(String),

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("process '{0}' is already {1}")]
    ProcessConflict(String, String),

    #[error("agent '{0}' is already provisioned")]
    AgentConflict(String),

    #[error("workspace conflict: {0}")]
    WorkspaceConflict(String),

    #[error("no free range of {size} ports within {base}..{limit}")]
    PortsExhausted { size: u32, base: u16, limit: u16 },

    #[error("failed to spawn '{0}': {1}")]
    Spawn(String, String),

    #[error("failed to signal pid {0}: {1}")]
    Signal(u32, String),

    #[error("provisioning failed at step {step}: {source}")]
    ProvisionFailed {
        step: ProvisionStep,
        #[source]
        source: Box<MusterError>,
    },

    #[error("locked by another process: {0}")]
    Locked(String),

    #[error("corrupt file '{0}': {1}")]
    CorruptFile(String, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

impl MusterError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::InvalidName(_) => "invalid_name",
            Self::Invalid(_) => "invalid_input",
            Self::PortRangeNotAllocated(_) => "port_range_not_allocated",
            Self::MessageNotFound(_) => "message_not_found",
            Self::ProcessNotFound(_) => "process_not_found",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::ProcessConflict(_, _) => "process_conflict",
            Self::AgentConflict(_) => "agent_conflict",
            Self::WorkspaceConflict(_) => "workspace_conflict",
            Self::PortsExhausted { .. } => "ports_exhausted",
            Self::Spawn(_, _) => "spawn_failed",
            Self::Signal(_, _) => "signal_failed",
            Self::ProvisionFailed { source, .. } => source.code(),
            Self::Locked(_) => "locked",
            Self::CorruptFile(_, _) => "corrupt_file",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Git(_) => "git_error",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName(_) | Self::Invalid(_) | Self::PortRangeNotAllocated(_) => {
                ErrorKind::Validation
            }
            Self::NotInitialized
            | Self::MessageNotFound(_)
            | Self::ProcessNotFound(_)
            | Self::AgentNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyInitialized
            | Self::ProcessConflict(_, _)
            | Self::AgentConflict(_)
            | Self::WorkspaceConflict(_) => ErrorKind::Conflict,
            Self::PortsExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Spawn(_, _) | Self::Signal(_, _) => ErrorKind::Process,
            Self::ProvisionFailed { source, .. } => source.kind(),
            Self::Locked(_)
            | Self::CorruptFile(_, _)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Git(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, MusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::ResourceExhausted,
            ErrorKind::Process,
            ErrorKind::Io,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn provision_failure_reports_inner_kind_and_step() {
        let err = MusterError::ProvisionFailed {
            step: ProvisionStep::CreateWorkspace,
            source: Box::new(MusterError::Io(std::io::Error::other("disk full"))),
        };
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.code(), "io_error");
        assert!(err.to_string().contains("create_workspace"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn workspace_clash_is_a_conflict() {
        let err = MusterError::ProvisionFailed {
            step: ProvisionStep::CreateWorkspace,
            source: Box::new(MusterError::WorkspaceConflict("branch agent/x already exists".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.kind().exit_code(), 5);
        assert_eq!(err.code(), "workspace_conflict");
    }

    #[test]
    fn port_release_errors_are_validation() {
        let err = MusterError::PortRangeNotAllocated(PortRange::new(3000, 3009));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("3000-3009"));
    }
}

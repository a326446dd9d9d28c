//! Error types for the sandbox engine
//!
//! `SandboxError` is what callers of the orchestrator see. `RuntimeError`
//! describes failures at the container runtime boundary and is carried as the
//! source of `SandboxError::Runtime` when nothing more specific applies.

use thiserror::Error;

/// Errors raised by the container runtime client
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime does not know the container (or path inside it)
    #[error("not found: {0}")]
    NotFound(String),

    /// The runtime answered with an error status
    #[error("runtime API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The runtime could not be reached or the connection broke
    #[error("runtime transport error: {0}")]
    Transport(String),

    /// Building or unpacking a file archive failed
    #[error("archive error: {0}")]
    Archive(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Errors surfaced by the orchestrator
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code imports a blocked or non-allowed module; no container was touched
    #[error("import of '{module}' is not permitted: {reason}")]
    PolicyViolation { module: String, reason: String },

    /// The runtime refused to create or start a container
    #[error("failed to create container: {0}")]
    CreationFailure(String),

    /// The execution exceeded its deadline and was killed
    #[error("execution timed out after {0} seconds")]
    Timeout(u64),

    /// The process exited with a nonzero code
    #[error("execution failed with exit code {exit_code}: {output}")]
    ExecutionError { exit_code: i64, output: String },

    /// Transient run exited cleanly but wrote no output artifact
    #[error("execution failed to produce output state")]
    OutputMissing,

    /// Transient output artifact was present but not a JSON object
    #[error("failed to parse execution output: {0}")]
    OutputParseError(String),

    /// The session was cleaned up while its container was being created
    #[error("session {0} was closed during setup")]
    SessionClosed(String),

    /// Package name rejected before reaching a container
    #[error("invalid package name: {0:?}")]
    InvalidPackage(String),

    /// Any other runtime failure, with the operation that triggered it
    #[error("runtime operation '{operation}' failed: {source}")]
    Runtime {
        operation: &'static str,
        #[source]
        source: RuntimeError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Wrap a runtime failure with the operation name
    pub fn runtime(operation: &'static str, source: RuntimeError) -> Self {
        SandboxError::Runtime { operation, source }
    }

    /// Stable label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::PolicyViolation { .. } => "policy_violation",
            SandboxError::CreationFailure(_) => "creation_failure",
            SandboxError::Timeout(_) => "timeout",
            SandboxError::ExecutionError { .. } => "execution_error",
            SandboxError::OutputMissing => "output_missing",
            SandboxError::OutputParseError(_) => "output_parse_error",
            SandboxError::SessionClosed(_) => "session_closed",
            SandboxError::InvalidPackage(_) => "invalid_package",
            SandboxError::Runtime { .. } => "runtime",
            SandboxError::Config(_) | SandboxError::ConfigLoad(_) => "config",
            SandboxError::Serialization(_) => "serialization",
        }
    }
}

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

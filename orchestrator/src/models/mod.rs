//! Data models for the sandbox engine
//!
//! Request/result types exchanged with the orchestrator and the snapshots it
//! exposes for introspection.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SandboxError, SandboxResult};
use crate::script::{ERROR_KEY, STDERR_KEY, STDOUT_KEY};

/// Caller-visible state mapping for transient runs
pub type StateMap = Map<String, Value>;

// ============================================================================
// Execution Models
// ============================================================================

/// Which protocol a request runs under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Fresh container; state passed in and returned explicitly
    Transient {
        #[serde(default)]
        state: Option<StateMap>,
    },
    /// Long-lived session container; state kept inside it
    Persistent {
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Code plus the mode it should run in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(flatten)]
    pub mode: ExecutionMode,
}

impl ExecutionRequest {
    pub fn transient(code: impl Into<String>, state: Option<StateMap>) -> Self {
        Self {
            code: code.into(),
            mode: ExecutionMode::Transient { state },
        }
    }

    pub fn persistent(code: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            code: code.into(),
            mode: ExecutionMode::Persistent { session_id },
        }
    }
}

/// Outcome of a transient run, exactly as written by the wrapper script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientResult {
    pub stdout: String,
    pub stderr: String,
    /// Message of the exception raised by the code, if any
    pub error: Option<String>,
    /// Value bound to `result` by the code, if any
    pub result: Option<Value>,
    /// Final namespace without the reserved stream/error keys
    pub state: StateMap,
}

impl TransientResult {
    /// Parse the output document; anything other than a JSON object is rejected
    pub fn from_output_document(raw: &[u8]) -> SandboxResult<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| SandboxError::OutputParseError(e.to_string()))?;

        let Value::Object(mut state) = value else {
            return Err(SandboxError::OutputParseError(
                "output document is not a JSON object".to_string(),
            ));
        };

        let stdout = take_text(&mut state, STDOUT_KEY).unwrap_or_default();
        let stderr = take_text(&mut state, STDERR_KEY).unwrap_or_default();
        let error = take_text(&mut state, ERROR_KEY);
        let result = state.get("result").cloned();

        Ok(Self {
            stdout,
            stderr,
            error,
            result,
            state,
        })
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Remove `key`, rendering non-string values as JSON text; null becomes `None`
fn take_text(map: &mut StateMap, key: &str) -> Option<String> {
    match map.remove(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    }
}

/// Outcome of one call in a persistent session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentOutput {
    /// Captured stdout, or the entire raw exec output when no structured payload was found
    pub output: String,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// JSON view of the variables saved for the next call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMap>,
}

impl PersistentOutput {
    /// Best-effort result carrying the raw output text
    pub fn raw(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    /// Build from a parsed payload object; missing fields default
    pub fn from_payload(mut payload: StateMap) -> Self {
        let state = match payload.remove("state") {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        };

        Self {
            output: take_text(&mut payload, "output").unwrap_or_default(),
            error: take_text(&mut payload, "error"),
            stderr: take_text(&mut payload, "stderr"),
            result: payload.remove("result"),
            state,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of `Orchestrator::execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExecutionResult {
    Transient(TransientResult),
    Persistent {
        session_id: String,
        #[serde(flatten)]
        output: PersistentOutput,
    },
}

impl fmt::Display for TransientResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Execution Result:\n\n{}", self.stdout)?;
        if self.error.is_none() && !self.stderr.is_empty() {
            write!(f, "\n\nStandard Error:\n{}", self.stderr)?;
        }
        if let Some(error) = &self.error {
            write!(f, "\n\nError: {}", error)?;
        }
        Ok(())
    }
}

impl fmt::Display for PersistentOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Execution Result:\n\n{}", self.output)?;
        if let Some(error) = &self.error {
            write!(f, "\n\nError: {}", error)?;
        }
        Ok(())
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionResult::Transient(result) => result.fmt(f),
            ExecutionResult::Persistent { session_id, output } => {
                write!(f, "Session ID: {}\n\n{}", session_id, output)
            }
        }
    }
}

// ============================================================================
// Introspection Models
// ============================================================================

/// Snapshot of a persistent session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    /// `None` while the container is still being created
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Snapshot of the warm pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub idle: usize,
    /// Creations in flight started by maintenance
    pub pending: usize,
    pub capacity: usize,
}

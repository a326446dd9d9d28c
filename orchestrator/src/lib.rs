//! pysandbox orchestrator library
//!
//! Sandboxed Python execution backed by containers, in two modes: transient
//! (fresh container per call, explicit state in and out) and persistent
//! (a session bound to a long-lived container that keeps interpreter state).

pub mod config;
pub mod container;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod packages;
pub mod runtime;
pub mod script;
pub mod security;

pub use config::SandboxConfig;
pub use error::{RuntimeError, SandboxError, SandboxResult};
pub use models::{
    ExecutionMode, ExecutionRequest, ExecutionResult, PersistentOutput, PoolStats, SessionInfo,
    StateMap, TransientResult,
};
pub use orchestrator::Orchestrator;
pub use runtime::{ContainerSpec, ContainerStatus, ExecOutput, ExecRequest, RuntimeClient};

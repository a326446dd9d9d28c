//! Container runtime boundary
//!
//! The engine talks to the container daemon exclusively through the
//! [`RuntimeClient`] trait. [`DockerRuntime`] is the production implementation;
//! tests substitute in-memory fakes or mocks.

mod docker;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::{SandboxConfig, CPU_PERIOD_MICROS};
use crate::error::{RuntimeError, SandboxResult};

pub use docker::DockerRuntime;

/// Label set on every container the engine creates
pub const LABEL_MANAGED: &str = "pysandbox.managed";
/// Role of the container: pool, session or install
pub const LABEL_ROLE: &str = "pysandbox.role";
/// Owning session for persistent containers
pub const LABEL_SESSION: &str = "pysandbox.session_id";

/// Network persistent containers start attached to
pub const DEFAULT_NETWORK: &str = "bridge";

/// Virtualenv baked into the sandbox image
pub const VENV_PATH: &str = "/home/appuser/.venv";

/// What a container is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    Pool,
    Session,
    Install,
}

impl ContainerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerRole::Pool => "pool",
            ContainerRole::Session => "session",
            ContainerRole::Install => "install",
        }
    }
}

/// Everything needed to create a container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub role: ContainerRole,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    /// Docker network mode, "none" isolates the container
    pub network_mode: String,
    pub read_only: bool,
    /// Path mounted as a writable scratch volume (needed with a read-only rootfs)
    pub scratch_volume: Option<String>,
    pub auto_remove: bool,
}

impl ContainerSpec {
    fn base(config: &SandboxConfig, role: ContainerRole, cmd: Vec<String>) -> SandboxResult<Self> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_ROLE.to_string(), role.as_str().to_string());

        Ok(Self {
            role,
            image: config.docker.image.clone(),
            cmd,
            working_dir: config.docker.working_dir.clone(),
            env: Vec::new(),
            labels,
            memory_bytes: config.docker.memory_limit_bytes()?,
            cpu_quota: config.docker.cpu_quota(),
            cpu_period: CPU_PERIOD_MICROS,
            network_mode: "none".to_string(),
            read_only: false,
            scratch_volume: None,
            auto_remove: false,
        })
    }

    /// One-shot container whose entry command runs the transient wrapper script
    pub fn transient(config: &SandboxConfig) -> SandboxResult<Self> {
        let wd = &config.docker.working_dir;
        let mut spec = Self::base(
            config,
            ContainerRole::Pool,
            vec!["python".to_string(), crate::script::script_path(wd)],
        )?;
        if !config.docker.network_disabled {
            spec.network_mode = DEFAULT_NETWORK.to_string();
        }
        spec.read_only = config.docker.read_only;
        spec.scratch_volume = Some(wd.clone());
        Ok(spec)
    }

    /// Long-lived container backing a persistent session
    ///
    /// Always starts on the default bridge network; the session manager
    /// disconnects it afterwards when networking is disabled.
    pub fn persistent(config: &SandboxConfig, session_id: &str) -> SandboxResult<Self> {
        let mut spec = Self::base(
            config,
            ContainerRole::Session,
            vec!["sleep".to_string(), "infinity".to_string()],
        )?;
        spec.network_mode = DEFAULT_NETWORK.to_string();
        spec.labels
            .insert(LABEL_SESSION.to_string(), session_id.to_string());
        Ok(spec)
    }

    /// Throwaway container running a package install with network access
    pub fn installer(config: &SandboxConfig, cmd: Vec<String>) -> SandboxResult<Self> {
        let mut spec = Self::base(config, ContainerRole::Install, cmd)?;
        spec.network_mode = DEFAULT_NETWORK.to_string();
        spec.env = venv_env();
        Ok(spec)
    }
}

/// Environment pointing the interpreter and installers at the image venv
pub fn venv_env() -> Vec<String> {
    vec![
        format!("PATH={}/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin", VENV_PATH),
        format!("VIRTUAL_ENV={}", VENV_PATH),
    ]
}

/// A command run inside an existing container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
}

impl ExecRequest {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

/// Result of an exec call; stdout and stderr interleaved
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Snapshot of a container's state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Operations the engine needs from a container runtime
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Create (but do not start) a container, returning its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str, grace_secs: i64) -> Result<(), RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Run a command inside a running container and wait for it to finish
    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError>;

    /// Write a single file at `path` inside the container
    async fn copy_into(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), RuntimeError>;

    /// Read a single file at `path` from the container
    async fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Combined stdout and stderr of the container's main process
    async fn logs(&self, id: &str) -> Result<String, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    async fn connect_network(&self, id: &str, network: &str) -> Result<(), RuntimeError>;

    async fn disconnect_network(&self, id: &str, network: &str) -> Result<(), RuntimeError>;
}

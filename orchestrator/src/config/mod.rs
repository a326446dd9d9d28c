//! Configuration module for the sandbox engine
//!
//! Supports configuration via:
//! - TOML/YAML/JSON config files (`config/pysandbox.*`, `/etc/pysandbox/config`)
//! - Environment variables (with PYSANDBOX__ prefix, `__` between sections)
//!
//! The resulting `SandboxConfig` is treated as immutable once it is handed to
//! the orchestrator.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

/// CPU scheduling period used with the quota derived from `cpu_limit`
pub const CPU_PERIOD_MICROS: i64 = 100_000;

/// Smallest memory limit the docker daemon accepts
const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Container settings shared by transient and persistent execution
    #[serde(default)]
    pub docker: DockerConfig,

    /// Warm container pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Package installation settings
    #[serde(default)]
    pub package: PackageConfig,

    /// Runtime connection and polling settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// If non-empty, every import must name one of these modules
    #[serde(default = "default_allowed_modules")]
    pub allowed_modules: BTreeSet<String>,

    /// Imports of these modules are always rejected
    #[serde(default = "default_blocked_modules")]
    pub blocked_modules: BTreeSet<String>,
}

/// Container image, limits and security flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_image")]
    pub image: String,

    /// Directory inside the container holding scripts and state artifacts
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Docker-style memory size, e.g. "256m"
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// CPU cores (can be fractional)
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Execution deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_true")]
    pub network_disabled: bool,

    /// Read-only root filesystem for transient containers
    #[serde(default = "default_true")]
    pub read_only: bool,
}

/// Warm pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of idle containers kept ready
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Seconds after which an idle container is evicted
    #[serde(default = "default_pool_max_age")]
    pub max_age: u64,

    /// Cap on container creations in flight at once
    #[serde(default = "default_max_concurrent_creations")]
    pub max_concurrent_creations: usize,

    /// Seconds between maintenance ticks
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: u64,
}

/// Which tool runs package installs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Installer {
    Uv,
    Pip,
}

impl Installer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Installer::Uv => "uv",
            Installer::Pip => "pip",
        }
    }
}

/// Package installation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(default = "default_installer")]
    pub installer: Installer,

    /// Package index URL passed as --index-url
    #[serde(default)]
    pub index_url: Option<String>,

    /// Hosts passed as --trusted-host
    #[serde(default)]
    pub trusted_hosts: Vec<String>,

    /// Deadline for a single install in seconds
    #[serde(default = "default_install_timeout")]
    pub install_timeout: u64,
}

/// Runtime client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker/Podman socket path (local defaults when unset)
    #[serde(default)]
    pub socket: Option<String>,

    /// Interval between container status polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Treat not-found and API errors during exit polling as a clean exit
    #[serde(default = "default_true")]
    pub fail_open_polling: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_image() -> String {
    "python:3.12.2-slim".to_string()
}

fn default_working_dir() -> String {
    "/app".to_string()
}

fn default_memory_limit() -> String {
    "256m".to_string()
}

fn default_cpu_limit() -> f64 {
    0.5
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_pool_size() -> usize {
    3
}

fn default_pool_max_age() -> u64 {
    300
}

fn default_max_concurrent_creations() -> usize {
    5
}

fn default_maintenance_interval() -> u64 {
    10
}

fn default_installer() -> Installer {
    Installer::Uv
}

fn default_install_timeout() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_allowed_modules() -> BTreeSet<String> {
    ["math", "datetime", "random", "json", "re", "collections"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_blocked_modules() -> BTreeSet<String> {
    ["os", "sys", "subprocess", "shutil", "pathlib"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            working_dir: default_working_dir(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            timeout: default_timeout(),
            network_disabled: true,
            read_only: true,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_pool_size(),
            max_age: default_pool_max_age(),
            max_concurrent_creations: default_max_concurrent_creations(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            installer: default_installer(),
            index_url: None,
            trusted_hosts: Vec::new(),
            install_timeout: default_install_timeout(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket: None,
            poll_interval_ms: default_poll_interval_ms(),
            fail_open_polling: true,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            docker: DockerConfig::default(),
            pool: PoolConfig::default(),
            package: PackageConfig::default(),
            runtime: RuntimeConfig::default(),
            allowed_modules: default_allowed_modules(),
            blocked_modules: default_blocked_modules(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from the standard file locations and environment
    pub fn load() -> SandboxResult<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&SandboxConfig::default())?)
            .add_source(config::File::with_name("config/pysandbox").required(false))
            .add_source(config::File::with_name("/etc/pysandbox/config").required(false));

        Self::finish(builder)
    }

    /// Load configuration from an explicit file, still honouring env overrides
    pub fn from_file(path: &Path) -> SandboxResult<Self> {
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&SandboxConfig::default())?)
            .add_source(config::File::from(path).required(true));

        Self::finish(builder)
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> SandboxResult<Self> {
        let config = builder
            .add_source(
                config::Environment::with_prefix("PYSANDBOX")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_modules")
                    .with_list_parse_key("blocked_modules")
                    .with_list_parse_key("package.trusted_hosts"),
            )
            .build()?;

        let sandbox_config: SandboxConfig = config.try_deserialize()?;
        sandbox_config.validate()?;

        Ok(sandbox_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> SandboxResult<()> {
        if self.docker.image.trim().is_empty() {
            return Err(SandboxError::Config("image cannot be empty".to_string()));
        }

        if !self.docker.working_dir.starts_with('/') {
            return Err(SandboxError::Config(format!(
                "working_dir must be an absolute path, got {:?}",
                self.docker.working_dir
            )));
        }

        let memory = self.docker.memory_limit_bytes()?;
        if memory < MIN_MEMORY_BYTES {
            return Err(SandboxError::Config("minimum memory limit is 6m".to_string()));
        }

        if !(self.docker.cpu_limit > 0.0) {
            return Err(SandboxError::Config("cpu_limit must be positive".to_string()));
        }

        if self.docker.timeout == 0 {
            return Err(SandboxError::Config("execution timeout cannot be 0".to_string()));
        }

        if self.pool.max_concurrent_creations == 0 {
            return Err(SandboxError::Config(
                "max_concurrent_creations cannot be 0".to_string(),
            ));
        }

        if self.pool.enabled && self.pool.size == 0 {
            return Err(SandboxError::Config(
                "pool size cannot be 0 while pooling is enabled".to_string(),
            ));
        }

        if let Some(module) = self.allowed_modules.intersection(&self.blocked_modules).next() {
            return Err(SandboxError::Config(format!(
                "module '{}' is both allowed and blocked",
                module
            )));
        }

        Ok(())
    }
}

impl DockerConfig {
    /// Memory limit in bytes
    pub fn memory_limit_bytes(&self) -> SandboxResult<i64> {
        parse_memory_limit(&self.memory_limit).ok_or_else(|| {
            SandboxError::Config(format!("invalid memory limit {:?}", self.memory_limit))
        })
    }

    /// CPU quota in microseconds per `CPU_PERIOD_MICROS`
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_limit * CPU_PERIOD_MICROS as f64).round() as i64
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl PoolConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval.max(1))
    }
}

impl PackageConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout)
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Parse a docker-style size like "256m", "1g", "512k" or "1048576"
pub fn parse_memory_limit(value: &str) -> Option<i64> {
    let lower = value.trim().to_ascii_lowercase();
    let without_b = lower.strip_suffix('b').unwrap_or(&lower);

    let (digits, multiplier) = match without_b.chars().last()? {
        'k' => (&without_b[..without_b.len() - 1], 1024),
        'm' => (&without_b[..without_b.len() - 1], 1024 * 1024),
        'g' => (&without_b[..without_b.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (without_b, 1),
        _ => return None,
    };

    let amount: i64 = digits.trim().parse().ok()?;
    amount.checked_mul(multiplier)
}

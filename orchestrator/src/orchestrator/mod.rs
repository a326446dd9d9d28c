//! Orchestrator facade
//!
//! The single entry point the tool layer talks to. Owns the pool, the session
//! map and the creation gate; all shared state lives in this instance.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::container::{ContainerCreator, ContainerPool, SessionManager, TransientExecutor};
use crate::error::{SandboxError, SandboxResult};
use crate::metrics;
use crate::models::{
    ExecutionMode, ExecutionRequest, ExecutionResult, PersistentOutput, PoolStats, SessionInfo,
    StateMap, TransientResult,
};
use crate::packages::{validate_package_name, PackageInstaller};
use crate::runtime::{DockerRuntime, RuntimeClient};
use crate::security::ImportPolicy;

/// Sandboxed code execution engine
pub struct Orchestrator {
    config: Arc<SandboxConfig>,
    policy: ImportPolicy,
    creator: Arc<ContainerCreator>,
    pool: Arc<ContainerPool>,
    executor: TransientExecutor,
    sessions: SessionManager,
    installer: PackageInstaller,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Connect to the local container runtime and build an orchestrator
    pub async fn connect(config: SandboxConfig) -> SandboxResult<Self> {
        config.validate()?;
        let runtime = DockerRuntime::connect(&config.runtime)
            .await
            .map_err(|e| SandboxError::runtime("connect", e))?;
        Self::with_runtime(config, Arc::new(runtime))
    }

    /// Build an orchestrator on top of any runtime client
    pub fn with_runtime(config: SandboxConfig, runtime: Arc<dyn RuntimeClient>) -> SandboxResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let creator = Arc::new(ContainerCreator::new(
            runtime.clone(),
            config.pool.max_concurrent_creations,
        ));
        let pool = Arc::new(ContainerPool::new(config.clone(), runtime.clone(), creator.clone()));
        let executor = TransientExecutor::new(config.clone(), runtime.clone(), pool.clone());
        let sessions = SessionManager::new(config.clone(), runtime.clone(), creator.clone());
        let installer = PackageInstaller::new(config.clone(), runtime, creator.clone());

        Ok(Self {
            policy: ImportPolicy::from_config(&config),
            config,
            creator,
            pool,
            executor,
            sessions,
            installer,
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
        })
    }

    /// Start background pool maintenance (no-op when pooling is disabled or already running)
    pub async fn start(&self) {
        if !self.config.pool.enabled || self.shutdown.is_cancelled() {
            return;
        }

        let mut maintenance = self.maintenance.lock().await;
        if maintenance.is_none() {
            *maintenance = Some(self.pool.clone().spawn_maintenance(self.shutdown.child_token()));
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn check_policy(&self, code: &str) -> SandboxResult<()> {
        self.policy.validate(code).map_err(|e| {
            metrics::record_policy_violation();
            e
        })
    }

    /// Run code in a fresh container with explicit state in and out
    pub async fn execute_transient(
        &self,
        code: &str,
        state: Option<StateMap>,
    ) -> SandboxResult<TransientResult> {
        self.check_policy(code)?;
        self.executor.execute(code, state.as_ref()).await
    }

    /// Run code in a persistent session, creating it when `session_id` is absent or unknown
    pub async fn execute_persistent(
        &self,
        session_id: Option<&str>,
        code: &str,
    ) -> SandboxResult<(PersistentOutput, String)> {
        self.check_policy(code)?;
        self.sessions.execute(session_id, code).await
    }

    /// Dispatch a request to the matching execution mode
    pub async fn execute(&self, request: ExecutionRequest) -> SandboxResult<ExecutionResult> {
        match request.mode {
            ExecutionMode::Transient { state } => self
                .execute_transient(&request.code, state)
                .await
                .map(ExecutionResult::Transient),
            ExecutionMode::Persistent { session_id } => {
                let (output, session_id) = self
                    .execute_persistent(session_id.as_deref(), &request.code)
                    .await?;
                Ok(ExecutionResult::Persistent { session_id, output })
            }
        }
    }

    /// Install a package into a live session, or into a throwaway container
    pub async fn install_package(&self, session_id: Option<&str>, package: &str) -> SandboxResult<String> {
        validate_package_name(package)?;

        if let Some(session_id) = session_id {
            if let Some(log) = self
                .sessions
                .install_package(session_id, package, &self.installer)
                .await?
            {
                return Ok(log);
            }
            info!(session_id = %session_id, "No live session, installing in ephemeral container");
        }

        self.installer.install_ephemeral(package).await
    }

    /// Tear down one session; `Ok(false)` for an unknown id
    pub async fn cleanup_session(&self, session_id: &str) -> SandboxResult<bool> {
        self.sessions.cleanup_session(session_id).await
    }

    /// Tear down every session, returning how many were cleaned without error
    pub async fn cleanup_all_sessions(&self) -> usize {
        self.sessions.cleanup_all_sessions().await
    }

    /// Stop maintenance, refuse new containers, drain the pool and clean up all sessions
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if let Some(handle) = self.maintenance.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pool maintenance task ended abnormally");
            }
        }

        self.creator.close();
        self.executor.wait_for_releases().await;
        let drained = self.pool.drain().await;
        let sessions = self.sessions.cleanup_all_sessions().await;

        info!(pool_containers = drained, sessions = sessions, "Orchestrator shut down");
    }

    pub async fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.session_info(session_id).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list_sessions().await
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Run one pool maintenance pass immediately
    pub async fn maintain_pool(&self) {
        self.pool.maintain().await;
    }
}

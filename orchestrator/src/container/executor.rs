//! One-shot code execution in pooled or fresh containers

use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::wait::wait_with_deadline;
use super::{release_container, ContainerPool};
use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::metrics;
use crate::models::{StateMap, TransientResult};
use crate::runtime::RuntimeClient;
use crate::script;

/// Executes code in single-use containers
pub struct TransientExecutor {
    config: Arc<SandboxConfig>,
    runtime: Arc<dyn RuntimeClient>,
    pool: Arc<ContainerPool>,
    releases: TaskTracker,
}

/// Releases the acquired container if the execution future is dropped early
struct ReleaseGuard {
    runtime: Arc<dyn RuntimeClient>,
    container_id: Option<String>,
    releases: TaskTracker,
}

impl ReleaseGuard {
    async fn release(mut self) {
        if let Some(container_id) = self.container_id.as_deref() {
            if let Err(e) = release_container(self.runtime.as_ref(), container_id).await {
                warn!(container_id = %container_id, error = %e, "Failed to release transient container");
            }
        }
        // disarm only once the release ran to completion
        self.container_id = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };

        let Ok(handle) = Handle::try_current() else {
            warn!(container_id = %container_id, "No runtime to release abandoned container");
            return;
        };

        debug!(container_id = %container_id, "Execution abandoned, releasing container");
        let runtime = self.runtime.clone();
        self.releases.spawn_on(
            async move {
                if let Err(e) = release_container(runtime.as_ref(), &container_id).await {
                    warn!(container_id = %container_id, error = %e, "Failed to release abandoned container");
                }
            },
            &handle,
        );
    }
}

impl TransientExecutor {
    pub fn new(
        config: Arc<SandboxConfig>,
        runtime: Arc<dyn RuntimeClient>,
        pool: Arc<ContainerPool>,
    ) -> Self {
        Self {
            config,
            runtime,
            pool,
            releases: TaskTracker::new(),
        }
    }

    /// Wait for releases of abandoned executions to finish
    pub async fn wait_for_releases(&self) {
        self.releases.close();
        self.releases.wait().await;
    }

    /// Run `code` with `state` seeded into its namespace
    ///
    /// The container is stopped and removed on every path, including when
    /// the returned future is dropped before completion.
    pub async fn execute(&self, code: &str, state: Option<&StateMap>) -> SandboxResult<TransientResult> {
        let start_time = Instant::now();
        let entry = self.pool.acquire().await?;
        let container_id = entry.container_id;
        let guard = ReleaseGuard {
            runtime: self.runtime.clone(),
            container_id: Some(container_id.clone()),
            releases: self.releases.clone(),
        };

        debug!(container_id = %container_id, "Executing transient code");

        let outcome = self.run(&container_id, code, state).await;
        guard.release().await;

        let duration = start_time.elapsed();
        let label = match &outcome {
            Ok(result) if result.is_success() => "success",
            Ok(_) => "code_error",
            Err(e) => e.kind(),
        };
        metrics::record_execution("transient", label, duration.as_secs_f64());

        info!(
            container_id = %container_id,
            outcome = label,
            duration_ms = duration.as_millis() as u64,
            "Transient execution completed"
        );

        outcome
    }

    async fn run(
        &self,
        container_id: &str,
        code: &str,
        state: Option<&StateMap>,
    ) -> SandboxResult<TransientResult> {
        let wd = &self.config.docker.working_dir;

        let script = script::transient_script(&self.config, code);
        self.runtime
            .copy_into(container_id, &script::script_path(wd), script.as_bytes())
            .await
            .map_err(|e| SandboxError::runtime("copy_into", e))?;

        let empty = StateMap::new();
        let state_document = serde_json::to_vec(state.unwrap_or(&empty))?;
        self.runtime
            .copy_into(container_id, &script::state_path(wd), &state_document)
            .await
            .map_err(|e| SandboxError::runtime("copy_into", e))?;

        self.runtime
            .start(container_id)
            .await
            .map_err(|e| SandboxError::CreationFailure(format!("failed to start container: {}", e)))?;

        let exit_code = wait_with_deadline(
            self.runtime.as_ref(),
            container_id,
            self.config.docker.timeout(),
            self.config.runtime.poll_interval(),
            self.config.runtime.fail_open_polling,
        )
        .await?;

        let Some(exit_code) = exit_code else {
            warn!(
                container_id = %container_id,
                timeout_secs = self.config.docker.timeout,
                "Transient execution timed out"
            );
            if let Err(e) = self.runtime.kill(container_id).await {
                debug!(container_id = %container_id, error = %e, "Kill after timeout failed");
            }
            return Err(SandboxError::Timeout(self.config.docker.timeout));
        };

        if exit_code != 0 {
            let output = self
                .runtime
                .logs(container_id)
                .await
                .unwrap_or_else(|e| format!("<logs unavailable: {}>", e));
            return Err(SandboxError::ExecutionError { exit_code, output });
        }

        let document = match self
            .runtime
            .copy_out(container_id, &script::output_path(wd))
            .await
        {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Err(SandboxError::OutputMissing),
            Err(e) => return Err(SandboxError::runtime("copy_out", e)),
        };

        TransientResult::from_output_document(&document)
    }
}

//! Creation gate shared by the pool, transient misses, sessions and installs

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::release_container;
use crate::error::{SandboxError, SandboxResult};
use crate::metrics;
use crate::runtime::{ContainerSpec, RuntimeClient};

/// Creates containers while holding a permit from a counting semaphore
///
/// Every creation path in the engine goes through one instance, so the number
/// of in-flight creations never exceeds `max_concurrent_creations`.
pub struct ContainerCreator {
    runtime: Arc<dyn RuntimeClient>,
    permits: Semaphore,
}

impl ContainerCreator {
    pub fn new(runtime: Arc<dyn RuntimeClient>, max_concurrent_creations: usize) -> Self {
        Self {
            runtime,
            permits: Semaphore::new(max_concurrent_creations.max(1)),
        }
    }

    /// Create a container without starting it
    pub async fn create(&self, spec: &ContainerSpec) -> SandboxResult<String> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            SandboxError::CreationFailure("creation gate is closed".to_string())
        })?;

        self.create_unpermitted(spec).await
    }

    /// Create and start a container; the permit covers both steps
    pub async fn create_started(&self, spec: &ContainerSpec) -> SandboxResult<String> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            SandboxError::CreationFailure("creation gate is closed".to_string())
        })?;

        let container_id = self.create_unpermitted(spec).await?;

        if let Err(e) = self.runtime.start(&container_id).await {
            warn!(container_id = %container_id, error = %e, "Failed to start container");
            metrics::record_creation_failure(spec.role.as_str());
            if let Err(release_err) = release_container(self.runtime.as_ref(), &container_id).await {
                warn!(container_id = %container_id, error = %release_err, "Failed to release unstarted container");
            }
            return Err(SandboxError::CreationFailure(format!(
                "failed to start container: {}",
                e
            )));
        }

        Ok(container_id)
    }

    async fn create_unpermitted(&self, spec: &ContainerSpec) -> SandboxResult<String> {
        match self.runtime.create(spec).await {
            Ok(container_id) => {
                debug!(container_id = %container_id, role = spec.role.as_str(), "Container created");
                Ok(container_id)
            }
            Err(e) => {
                warn!(role = spec.role.as_str(), error = %e, "Container creation failed");
                metrics::record_creation_failure(spec.role.as_str());
                Err(SandboxError::CreationFailure(e.to_string()))
            }
        }
    }

    /// Permits not currently held by an in-flight creation
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse any further creations; callers waiting for a permit fail
    pub fn close(&self) {
        self.permits.close();
    }
}

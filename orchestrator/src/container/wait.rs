//! Exit polling for containers
//!
//! Polls `inspect` until the container stops. When fail-open polling is
//! enabled (the default), a container that disappears or a runtime API error
//! while polling is reported as a clean exit (code 0) and logged at WARN with
//! `policy = "fail_open"`. This favours availability but can mask a genuine
//! runtime outage; set `runtime.fail_open_polling = false` to propagate the
//! error instead.

use std::time::Duration;

use tracing::warn;

use crate::error::{RuntimeError, SandboxError, SandboxResult};
use crate::metrics;
use crate::runtime::RuntimeClient;

/// Wait until the container is no longer running and return its exit code
pub async fn wait_for_exit(
    runtime: &dyn RuntimeClient,
    container_id: &str,
    poll_interval: Duration,
    fail_open: bool,
) -> SandboxResult<i64> {
    loop {
        match runtime.inspect(container_id).await {
            Ok(status) if !status.running => return Ok(status.exit_code.unwrap_or(0)),
            Ok(_) => tokio::time::sleep(poll_interval).await,
            Err(e @ (RuntimeError::NotFound(_) | RuntimeError::Api { .. } | RuntimeError::Transport(_)))
                if fail_open =>
            {
                warn!(
                    container_id = %container_id,
                    error = %e,
                    policy = "fail_open",
                    "Status poll failed; treating container as exited cleanly"
                );
                metrics::record_fail_open();
                return Ok(0);
            }
            Err(e) => return Err(SandboxError::runtime("inspect", e)),
        }
    }
}

/// `wait_for_exit` bounded by `deadline`; `None` means the deadline passed
pub async fn wait_with_deadline(
    runtime: &dyn RuntimeClient,
    container_id: &str,
    deadline: Duration,
    poll_interval: Duration,
    fail_open: bool,
) -> SandboxResult<Option<i64>> {
    match tokio::time::timeout(
        deadline,
        wait_for_exit(runtime, container_id, poll_interval, fail_open),
    )
    .await
    {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

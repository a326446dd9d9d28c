//! Container management module
//!
//! Handles all container lifecycle work on top of the runtime client:
//! - Gated creation (`ContainerCreator`)
//! - Warm pooling for transient runs (`ContainerPool`)
//! - One-shot execution (`TransientExecutor`)
//! - Long-lived persistent sessions (`SessionManager`)
//! - Exit polling (`wait`)

mod creator;
mod executor;
mod pool;
pub mod session;
pub mod wait;

use tracing::debug;

use crate::error::{SandboxError, SandboxResult};
use crate::runtime::RuntimeClient;

pub use creator::ContainerCreator;
pub use executor::TransientExecutor;
pub use pool::{ContainerPool, EntryState, PoolEntry};
pub use session::{parse_delimited_output, Session, SessionHandle, SessionManager};

/// Seconds a container gets to stop before it is killed
pub const STOP_GRACE_SECS: i64 = 2;

/// Stop (errors ignored) and force-remove a container
///
/// A container that is already gone counts as released.
pub async fn release_container(runtime: &dyn RuntimeClient, container_id: &str) -> SandboxResult<()> {
    if let Err(e) = runtime.stop(container_id, STOP_GRACE_SECS).await {
        debug!(container_id = %container_id, error = %e, "Stop before removal failed");
    }

    match runtime.remove(container_id, true).await {
        Ok(()) => {
            debug!(container_id = %container_id, "Container released");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(SandboxError::runtime("remove", e)),
    }
}

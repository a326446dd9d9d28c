//! Persistent sessions backed by long-lived containers
//!
//! Each session id maps to at most one container. The container is created
//! lazily on the first call for the id; concurrent first calls share one
//! creation through a per-session `OnceCell`. Execs against the same session
//! are serialized by the session's execution lock because the output protocol
//! assumes exactly one exec at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{release_container, ContainerCreator};
use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::metrics;
use crate::models::{PersistentOutput, SessionInfo};
use crate::packages::PackageInstaller;
use crate::runtime::{venv_env, ContainerSpec, ExecRequest, RuntimeClient, DEFAULT_NETWORK};
use crate::script::{self, OUTPUT_END_MARKER, OUTPUT_START_MARKER};

/// Upper bound on the cleanup exec after a timed-out call
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// A persistent session
#[derive(Debug)]
pub struct Session {
    /// Caller-visible session id
    pub session_id: String,

    /// Container id, set once creation succeeds
    container: OnceCell<String>,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// When the session was last used
    last_activity: RwLock<DateTime<Utc>>,

    /// Lock for execution (only one at a time per session)
    execution_lock: Mutex<()>,
}

/// Shared handle to a session
pub type SessionHandle = Arc<Session>;

impl Session {
    pub fn new(session_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            container: OnceCell::new(),
            created_at: now,
            last_activity: RwLock::new(now),
            execution_lock: Mutex::new(()),
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container.get().map(String::as_str)
    }

    /// Update last activity time
    pub async fn touch(&self) {
        *self.last_activity.write().await = Utc::now();
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().await
    }

    /// Acquire the execution lock
    pub async fn acquire_execution_lock(&self) -> MutexGuard<'_, ()> {
        self.execution_lock.lock().await
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            container_id: self.container_id().map(str::to_string),
            created_at: self.created_at,
            last_active_at: self.last_activity().await,
        }
    }
}

/// Extract the structured payload between the output markers
///
/// Falls back to the whole raw text (and no error) when the markers are
/// missing or the enclosed text is not a JSON object.
pub fn parse_delimited_output(raw: &str) -> PersistentOutput {
    let Some(start) = raw.find(OUTPUT_START_MARKER) else {
        return PersistentOutput::raw(raw);
    };
    let body_start = start + OUTPUT_START_MARKER.len();

    let Some(body_len) = raw[body_start..].rfind(OUTPUT_END_MARKER) else {
        return PersistentOutput::raw(raw);
    };
    let body = raw[body_start..body_start + body_len].trim();

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(payload)) => PersistentOutput::from_payload(payload),
        _ => {
            debug!("Delimited output is not a JSON object, returning raw output");
            PersistentOutput::raw(raw)
        }
    }
}

/// Maps session ids to long-lived containers
pub struct SessionManager {
    config: Arc<SandboxConfig>,
    runtime: Arc<dyn RuntimeClient>,
    creator: Arc<ContainerCreator>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<SandboxConfig>,
        runtime: Arc<dyn RuntimeClient>,
        creator: Arc<ContainerCreator>,
    ) -> Self {
        Self {
            config,
            runtime,
            creator,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Run `code` in the session's container, creating the session if needed
    ///
    /// Returns the parsed output and the session id in effect (a fresh UUID
    /// when none was supplied).
    pub async fn execute(
        &self,
        session_id: Option<&str>,
        code: &str,
    ) -> SandboxResult<(PersistentOutput, String)> {
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let start_time = Instant::now();
        let (session, container_id) = self.resolve(&session_id).await?;

        let outcome = {
            let _lock = session.acquire_execution_lock().await;
            session.touch().await;
            self.run_in_container(&container_id, code).await
        };

        let duration = start_time.elapsed();
        let label = match &outcome {
            Ok(output) if output.is_success() => "success",
            Ok(_) => "code_error",
            Err(e) => e.kind(),
        };
        metrics::record_execution("persistent", label, duration.as_secs_f64());

        info!(
            session_id = %session_id,
            container_id = %container_id,
            outcome = label,
            duration_ms = duration.as_millis() as u64,
            "Persistent execution completed"
        );

        outcome.map(|output| (output, session_id))
    }

    /// Find or create the session and make sure its container exists
    async fn resolve(&self, session_id: &str) -> SandboxResult<(SessionHandle, String)> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Session::new(session_id.to_string())))
                .clone();
            metrics::record_active_sessions(sessions.len());
            session
        };

        let init = session
            .container
            .get_or_try_init(|| self.create_session_container(session_id))
            .await
            .map(String::clone);

        match init {
            Ok(container_id) => {
                // cleanup may have dropped the mapping while the container was being created
                if !self.is_tracked(&session).await {
                    warn!(session_id = %session_id, container_id = %container_id, "Session closed during setup");
                    if let Err(e) = release_container(self.runtime.as_ref(), &container_id).await {
                        warn!(container_id = %container_id, error = %e, "Failed to release orphaned session container");
                    }
                    return Err(SandboxError::SessionClosed(session_id.to_string()));
                }
                Ok((session, container_id))
            }
            Err(e) => {
                let mut sessions = self.sessions.write().await;
                let only_holder = sessions
                    .get(session_id)
                    .map_or(false, |current| Arc::ptr_eq(current, &session))
                    && Arc::strong_count(&session) == 2
                    && session.container.get().is_none();
                if only_holder {
                    sessions.remove(session_id);
                    metrics::record_active_sessions(sessions.len());
                }
                Err(e)
            }
        }
    }

    async fn is_tracked(&self, session: &SessionHandle) -> bool {
        self.sessions
            .read()
            .await
            .get(&session.session_id)
            .map_or(false, |current| Arc::ptr_eq(current, session))
    }

    async fn create_session_container(&self, session_id: &str) -> SandboxResult<String> {
        let spec = ContainerSpec::persistent(&self.config, session_id)?;
        let container_id = self.creator.create_started(&spec).await?;

        if self.config.docker.network_disabled {
            if let Err(e) = self.runtime.disconnect_network(&container_id, DEFAULT_NETWORK).await {
                warn!(container_id = %container_id, error = %e, "Could not isolate session container");
                if let Err(release_err) = release_container(self.runtime.as_ref(), &container_id).await {
                    warn!(container_id = %container_id, error = %release_err, "Failed to release session container");
                }
                return Err(SandboxError::CreationFailure(format!(
                    "failed to disconnect session container from network: {}",
                    e
                )));
            }
        }

        metrics::record_session_created();
        info!(session_id = %session_id, container_id = %container_id, "Session container ready");
        Ok(container_id)
    }

    async fn run_in_container(&self, container_id: &str, code: &str) -> SandboxResult<PersistentOutput> {
        let wd = &self.config.docker.working_dir;
        let script_path = script::script_path(wd);

        let script = script::persistent_script(&self.config, code);
        self.runtime
            .copy_into(container_id, &script_path, script.as_bytes())
            .await
            .map_err(|e| SandboxError::runtime("copy_into", e))?;

        let request = ExecRequest::new(["python", script_path.as_str()])
            .working_dir(wd.clone())
            .env(venv_env());

        let output = match tokio::time::timeout(
            self.config.docker.timeout(),
            self.runtime.exec(container_id, &request),
        )
        .await
        {
            Ok(result) => result.map_err(|e| SandboxError::runtime("exec", e))?,
            Err(_) => {
                warn!(
                    container_id = %container_id,
                    timeout_secs = self.config.docker.timeout,
                    "Persistent execution timed out"
                );
                self.kill_script(container_id, &script_path).await;
                return Err(SandboxError::Timeout(self.config.docker.timeout));
            }
        };

        if output.exit_code != 0 {
            return Err(SandboxError::ExecutionError {
                exit_code: output.exit_code,
                output: output.output,
            });
        }

        Ok(parse_delimited_output(&output.output))
    }

    /// Best-effort kill of a runaway wrapper process
    async fn kill_script(&self, container_id: &str, script_path: &str) {
        let request = ExecRequest::new(["pkill", "-9", "-f", script_path]);
        match tokio::time::timeout(KILL_TIMEOUT, self.runtime.exec(container_id, &request)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(container_id = %container_id, error = %e, "pkill failed"),
            Err(_) => debug!(container_id = %container_id, "pkill timed out"),
        }
    }

    /// Live session handle, if any
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Install into the session's container
    ///
    /// Returns `Ok(None)` when the session does not exist or has no container
    /// yet. Networking is enabled for the duration of the install when the
    /// session is otherwise isolated.
    pub async fn install_package(
        &self,
        session_id: &str,
        package: &str,
        installer: &PackageInstaller,
    ) -> SandboxResult<Option<String>> {
        let Some(session) = self.get(session_id).await else {
            return Ok(None);
        };
        let Some(container_id) = session.container_id() else {
            return Ok(None);
        };

        let _lock = session.acquire_execution_lock().await;
        session.touch().await;

        let isolated = self.config.docker.network_disabled;
        if isolated {
            match self.runtime.connect_network(container_id, DEFAULT_NETWORK).await {
                Ok(()) => debug!(container_id = %container_id, "Network enabled for install"),
                Err(e) => warn!(container_id = %container_id, error = %e, "Could not enable network for install"),
            }
        }

        let outcome = installer.install_in_container(container_id, package).await;

        if isolated {
            match self.runtime.disconnect_network(container_id, DEFAULT_NETWORK).await {
                Ok(()) => debug!(container_id = %container_id, "Network isolation restored"),
                Err(e) => warn!(container_id = %container_id, error = %e, "Could not restore network isolation"),
            }
        }

        outcome.map(Some)
    }

    /// Remove the session and its container
    ///
    /// Returns `false` when the id is unknown (nothing changes).
    pub async fn cleanup_session(&self, session_id: &str) -> SandboxResult<bool> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(session_id);
            metrics::record_active_sessions(sessions.len());
            removed
        };

        let Some(session) = session else {
            debug!(session_id = %session_id, "Cleanup of unknown session ignored");
            return Ok(false);
        };

        self.teardown(&session).await?;
        Ok(true)
    }

    /// Clean up every session; individual failures are logged and skipped
    pub async fn cleanup_all_sessions(&self) -> usize {
        let sessions: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            let drained = sessions.drain().map(|(_, session)| session).collect();
            metrics::record_active_sessions(0);
            drained
        };

        let results = join_all(sessions.iter().map(|session| self.teardown(session))).await;

        let mut cleaned = 0;
        for (session, result) in sessions.iter().zip(results) {
            match result {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(session_id = %session.session_id, error = %e, "Failed to clean up session"),
            }
        }

        info!(cleaned = cleaned, total = sessions.len(), "Sessions cleaned up");
        cleaned
    }

    async fn teardown(&self, session: &Session) -> SandboxResult<()> {
        let Some(container_id) = session.container_id() else {
            return Ok(());
        };

        // an in-flight exec or install finishes (or times out) before teardown
        let longest_call = self.config.docker.timeout().max(self.config.package.install_timeout());
        let _lock = match tokio::time::timeout(
            longest_call + KILL_TIMEOUT,
            session.acquire_execution_lock(),
        )
        .await
        {
            Ok(lock) => Some(lock),
            Err(_) => {
                warn!(session_id = %session.session_id, "Execution still in flight, tearing down anyway");
                None
            }
        };

        let artifact = script::session_state_path(&self.config.docker.working_dir);
        let request = ExecRequest::new(["rm", "-f", artifact.as_str()]);
        if let Err(e) = self.runtime.exec(container_id, &request).await {
            debug!(container_id = %container_id, error = %e, "Could not remove session state artifact");
        }

        release_container(self.runtime.as_ref(), container_id).await?;
        metrics::record_session_terminated();
        info!(session_id = %session.session_id, container_id = %container_id, "Session cleaned up");
        Ok(())
    }

    pub async fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        match self.get(session_id).await {
            Some(session) => Some(session.info().await),
            None => None,
        }
    }

    /// Snapshots of all sessions, oldest first
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut infos = join_all(sessions.iter().map(|s| s.info())).await;
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }
}

//! In-memory container runtime used by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use pysandbox_orchestrator::config::SandboxConfig;
use pysandbox_orchestrator::runtime::ContainerRole;
use pysandbox_orchestrator::script::{OUTPUT_END_MARKER, OUTPUT_FILE, OUTPUT_START_MARKER};
use pysandbox_orchestrator::{
    ContainerSpec, ContainerStatus, ExecOutput, ExecRequest, Orchestrator, RuntimeClient,
    RuntimeError,
};

/// What a transient container does once started
#[derive(Debug, Clone)]
pub enum RunBehavior {
    Exit {
        code: i64,
        output: Option<Value>,
        logs: String,
    },
    Hang,
}

impl RunBehavior {
    pub fn document(output: Value) -> Self {
        RunBehavior::Exit {
            code: 0,
            output: Some(output),
            logs: String::new(),
        }
    }
}

/// Reply to an exec call
#[derive(Debug, Clone)]
pub enum ExecReply {
    Output(ExecOutput),
    Hang,
}

impl ExecReply {
    pub fn ok(output: impl Into<String>) -> Self {
        ExecReply::Output(ExecOutput {
            exit_code: 0,
            output: output.into(),
        })
    }

    /// Persistent wrapper output carrying `payload`
    pub fn payload(payload: Value) -> Self {
        Self::ok(format!(
            "{}\n{}\n{}\n",
            OUTPUT_START_MARKER, payload, OUTPUT_END_MARKER
        ))
    }
}

type ExecHandler = Box<dyn Fn(&str, &ExecRequest) -> ExecReply + Send + Sync>;
type InstallHandler = Box<dyn Fn(&[String]) -> (i64, String) + Send + Sync>;

struct FakeContainer {
    spec: ContainerSpec,
    status: ContainerStatus,
    logs: String,
}

pub struct FakeRuntime {
    next_id: AtomicUsize,
    create_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_create: AtomicBool,
    fail_disconnect: AtomicBool,

    containers: Mutex<HashMap<String, FakeContainer>>,
    created: Mutex<Vec<(String, ContainerRole)>>,
    removed: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
    execs: Mutex<Vec<(String, ExecRequest)>>,
    network_calls: Mutex<Vec<(String, &'static str)>>,

    run_behavior: Mutex<RunBehavior>,
    exec_handler: Mutex<ExecHandler>,
    install_handler: Mutex<InstallHandler>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            create_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            containers: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            execs: Mutex::new(Vec::new()),
            network_calls: Mutex::new(Vec::new()),
            run_behavior: Mutex::new(RunBehavior::document(serde_json::json!({
                "__stdout__": "",
                "__stderr__": "",
                "__error__": null,
            }))),
            exec_handler: Mutex::new(Box::new(|_, _| {
                ExecReply::payload(serde_json::json!({"output": "", "error": null}))
            })),
            install_handler: Mutex::new(Box::new(|_| (0, "Successfully installed".to_string()))),
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn set_run_behavior(&self, behavior: RunBehavior) {
        *self.run_behavior.lock().unwrap() = behavior;
    }

    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &ExecRequest) -> ExecReply + Send + Sync + 'static,
    {
        *self.exec_handler.lock().unwrap() = Box::new(handler);
    }

    pub fn set_install_handler<F>(&self, handler: F)
    where
        F: Fn(&[String]) -> (i64, String) + Send + Sync + 'static,
    {
        *self.install_handler.lock().unwrap() = Box::new(handler);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn created_with_role(&self, role: ContainerRole) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| *r == role)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn live_containers(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> Vec<(String, ExecRequest)> {
        self.execs.lock().unwrap().clone()
    }

    pub fn network_calls(&self) -> Vec<(String, &'static str)> {
        self.network_calls.lock().unwrap().clone()
    }

    pub fn file(&self, container_id: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&(container_id.to_string(), path.to_string()))
            .cloned()
    }

    fn not_found(id: &str) -> RuntimeError {
        RuntimeError::NotFound(format!("no such container: {}", id))
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "image pull failed".to_string(),
            });
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push((id.clone(), spec.role));
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                status: ContainerStatus {
                    running: false,
                    exit_code: None,
                },
                logs: String::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;

        match container.spec.role {
            ContainerRole::Pool => match self.run_behavior.lock().unwrap().clone() {
                RunBehavior::Exit { code, output, logs } => {
                    container.status = ContainerStatus {
                        running: false,
                        exit_code: Some(code),
                    };
                    container.logs = logs;
                    if let Some(output) = output {
                        let path = format!("{}/{}", container.spec.working_dir, OUTPUT_FILE);
                        self.files
                            .lock()
                            .unwrap()
                            .insert((id.to_string(), path), output.to_string().into_bytes());
                    }
                }
                RunBehavior::Hang => {
                    container.status = ContainerStatus {
                        running: true,
                        exit_code: None,
                    };
                }
            },
            ContainerRole::Session => {
                container.status = ContainerStatus {
                    running: true,
                    exit_code: None,
                };
            }
            ContainerRole::Install => {
                let (code, logs) = (self.install_handler.lock().unwrap())(&container.spec.cmd);
                container.status = ContainerStatus {
                    running: false,
                    exit_code: Some(code),
                };
                container.logs = logs;
            }
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _grace_secs: i64) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.status.running = false;
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.killed.lock().unwrap().push(id.to_string());
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.status = ContainerStatus {
            running: false,
            exit_code: Some(137),
        };
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| Self::not_found(id))?;
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        if !self.containers.lock().unwrap().contains_key(id) {
            return Err(Self::not_found(id));
        }
        self.execs
            .lock()
            .unwrap()
            .push((id.to_string(), request.clone()));

        let program = request.cmd.first().map(String::as_str).unwrap_or_default();
        let reply = match program {
            "pkill" | "rm" => ExecReply::ok(""),
            "uv" | "pip" => {
                let (exit_code, output) = (self.install_handler.lock().unwrap())(&request.cmd);
                ExecReply::Output(ExecOutput { exit_code, output })
            }
            _ => (self.exec_handler.lock().unwrap())(id, request),
        };

        match reply {
            ExecReply::Output(output) => Ok(output),
            ExecReply::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn copy_into(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), RuntimeError> {
        if !self.containers.lock().unwrap().contains_key(id) {
            return Err(Self::not_found(id));
        }
        self.files
            .lock()
            .unwrap()
            .insert((id.to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }

    async fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        self.files
            .lock()
            .unwrap()
            .get(&(id.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("{}:{}", id, path)))
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.logs.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.status)
            .ok_or_else(|| Self::not_found(id))
    }

    async fn connect_network(&self, id: &str, _network: &str) -> Result<(), RuntimeError> {
        self.network_calls
            .lock()
            .unwrap()
            .push((id.to_string(), "connect"));
        Ok(())
    }

    async fn disconnect_network(&self, id: &str, _network: &str) -> Result<(), RuntimeError> {
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "endpoint not found".to_string(),
            });
        }
        self.network_calls
            .lock()
            .unwrap()
            .push((id.to_string(), "disconnect"));
        Ok(())
    }
}

/// Defaults with the pool disabled so every run creates its own container
pub fn test_config() -> SandboxConfig {
    let mut config = SandboxConfig::default();
    config.pool.enabled = false;
    config.runtime.poll_interval_ms = 10;
    config
}

pub fn orchestrator(config: SandboxConfig, runtime: &Arc<FakeRuntime>) -> Orchestrator {
    let runtime: Arc<dyn RuntimeClient> = runtime.clone();
    Orchestrator::with_runtime(config, runtime).unwrap()
}

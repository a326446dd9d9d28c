//! Docker/Podman implementation of the runtime client, built on bollard

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::network::{ConnectNetworkOptions, DisconnectNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{ContainerSpec, ContainerStatus, ExecOutput, ExecRequest, RuntimeClient};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;

/// Seconds bollard waits on a single daemon request
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Runtime client talking to a local Docker-compatible daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the configured socket, or the platform defaults
    pub async fn connect(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let docker = match &config.socket {
            Some(socket) => Docker::connect_with_unix(
                socket,
                REQUEST_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(map_error)?;

        let version = docker.version().await.map_err(map_error)?;
        info!(
            version = %version.version.unwrap_or_default(),
            api_version = %version.api_version.unwrap_or_default(),
            "Container runtime connected"
        );

        Ok(Self { docker })
    }
}

/// Translate bollard errors into the runtime taxonomy
fn map_error(err: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error;

    match err {
        Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        Error::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        Error::IOError { err } => RuntimeError::Archive(err),
        other => RuntimeError::Transport(other.to_string()),
    }
}

/// Pack one file into an in-memory tar archive named after the path's basename
fn single_file_archive(path: &str, contents: &[u8]) -> Result<Vec<u8>, RuntimeError> {
    let filename = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid file path {}", path),
            )
        })?;

    let mut buffer = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buffer);
        let mut header = tar::Header::new_gnu();
        header.set_path(filename)?;
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, contents)?;
        builder.finish()?;
    }
    Ok(buffer)
}

/// Extract the first regular file from a tar archive
fn first_file_in_archive(archive: &[u8]) -> Result<Vec<u8>, RuntimeError> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(RuntimeError::NotFound("archive contains no file".to_string()))
}

fn parent_dir(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let name = format!("pysandbox_{}", uuid::Uuid::new_v4().simple());

        let mounts = spec.scratch_volume.as_ref().map(|target| {
            vec![Mount {
                target: Some(target.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(false),
                ..Default::default()
            }]
        });

        let tmpfs = spec
            .read_only
            .then(|| HashMap::from([("/tmp".to_string(), "rw,size=64m".to_string())]));

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            cpu_period: Some(spec.cpu_period),
            cpu_quota: Some(spec.cpu_quota),
            network_mode: Some(spec.network_mode.clone()),
            readonly_rootfs: Some(spec.read_only),
            tmpfs,
            mounts,
            auto_remove: Some(spec.auto_remove),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_error)?;

        for warning in &response.warnings {
            warn!(container_id = %response.id, warning = %warning, "Container created with warning");
        }
        debug!(container_id = %response.id, name = %name, "Container created");

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error)
    }

    async fn stop(&self, id: &str, grace_secs: i64) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await
            .map_err(map_error)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(map_error)
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        let options = CreateExecOptions {
            cmd: Some(request.cmd.clone()),
            env: (!request.env.is_empty()).then(|| request.env.clone()),
            working_dir: request.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(map_error)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_error)?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        output.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(map_error(e)),
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(map_error)?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn copy_into(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), RuntimeError> {
        let archive = single_file_archive(path, contents)?;
        let options = UploadToContainerOptions {
            path: parent_dir(path),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), archive.into())
            .await
            .map_err(map_error)
    }

    async fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(map_error)?);
        }

        first_file_in_archive(&archive)
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut logs = String::new();
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    logs.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(map_error(e)),
            }
        }

        Ok(logs)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;

        let state = response.state.unwrap_or_default();
        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }

    async fn connect_network(&self, id: &str, network: &str) -> Result<(), RuntimeError> {
        let options = ConnectNetworkOptions {
            container: id,
            endpoint_config: Default::default(),
        };

        self.docker
            .connect_network(network, options)
            .await
            .map_err(map_error)
    }

    async fn disconnect_network(&self, id: &str, network: &str) -> Result<(), RuntimeError> {
        let options = DisconnectNetworkOptions {
            container: id,
            force: true,
        };

        self.docker
            .disconnect_network(network, options)
            .await
            .map_err(map_error)
    }
}

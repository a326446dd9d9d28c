//! Package installation
//!
//! Pass-through installs with `uv pip install` or `pip install`, either inside
//! a live session container (via exec) or in a throwaway container with
//! network access. When the configured installer is uv and it fails, the
//! install is retried once with pip.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Installer, PackageConfig, SandboxConfig};
use crate::container::wait::wait_with_deadline;
use crate::container::{release_container, ContainerCreator};
use crate::error::{SandboxError, SandboxResult};
use crate::metrics;
use crate::runtime::{venv_env, ContainerSpec, ExecOutput, ExecRequest, RuntimeClient};

/// Reject names that are empty, contain whitespace or look like installer flags
pub fn validate_package_name(name: &str) -> SandboxResult<()> {
    if name.is_empty() || name.starts_with('-') || name.chars().any(char::is_whitespace) {
        return Err(SandboxError::InvalidPackage(name.to_string()));
    }
    Ok(())
}

/// Full command line for installing `package` with `installer`
pub fn install_command(config: &PackageConfig, installer: Installer, package: &str) -> Vec<String> {
    let mut cmd: Vec<String> = match installer {
        Installer::Uv => vec!["uv".into(), "pip".into(), "install".into()],
        Installer::Pip => vec!["pip".into(), "install".into()],
    };

    if let Some(index_url) = &config.index_url {
        cmd.push("--index-url".to_string());
        cmd.push(index_url.clone());
    }

    for host in &config.trusted_hosts {
        cmd.push("--trusted-host".to_string());
        cmd.push(host.clone());
    }

    cmd.push(package.to_string());
    cmd
}

/// Whether a uv attempt should be retried with pip
fn should_fall_back(outcome: &SandboxResult<ExecOutput>) -> bool {
    match outcome {
        Ok(output) => output.exit_code != 0,
        Err(SandboxError::Timeout(_)) => false,
        Err(_) => true,
    }
}

/// Runs installers inside containers
pub struct PackageInstaller {
    config: Arc<SandboxConfig>,
    runtime: Arc<dyn RuntimeClient>,
    creator: Arc<ContainerCreator>,
}

impl PackageInstaller {
    pub fn new(
        config: Arc<SandboxConfig>,
        runtime: Arc<dyn RuntimeClient>,
        creator: Arc<ContainerCreator>,
    ) -> Self {
        Self {
            config,
            runtime,
            creator,
        }
    }

    /// Install into a running container and return the installer output
    pub async fn install_in_container(&self, container_id: &str, package: &str) -> SandboxResult<String> {
        let primary = self.config.package.installer;
        info!(container_id = %container_id, package = %package, installer = primary.as_str(), "Installing package");

        let mut outcome = self.exec_install(container_id, primary, package).await;
        if primary == Installer::Uv && should_fall_back(&outcome) {
            warn!(container_id = %container_id, package = %package, "uv install failed, retrying with pip");
            outcome = self.exec_install(container_id, Installer::Pip, package).await;
        }

        Ok(self.finish(package, outcome?))
    }

    /// Install in a throwaway container and return its logs
    pub async fn install_ephemeral(&self, package: &str) -> SandboxResult<String> {
        let primary = self.config.package.installer;
        info!(package = %package, installer = primary.as_str(), "Installing package in ephemeral container");

        let mut outcome = self.run_ephemeral(primary, package).await;
        if primary == Installer::Uv && should_fall_back(&outcome) {
            warn!(package = %package, "uv install failed, retrying with pip");
            outcome = self.run_ephemeral(Installer::Pip, package).await;
        }

        Ok(self.finish(package, outcome?))
    }

    fn finish(&self, package: &str, output: ExecOutput) -> String {
        if output.exit_code == 0 {
            info!(package = %package, "Package installed successfully");
        } else {
            warn!(package = %package, exit_code = output.exit_code, "Package installation exited with failure");
        }
        output.output
    }

    async fn exec_install(
        &self,
        container_id: &str,
        installer: Installer,
        package: &str,
    ) -> SandboxResult<ExecOutput> {
        let request = ExecRequest::new(install_command(&self.config.package, installer, package))
            .working_dir(self.config.docker.working_dir.clone())
            .env(venv_env());

        let deadline = self.config.package.install_timeout();
        let outcome = match tokio::time::timeout(deadline, self.runtime.exec(container_id, &request)).await {
            Ok(result) => result.map_err(|e| SandboxError::runtime("exec", e)),
            Err(_) => Err(SandboxError::Timeout(self.config.package.install_timeout)),
        };

        metrics::record_install(
            installer.as_str(),
            matches!(&outcome, Ok(output) if output.exit_code == 0),
        );
        outcome
    }

    async fn run_ephemeral(&self, installer: Installer, package: &str) -> SandboxResult<ExecOutput> {
        let spec = ContainerSpec::installer(
            &self.config,
            install_command(&self.config.package, installer, package),
        )?;
        let container_id = self.creator.create_started(&spec).await?;
        debug!(container_id = %container_id, installer = installer.as_str(), "Install container started");

        let outcome = self.collect_ephemeral(&container_id).await;

        if let Err(e) = release_container(self.runtime.as_ref(), &container_id).await {
            warn!(container_id = %container_id, error = %e, "Failed to release install container");
        }

        metrics::record_install(
            installer.as_str(),
            matches!(&outcome, Ok(output) if output.exit_code == 0),
        );
        outcome
    }

    async fn collect_ephemeral(&self, container_id: &str) -> SandboxResult<ExecOutput> {
        let exit_code = wait_with_deadline(
            self.runtime.as_ref(),
            container_id,
            self.config.package.install_timeout(),
            self.config.runtime.poll_interval(),
            self.config.runtime.fail_open_polling,
        )
        .await?;

        let Some(exit_code) = exit_code else {
            if let Err(e) = self.runtime.kill(container_id).await {
                debug!(container_id = %container_id, error = %e, "Kill after install timeout failed");
            }
            return Err(SandboxError::Timeout(self.config.package.install_timeout));
        };

        let output = self
            .runtime
            .logs(container_id)
            .await
            .map_err(|e| SandboxError::runtime("logs", e))?;

        Ok(ExecOutput { exit_code, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntimeClient;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_install_command() {
        let config = PackageConfig {
            index_url: Some("https://pypi.internal/simple".to_string()),
            trusted_hosts: vec!["pypi.internal".to_string(), "mirror.internal".to_string()],
            ..PackageConfig::default()
        };

        assert_eq!(
            install_command(&config, Installer::Uv, "requests"),
            vec![
                "uv", "pip", "install",
                "--index-url", "https://pypi.internal/simple",
                "--trusted-host", "pypi.internal",
                "--trusted-host", "mirror.internal",
                "requests",
            ]
        );
        assert_eq!(
            install_command(&PackageConfig::default(), Installer::Pip, "numpy==1.26"),
            vec!["pip", "install", "numpy==1.26"]
        );
    }

    #[test]
    fn test_validate_package_name() {
        assert!(validate_package_name("requests").is_ok());
        assert!(validate_package_name("numpy>=1.26").is_ok());
        assert!(validate_package_name("").is_err());
        assert!(validate_package_name("--index-url=evil").is_err());
        assert!(validate_package_name("a b").is_err());
    }

    #[tokio::test]
    async fn test_uv_failure_falls_back_to_pip() {
        let mut runtime = MockRuntimeClient::new();
        runtime
            .expect_exec()
            .withf(|_, request| request.cmd.first().map(String::as_str) == Some("uv"))
            .times(1)
            .returning(|_, _| {
                Ok(ExecOutput {
                    exit_code: 127,
                    output: "uv: not found".to_string(),
                })
            });
        runtime
            .expect_exec()
            .withf(|_, request| request.cmd.first().map(String::as_str) == Some("pip"))
            .times(1)
            .returning(|_, _| {
                Ok(ExecOutput {
                    exit_code: 0,
                    output: "Successfully installed requests".to_string(),
                })
            });

        let runtime: Arc<dyn RuntimeClient> = Arc::new(runtime);
        let installer = PackageInstaller::new(
            Arc::new(SandboxConfig::default()),
            runtime.clone(),
            Arc::new(ContainerCreator::new(runtime, 1)),
        );

        let output = installer.install_in_container("c1", "requests").await.unwrap();
        assert_eq!(output, "Successfully installed requests");
    }

    #[tokio::test]
    async fn test_pip_is_not_retried() {
        let mut runtime = MockRuntimeClient::new();
        runtime.expect_exec().times(1).returning(|_, _| {
            Ok(ExecOutput {
                exit_code: 1,
                output: "No matching distribution".to_string(),
            })
        });

        let mut config = SandboxConfig::default();
        config.package.installer = Installer::Pip;
        let runtime: Arc<dyn RuntimeClient> = Arc::new(runtime);
        let installer = PackageInstaller::new(
            Arc::new(config),
            runtime.clone(),
            Arc::new(ContainerCreator::new(runtime, 1)),
        );

        let output = installer.install_in_container("c1", "nope").await.unwrap();
        assert_eq!(output, "No matching distribution");
    }
}

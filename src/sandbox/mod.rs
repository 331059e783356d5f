//! Docker sandbox plumbing.
//!
//! Ephemeral containers for validating patches: resource limits applied,
//! network disabled unless explicitly opted in, commands executed through
//! the exec API with per-command timeouts, force-removed on the way out.

pub mod scanners;
pub mod validator;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use futures_util::StreamExt;

pub use validator::{
    CommandResult, SandboxRunner, ScanSummary, TestCounts, ValidationRequest, ValidationResult,
    ValidationStatus,
};

/// Sandbox resource settings.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub image: String,
    pub memory: String,
    pub cpus: f64,
    pub timeout_seconds: u64,
    pub network_enabled: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".to_string(),
            memory: "512m".to_string(),
            cpus: 1.0,
            timeout_seconds: 300,
            network_enabled: false,
        }
    }
}

/// One running sandbox container.
pub struct SandboxContainer {
    docker: Docker,
    container_id: String,
}

/// Docker sandbox manager.
pub struct DockerSandbox {
    docker: Docker,
    settings: SandboxSettings,
}

impl DockerSandbox {
    /// Connect to the Docker daemon. Returns None when Docker is not
    /// reachable.
    pub async fn new(settings: SandboxSettings) -> Option<Self> {
        let docker = Docker::connect_with_socket_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        Some(Self { docker, settings })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Create and start a sandbox container for one validation run.
    pub async fn start(&self, run_id: &str) -> Result<SandboxContainer> {
        self.start_inner(run_id, None).await
    }

    /// Start a sandbox with a host checkout bind-mounted at `/workspace`.
    pub async fn start_with_workspace(
        &self,
        run_id: &str,
        workspace: &std::path::Path,
    ) -> Result<SandboxContainer> {
        self.start_inner(run_id, Some(workspace)).await
    }

    async fn start_inner(
        &self,
        run_id: &str,
        workspace: Option<&std::path::Path>,
    ) -> Result<SandboxContainer> {
        self.ensure_image(&self.settings.image).await?;

        let memory = parse_memory_limit(&self.settings.memory)?;
        let mounts = workspace.map(|dir| {
            vec![bollard::models::Mount {
                target: Some("/workspace".to_string()),
                source: Some(dir.to_string_lossy().to_string()),
                typ: Some(bollard::models::MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            }]
        });
        let host_config = HostConfig {
            mounts,
            memory: Some(memory),
            nano_cpus: Some((self.settings.cpus * 1_000_000_000.0) as i64),
            network_mode: if self.settings.network_enabled {
                None
            } else {
                Some("none".to_string())
            },
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert("remedy.sandbox".to_string(), "true".to_string());
        labels.insert("remedy.run-id".to_string(), run_id.to_string());

        let container_config = ContainerCreateBody {
            image: Some(self.settings.image.clone()),
            // Keep the container alive; work happens through exec.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some("/workspace".to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container_name = format!("remedy-sandbox-{}", run_id);
        let create_opts = CreateContainerOptions {
            name: Some(container_name),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .context("Failed to create sandbox container")?;
        let container_id = response.id;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
            .context("Failed to start sandbox container")?;

        Ok(SandboxContainer {
            docker: self.docker.clone(),
            container_id,
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let opts = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull sandbox image")?;
        }
        Ok(())
    }

    /// Remove stale sandbox containers older than `max_age_secs`.
    pub async fn prune_stale(&self, max_age_secs: i64) -> Result<usize> {
        use bollard::query_parameters::ListContainersOptions;

        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec!["remedy.sandbox=true".to_string()],
        );
        let opts = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .context("Failed to list sandbox containers")?;

        let now = chrono::Utc::now().timestamp();
        let mut pruned = 0;
        for container in &containers {
            let created = container.created.unwrap_or(0);
            if now - created > max_age_secs
                && let Some(ref id) = container.id
            {
                let sandbox = SandboxContainer {
                    docker: self.docker.clone(),
                    container_id: id.clone(),
                };
                if sandbox.stop().await.is_ok() {
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }
}

impl SandboxContainer {
    pub fn id(&self) -> &str {
        &self.container_id
    }

    /// Run a shell command inside the container with a timeout. A timeout
    /// reports exit code 124 and `timed_out = true`.
    pub async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<validator::CommandResult> {
        let started = std::time::Instant::now();
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-lc", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let stream = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?;

        let collect = async {
            if let StartExecResults::Attached { mut output, .. } = stream {
                while let Some(Ok(msg)) = output.next().await {
                    match msg {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
        };
        let timed_out = tokio::time::timeout(timeout, collect).await.is_err();

        let exit_code = if timed_out {
            124
        } else {
            self.docker
                .inspect_exec(&exec.id)
                .await
                .ok()
                .and_then(|i| i.exit_code)
                .unwrap_or(-1)
        };

        Ok(validator::CommandResult {
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
            duration_seconds: started.elapsed().as_secs_f64(),
            timed_out,
        })
    }

    /// Stop and force-remove the container.
    pub async fn stop(&self) -> Result<()> {
        let _ = self
            .docker
            .stop_container(
                &self.container_id,
                Some(StopContainerOptions {
                    t: Some(10),
                    ..Default::default()
                }),
            )
            .await;
        let _ = self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        Ok(())
    }
}

/// Parse a memory limit string like "4g" or "512m" into bytes.
fn parse_memory_limit(s: &str) -> Result<i64> {
    let s = s.trim().to_lowercase();
    if let Some(num) = s.strip_suffix('g') {
        let n: f64 = num.parse().context("Invalid memory value")?;
        Ok((n * 1_073_741_824.0) as i64)
    } else if let Some(num) = s.strip_suffix('m') {
        let n: f64 = num.parse().context("Invalid memory value")?;
        Ok((n * 1_048_576.0) as i64)
    } else {
        s.parse::<i64>()
            .context("Invalid memory limit, use '4g' or '512m' format")
    }
}

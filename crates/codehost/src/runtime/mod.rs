//! Container runtime driver.
//!
//! Drives session containers through the Docker or Podman CLI: starting
//! them with the IDE service published on a host port, tailing their logs
//! for connection markers, and stopping them with a bounded wait. The
//! runtime is auto-detected or can be configured explicitly.

mod error;

pub use error::{RuntimeError, RuntimeResult};

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    Docker,
    /// Podman runtime (default for Linux prod)
    #[default]
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Workload settings for session containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Image every session container runs.
    pub image: String,
    /// Port the IDE service listens on inside the container.
    pub service_port: u16,
    /// Name prefix for started containers.
    pub name_prefix: String,
    /// Arguments appended to the container command.
    pub args: Vec<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            image: "codercom/code-server".to_string(),
            service_port: 8080,
            name_prefix: "codehost".to_string(),
            args: vec!["--auth".to_string(), "none".to_string()],
        }
    }
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names are alphanumeric with `-` and `_`.
fn validate_container_id_or_name(id: &str) -> RuntimeResult<()> {
    if id.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(RuntimeError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(RuntimeError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Abstraction over the container runtime for testability.
///
/// Everything the broker knows about containers flows through this
/// contract; the runtime is treated as an external, possibly slow,
/// possibly-failing system.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// List IDs of running containers created from the workload image.
    async fn list_workload_containers(&self) -> RuntimeResult<Vec<String>>;

    /// Time of day the container started, in local time.
    ///
    /// `None` when the container is gone or its start timestamp does not
    /// parse; callers skip the container rather than fail.
    async fn inspect_started_at(&self, container_id: &str) -> RuntimeResult<Option<NaiveTime>>;

    /// Raw timestamps of log lines containing `marker`, oldest first.
    async fn tail_log_marker(&self, container_id: &str, marker: &str)
    -> RuntimeResult<Vec<String>>;

    /// Start a new session container publishing the IDE service on `port`.
    async fn start_session_container(&self, port: u16) -> RuntimeResult<String>;

    /// Stop a container, escalating to a forced kill after `timeout`.
    async fn stop_container(&self, container_id: &str, timeout: Duration) -> RuntimeResult<()>;

    /// The `ps` port-bindings column for a container.
    async fn assigned_ports(&self, container_id: &str) -> RuntimeResult<String>;

    /// Find a running container publishing `port`, if any.
    async fn find_container_by_port(&self, port: u16) -> RuntimeResult<Option<String>>;
}

/// CLI-backed container runtime.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
    /// Session workload settings
    workload: WorkloadConfig,
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Tries Docker first (for macOS dev), then falls back to Podman.
    pub fn new(workload: WorkloadConfig) -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return Self {
                    runtime_type: RuntimeType::Docker,
                    binary: "docker".to_string(),
                    workload,
                };
            }
        }

        if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
                workload,
            }
        } else if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
                workload,
            }
        } else {
            // Fall back to podman, will fail at runtime
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
                workload,
            }
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType, workload: WorkloadConfig) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
            workload,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(
        runtime_type: RuntimeType,
        binary: impl Into<String>,
        workload: WorkloadConfig,
    ) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            workload,
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> RuntimeResult<String> {
        self.run(
            &["version".to_string(), "--format".to_string(), "json".to_string()],
            "version",
        )
        .await
    }

    /// Run the runtime binary and return trimmed stdout on success.
    async fn run(&self, args: &[String], command: &str) -> RuntimeResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RuntimeDriver for ContainerRuntime {
    async fn list_workload_containers(&self) -> RuntimeResult<Vec<String>> {
        let filter = format!("ancestor={}", self.workload.image);
        let stdout = self
            .run(
                &[
                    "ps".to_string(),
                    "--filter".to_string(),
                    filter,
                    "--format".to_string(),
                    "{{.ID}}".to_string(),
                ],
                "ps",
            )
            .await?;

        let short_ids: Vec<&str> = stdout
            .lines()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect();

        // Resolve short IDs to full IDs so session bookkeeping uses one form.
        let mut ids = Vec::with_capacity(short_ids.len());
        for short in short_ids {
            let args = [
                "inspect".to_string(),
                "--format".to_string(),
                "{{.Id}}".to_string(),
                short.to_string(),
            ];
            match self.run(&args, "inspect").await {
                Ok(full) if !full.is_empty() => ids.push(full),
                Ok(_) => {}
                Err(err) => warn!(container = %short, error = %err, "resolving container id failed"),
            }
        }

        Ok(ids)
    }

    async fn inspect_started_at(&self, container_id: &str) -> RuntimeResult<Option<NaiveTime>> {
        validate_container_id_or_name(container_id)?;

        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.StartedAt}}".to_string(),
            container_id.to_string(),
        ];
        let raw = match self.run(&args, "inspect").await {
            Ok(stdout) => stdout,
            // Container not found is not an error; callers treat it as missing.
            Err(_) => return Ok(None),
        };

        if raw.is_empty() {
            return Ok(None);
        }

        match DateTime::parse_from_rfc3339(&raw) {
            Ok(started) => Ok(Some(started.with_timezone(&Local).time())),
            Err(err) => {
                warn!(container = %container_id, raw = %raw, error = %err, "unparseable container start time");
                Ok(None)
            }
        }
    }

    async fn tail_log_marker(
        &self,
        container_id: &str,
        marker: &str,
    ) -> RuntimeResult<Vec<String>> {
        validate_container_id_or_name(container_id)?;

        let stdout = self
            .run(&["logs".to_string(), container_id.to_string()], "logs")
            .await?;

        let times = stdout
            .lines()
            .filter(|line| line.contains(marker))
            .filter_map(|line| line.split_whitespace().next())
            .map(|token| token.trim_matches(['[', ']']).to_string())
            .filter(|token| !token.is_empty())
            .collect();

        Ok(times)
    }

    async fn start_session_container(&self, port: u16) -> RuntimeResult<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "-p".to_string(),
            format!("{}:{}", port, self.workload.service_port),
            "--name".to_string(),
            format!("{}_{}", self.workload.name_prefix, port),
            "--rm".to_string(),
            self.workload.image.clone(),
        ];
        args.extend(self.workload.args.iter().cloned());

        let container_id = self.run(&args, "run").await?;
        if container_id.is_empty() {
            return Err(RuntimeError::ParseError(
                "run returned no container id".to_string(),
            ));
        }

        debug!(container = %container_id, port, "started session container");
        Ok(container_id)
    }

    async fn stop_container(&self, container_id: &str, timeout: Duration) -> RuntimeResult<()> {
        validate_container_id_or_name(container_id)?;

        let stop_args = [
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            container_id.to_string(),
        ];

        // Bound the wait on the stop command itself; a wedged runtime must
        // not block the caller indefinitely.
        let deadline = timeout + Duration::from_secs(5);
        match tokio::time::timeout(deadline, self.run(&stop_args, "stop")).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(err)) => {
                if err.to_string().to_lowercase().contains("no such container") {
                    return Ok(());
                }
                warn!(container = %container_id, error = %err, "stop failed, escalating to kill");
            }
            Err(_) => {
                warn!(container = %container_id, "stop timed out, escalating to kill");
            }
        }

        self.run(&["kill".to_string(), container_id.to_string()], "kill")
            .await
            .map(|_| ())
    }

    async fn assigned_ports(&self, container_id: &str) -> RuntimeResult<String> {
        validate_container_id_or_name(container_id)?;

        let filter = format!("id={container_id}");
        self.run(
            &[
                "ps".to_string(),
                "--filter".to_string(),
                filter,
                "--format".to_string(),
                "{{.Ports}}".to_string(),
            ],
            "ps",
        )
        .await
    }

    async fn find_container_by_port(&self, port: u16) -> RuntimeResult<Option<String>> {
        let stdout = self
            .run(
                &[
                    "ps".to_string(),
                    "--format".to_string(),
                    "{{.ID}} {{.Ports}}".to_string(),
                ],
                "ps",
            )
            .await?;

        let needle = format!(":{port}->");
        for line in stdout.lines() {
            if let Some((id, ports)) = line.split_once(' ')
                && ports.contains(&needle)
            {
                return Ok(Some(id.to_string()));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_type_binary() {
        assert_eq!(RuntimeType::Docker.default_binary(), "docker");
        assert_eq!(RuntimeType::Podman.default_binary(), "podman");
        assert_eq!(RuntimeType::Docker.to_string(), "docker");
    }

    #[test]
    fn test_validate_container_id() {
        assert!(validate_container_id_or_name("abc123def456").is_ok());
        assert!(validate_container_id_or_name("codehost_3001").is_ok());
        assert!(validate_container_id_or_name("").is_err());
        assert!(validate_container_id_or_name("bad id").is_err());
        assert!(validate_container_id_or_name("evil;rm -rf /").is_err());
        assert!(validate_container_id_or_name(&"a".repeat(200)).is_err());
    }

    #[test]
    fn test_workload_defaults() {
        let workload = WorkloadConfig::default();
        assert_eq!(workload.image, "codercom/code-server");
        assert_eq!(workload.service_port, 8080);
        assert_eq!(workload.args, vec!["--auth", "none"]);
    }
}

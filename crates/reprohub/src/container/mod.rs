//! Container runtime management module.
//!
//! Provides an async interface to the session containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.

mod config;
mod error;

pub use config::{ContainerConfig, validate_container_name, validate_image_name};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
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

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// When to pull the session image before launching a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull on every launch.
    #[default]
    Always,
    /// Pull only when the image is missing locally.
    IfNotPresent,
    /// Never pull; the image must already exist.
    Never,
}

/// Validate a container ID or name passed to stop/rm/inspect/exec.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }
    validate_container_name(id)
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/');
    if key.is_empty() || key.len() > 128 || !key.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "invalid label key '{}'",
            key
        )));
    }
    Ok(())
}

/// Go-template value printed by `inspect --format`; empty output and
/// `<no value>` mean the field is not set.
fn inspect_value(stdout: &[u8]) -> Option<String> {
    let value = String::from_utf8_lossy(stdout)
        .trim()
        .trim_matches('"')
        .to_string();
    (!value.is_empty() && value != "<no value>").then_some(value)
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a detached container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;
    /// Value of a label on an existing container. `Ok(None)` when either is absent.
    async fn container_label(
        &self,
        id_or_name: &str,
        key: &str,
    ) -> ContainerResult<Option<String>>;
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;

    /// Execute a command in a running container and return its stdout.
    async fn exec_output(
        &self,
        container_id: &str,
        workdir: Option<&str>,
        command: &[&str],
    ) -> ContainerResult<String>;
}

/// Container runtime client driving the engine CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, then Podman. Falls back to Docker, which will fail at
    /// the first command if nothing is installed.
    pub fn new() -> Self {
        [RuntimeType::Docker, RuntimeType::Podman]
            .into_iter()
            .find(|runtime| Self::is_binary_available(runtime.default_binary()))
            .map(Self::with_type)
            .unwrap_or_else(|| Self::with_type(RuntimeType::Docker))
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the engine binary and capture its output without judging the exit status.
    async fn output(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Run the engine binary and fail on a non-zero exit status.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        let output = self.output(command, args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Build the `run` argument vector for a container config.
    pub fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];

        if config.remove {
            args.push("--rm".to_string());
        }

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(ref network) = config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        for (host, container) in &config.volumes {
            args.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() {
                args.push(format!("{}:{}:Z", host, container));
            } else {
                args.push(format!("{}:{}", host, container));
            }
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref workdir) = config.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    /// The configuration is validated before anything reaches the engine.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let stdout = self.run("run", &self.run_args(config)).await?;
        Ok(stdout.trim().to_string())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.run("stop", &args).await.map(|_| ())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        self.run("rm", &args).await.map(|_| ())
    }

    /// Returns `Ok(None)` when the container does not exist.
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;

        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            id_or_name.to_string(),
        ];
        let output = self.output("inspect", &args).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(inspect_value(&output.stdout))
    }

    async fn container_label(
        &self,
        id_or_name: &str,
        key: &str,
    ) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;
        validate_label_key(key)?;

        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            format!("{{{{index .Config.Labels \"{}\"}}}}", key),
            id_or_name.to_string(),
        ];
        let output = self.output("inspect", &args).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(inspect_value(&output.stdout))
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let args = ["image".to_string(), "inspect".to_string(), image.to_string()];
        let output = self.output("image inspect", &args).await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;
        self.run("pull", &["pull".to_string(), image.to_string()])
            .await
            .map(|_| ())
    }

    async fn exec_output(
        &self,
        container_id: &str,
        workdir: Option<&str>,
        command: &[&str],
    ) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["exec".to_string()];
        if let Some(dir) = workdir {
            args.push("-w".to_string());
            args.push(dir.to_string());
        }
        args.push(container_id.to_string());
        args.extend(command.iter().map(|s| s.to_string()));

        self.run("exec", &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_type_selinux() {
        assert!(!RuntimeType::Docker.needs_selinux_labels());
        assert!(RuntimeType::Podman.needs_selinux_labels());
    }

    #[test]
    fn run_args_orders_flags_before_image_and_command() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Docker);
        let config = ContainerConfig::new("jupyter/base-notebook")
            .name("reprohub-alice")
            .network("hub")
            .remove_on_stop(true)
            .volume("/srv/nb/jupyterhub-user-alice", "/workspace")
            .workdir("/workspace/demo/repo")
            .args(["start-singleuser.sh", "--NotebookApp.default_url=/notebooks/a.ipynb"]);

        let args = runtime.run_args(&config);
        assert_eq!(&args[..3], &["run", "-d", "--rm"]);
        assert!(
            args.windows(2)
                .any(|w| w == ["-v", "/srv/nb/jupyterhub-user-alice:/workspace"])
        );
        let image_pos = args
            .iter()
            .position(|a| a == "jupyter/base-notebook")
            .unwrap();
        assert_eq!(args[image_pos + 1], "start-singleuser.sh");
        assert_eq!(args.last().unwrap(), "--NotebookApp.default_url=/notebooks/a.ipynb");
    }

    #[test]
    fn podman_volumes_get_selinux_label() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Podman);
        let config = ContainerConfig::new("img").volume("/srv/x", "/workspace");
        let args = runtime.run_args(&config);
        assert!(args.contains(&"/srv/x:/workspace:Z".to_string()));
    }

    #[test]
    fn inspect_value_treats_missing_fields_as_none() {
        assert_eq!(inspect_value(b"demo\n"), Some("demo".to_string()));
        assert_eq!(inspect_value(b"\"running\"\n"), Some("running".to_string()));
        assert_eq!(inspect_value(b"<no value>\n"), None);
        assert_eq!(inspect_value(b"\n"), None);
    }

    #[test]
    fn label_keys_are_validated() {
        assert!(validate_label_key("reprohub.artifact").is_ok());
        assert!(validate_label_key("").is_err());
        assert!(validate_label_key("a\" }}{{ .State").is_err());
    }

    #[test]
    fn pull_policy_parses_kebab_case() {
        let policy: PullPolicy = serde_json::from_str("\"if-not-present\"").unwrap();
        assert_eq!(policy, PullPolicy::IfNotPresent);
    }
}

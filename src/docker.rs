use crate::{
    bootstrap::{INPUT_MOUNT, OUTPUT_MOUNT},
    config::SandboxConfig,
    engine::{EnvironmentSpec, ProcessOutput, SandboxRuntime},
    errors::{Result, SandboxError},
    workspace::RESERVED_OUTPUT_DIR,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Label attached to every environment this crate creates
pub const RUN_LABEL: &str = "codegen-sandbox.run";

/// Exit status the docker CLI uses for its own failures
const DOCKER_CLI_FAILURE: i32 = 125;

/// Dockerfile used when the runner image has to be built locally
const DOCKERFILE: &str = r#"FROM python:3.13-slim

RUN pip install --no-cache-dir \
    pandas \
    numpy \
    matplotlib \
    seaborn

ENV MPLCONFIGDIR=/tmp
WORKDIR /work
"#;

/// Container runtime driving the docker CLI.
///
/// Every environment is a named container created from `config.image` with
/// the input directory bind-mounted read-only and the output directory
/// bind-mounted read-write.
pub struct DockerRuntime {
    docker: PathBuf,
    config: SandboxConfig,
    image_ready: OnceCell<()>,
}

impl DockerRuntime {
    /// Create a runtime, locating the docker CLI
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let docker = match &config.docker_path {
            Some(path) if path.exists() => path.clone(),
            Some(path) => {
                return Err(SandboxError::EnvironmentCreateFailed(format!(
                    "docker CLI not found at {}",
                    path.display()
                )))
            }
            None => which::which("docker").map_err(|_| {
                SandboxError::EnvironmentCreateFailed("docker CLI not found in PATH".to_string())
            })?,
        };
        Ok(Self::from_parts(docker, config))
    }

    fn from_parts(docker: PathBuf, config: SandboxConfig) -> Self {
        Self {
            docker,
            config,
            image_ready: OnceCell::new(),
        }
    }

    pub fn docker_path(&self) -> &Path {
        &self.docker
    }

    pub fn image(&self) -> &str {
        &self.config.image
    }

    async fn run_cli(&self, args: &[String]) -> std::io::Result<Output> {
        debug!("[DOCKER] {} {}", self.docker.display(), args.join(" "));
        Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
    }

    /// Make sure the runner image exists, building it when allowed
    pub async fn ensure_image(&self) -> Result<()> {
        let inspect = self
            .run_cli(&["image".into(), "inspect".into(), self.config.image.clone()])
            .await
            .map_err(|e| SandboxError::EnvironmentCreateFailed(format!("docker unavailable: {}", e)))?;
        if inspect.status.success() {
            return Ok(());
        }

        if !self.config.build_image_if_missing {
            return Err(SandboxError::EnvironmentCreateFailed(format!(
                "image {} is not present and building is disabled",
                self.config.image
            )));
        }

        let context = tempfile::Builder::new()
            .prefix("codegen_sandbox_build_")
            .tempdir()?;
        std::fs::write(context.path().join("Dockerfile"), DOCKERFILE)?;

        info!("[DOCKER] Building runner image {}", self.config.image);
        let args = vec![
            "build".to_string(),
            "-t".to_string(),
            self.config.image.clone(),
            context.path().display().to_string(),
        ];
        let build = self
            .run_cli(&args)
            .await
            .map_err(|e| SandboxError::EnvironmentCreateFailed(format!("docker build: {}", e)))?;

        if !build.status.success() {
            let msg = [
                "Failed to build sandbox image.".to_string(),
                format!("Command: docker {}", args.join(" ")),
                format!("Return code: {:?}", build.status.code()),
                format!("STDOUT:\n{}", String::from_utf8_lossy(&build.stdout).trim()),
                format!("STDERR:\n{}", String::from_utf8_lossy(&build.stderr).trim()),
                "Hint: pre-build or pull an image and set CODEGEN_SANDBOX_IMAGE to skip builds."
                    .to_string(),
            ];
            return Err(SandboxError::EnvironmentCreateFailed(msg.join("\n")));
        }
        Ok(())
    }

    /// Arguments for `docker create` for one environment
    pub fn create_args(&self, spec: &EnvironmentSpec) -> Result<Vec<String>> {
        let input = mount_source(&spec.input_dir)?;
        let output = mount_source(&spec.output_dir)?;
        let limits = &self.config.limits;

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.run_id.clone(),
            "--label".to_string(),
            format!("{}={}", RUN_LABEL, spec.run_id),
            "--mount".to_string(),
            format!("type=bind,source={},target={},readonly", input, INPUT_MOUNT),
            "--mount".to_string(),
            format!("type=bind,source={},target={}", output, OUTPUT_MOUNT),
            "--memory".to_string(),
            format!("{}m", limits.memory_mb),
            "--cpus".to_string(),
            limits.cpus.to_string(),
            "--pids-limit".to_string(),
            limits.pids_limit.to_string(),
        ];
        if let Some(network) = self.config.network.as_docker_arg() {
            args.push("--network".to_string());
            args.push(network.to_string());
        }

        let mut env: Vec<(String, String)> = vec![
            ("PYTHONIOENCODING".into(), "utf-8".into()),
            ("PYTHONDONTWRITEBYTECODE".into(), "1".into()),
            ("MPLBACKEND".into(), "Agg".into()),
            ("CODEGEN_INPUT_DIR".into(), INPUT_MOUNT.into()),
            ("CODEGEN_OUTPUT_DIR".into(), OUTPUT_MOUNT.into()),
        ];
        let mut extra: Vec<_> = self.config.env_vars.iter().collect();
        extra.sort();
        env.extend(extra.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.config.image.clone());
        args.extend(spec.command.iter().cloned());
        Ok(args)
    }
}

fn mount_source(dir: &Path) -> Result<String> {
    let path = std::fs::canonicalize(dir).map_err(|e| {
        SandboxError::EnvironmentCreateFailed(format!("cannot resolve mount {}: {}", dir.display(), e))
    })?;
    let text = path.display().to_string();
    if text.contains(',') {
        return Err(SandboxError::EnvironmentCreateFailed(format!(
            "mount path may not contain ',': {}",
            text
        )));
    }
    Ok(text)
}

/// Docker reports some failures on stdout only
fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}

fn is_missing_container(text: &str) -> bool {
    text.contains("No such container") || text.contains("is not running")
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn prepare(&self) -> Result<()> {
        self.image_ready
            .get_or_try_init(|| self.ensure_image())
            .await?;
        Ok(())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<()> {
        let args = self.create_args(spec)?;
        let output = self
            .run_cli(&args)
            .await
            .map_err(|e| SandboxError::EnvironmentCreateFailed(format!("docker create: {}", e)))?;
        if !output.status.success() {
            return Err(SandboxError::EnvironmentCreateFailed(format!(
                "docker create exited with {:?}: {}",
                output.status.code(),
                failure_text(&output)
            )));
        }
        info!("[DOCKER] Created container {}", spec.run_id);
        Ok(())
    }

    async fn start(&self, spec: &EnvironmentSpec) -> Result<ProcessOutput> {
        let child = Command::new(&self.docker)
            .args(["start", "--attach", spec.run_id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::EnvironmentCreateFailed(format!("docker start: {}", e)))?;

        let output = child.wait_with_output().await.map_err(|e| SandboxError::CaptureFailed {
            context: format!("reading streams of {}", spec.run_id),
            source: e,
        })?;

        let exit_status = output.status.code();
        let summary = spec.output_dir.join(RESERVED_OUTPUT_DIR).join("result.json");
        if exit_status == Some(DOCKER_CLI_FAILURE) && !summary.exists() {
            return Err(SandboxError::EnvironmentCreateFailed(format!(
                "docker start failed: {}",
                failure_text(&output)
            )));
        }

        Ok(ProcessOutput {
            exit_status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn kill(&self, run_id: &str) -> Result<()> {
        let output = self.run_cli(&["kill".into(), run_id.to_string()]).await?;
        if !output.status.success() {
            let text = failure_text(&output);
            if !is_missing_container(&text) {
                warn!("[DOCKER] Failed to kill {}: {}", run_id, text);
            }
        }
        Ok(())
    }

    async fn destroy(&self, run_id: &str) -> Result<()> {
        let output = self
            .run_cli(&["rm".into(), "--force".into(), run_id.to_string()])
            .await?;
        if !output.status.success() {
            let text = failure_text(&output);
            if !is_missing_container(&text) {
                return Err(SandboxError::InternalError(format!(
                    "failed to remove container {}: {}",
                    run_id, text
                )));
            }
        }
        info!("[DOCKER] Removed container {}", run_id);
        Ok(())
    }

    fn release(&self, run_id: &str) {
        let status = std::process::Command::new(&self.docker)
            .args(["rm", "--force", run_id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => info!("[DOCKER] Released container {}", run_id),
            Ok(s) => warn!("[DOCKER] Releasing {} exited with {:?}", run_id, s.code()),
            Err(e) => warn!("[DOCKER] Failed to release {}: {}", run_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkMode;
    use std::time::Duration;

    fn spec(base: &Path) -> EnvironmentSpec {
        let input_dir = base.join("inputs");
        let output_dir = base.join("outputs");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();
        EnvironmentSpec {
            run_id: "codegen-test".to_string(),
            input_dir,
            output_dir,
            command: crate::bootstrap::entry_command(),
            deadline: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_create_args_mount_modes() {
        let base = tempfile::tempdir().unwrap();
        let runtime = DockerRuntime::from_parts(PathBuf::from("docker"), SandboxConfig::default());
        let args = runtime.create_args(&spec(base.path())).unwrap();

        let mounts: Vec<&String> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, _)| flag.as_str() == "--mount")
            .map(|(_, value)| value)
            .collect();
        assert_eq!(mounts.len(), 2);
        assert!(mounts[0].ends_with("target=/inputs,readonly"));
        assert!(mounts[1].ends_with("target=/outputs"));
        assert!(!mounts[1].contains("readonly"));

        // image comes right before the bootstrap command
        let image_pos = args.iter().position(|a| a == crate::config::DEFAULT_IMAGE).unwrap();
        assert_eq!(args[image_pos + 1..], crate::bootstrap::entry_command()[..]);
        assert!(!args.contains(&"--network".to_string()));
    }

    #[test]
    fn test_create_args_network_and_env() {
        let base = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default().with_network(NetworkMode::Disabled);
        config.env_vars.insert("TZ".to_string(), "UTC".to_string());
        let runtime = DockerRuntime::from_parts(PathBuf::from("docker"), config);
        let args = runtime.create_args(&spec(base.path())).unwrap();

        let net = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[net + 1], "none");
        assert!(args.contains(&"TZ=UTC".to_string()));
        assert!(args.contains(&"CODEGEN_OUTPUT_DIR=/outputs".to_string()));
    }

    #[test]
    fn test_missing_mount_is_create_failure() {
        let base = tempfile::tempdir().unwrap();
        let runtime = DockerRuntime::from_parts(PathBuf::from("docker"), SandboxConfig::default());
        let mut spec = spec(base.path());
        spec.input_dir = base.path().join("does-not-exist");
        assert!(matches!(
            runtime.create_args(&spec),
            Err(SandboxError::EnvironmentCreateFailed(_))
        ));
    }

    #[test]
    fn test_explicit_docker_path_must_exist() {
        let config = SandboxConfig {
            docker_path: Some(PathBuf::from("/definitely/not/docker")),
            ..Default::default()
        };
        assert!(matches!(
            DockerRuntime::new(config),
            Err(SandboxError::EnvironmentCreateFailed(_))
        ));
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default image used for every isolated environment.
pub const DEFAULT_IMAGE: &str = "codegen-sandbox-runner:py313";

/// Network attachment of the isolated environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Whatever the container runtime attaches by default (usually a bridge)
    /// Generated code can install packages
    #[default]
    Default,
    /// No network at all (`--network none`)
    Disabled,
    /// A named runtime network
    Named(String),
}

impl NetworkMode {
    /// Parse the textual form used by environment overrides
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "default" => NetworkMode::Default,
            "none" | "disabled" | "off" => NetworkMode::Disabled,
            _ => NetworkMode::Named(s.trim().to_string()),
        }
    }

    /// Value for `--network`, if one has to be passed
    pub fn as_docker_arg(&self) -> Option<&str> {
        match self {
            NetworkMode::Default => None,
            NetworkMode::Disabled => Some("none"),
            NetworkMode::Named(name) => Some(name.as_str()),
        }
    }
}

/// Resource limits for one isolated environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Maximum memory in MB
    pub memory_mb: usize,
    /// CPU share (fractional cores)
    pub cpus: f32,
    /// Maximum number of processes inside the environment
    pub pids_limit: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpus: 1.0,
            pids_limit: 256,
        }
    }
}

/// Configuration of the isolated execution environment
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Explicit path to the docker CLI; looked up in PATH when unset
    pub docker_path: Option<PathBuf>,
    /// Image every environment is created from
    pub image: String,
    /// Build `image` from the bundled Dockerfile when it is not present
    pub build_image_if_missing: bool,
    /// Base directory for per-run host workspaces (the two mounts)
    pub workspace_base: PathBuf,
    /// Resource limits
    pub limits: ResourceLimits,
    /// Network attachment
    pub network: NetworkMode,
    /// Wall-clock deadline for bootstrap + generated code
    pub deadline: Duration,
    /// Extra environment variables set inside the environment
    pub env_vars: HashMap<String, String>,
    /// Only transfer variables the generated code mentions by name
    pub transfer_referenced_only: bool,
    /// Leave each run's host workspace on disk for debugging
    pub keep_workspaces: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_path: None,
            image: DEFAULT_IMAGE.to_string(),
            build_image_if_missing: true,
            workspace_base: std::env::temp_dir().join("codegen-sandbox-workspaces"),
            limits: ResourceLimits::default(),
            network: NetworkMode::default(),
            deadline: Duration::from_secs(120),
            env_vars: HashMap::new(),
            transfer_referenced_only: true,
            keep_workspaces: false,
        }
    }
}

impl SandboxConfig {
    /// Defaults overlaid with `CODEGEN_SANDBOX_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SandboxConfig::from_env`] but reading from an arbitrary source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(image) = get("CODEGEN_SANDBOX_IMAGE") {
            config.image = image;
        }
        if let Some(docker) = get("CODEGEN_SANDBOX_DOCKER") {
            config.docker_path = Some(PathBuf::from(docker));
        }
        if let Some(secs) = get("CODEGEN_SANDBOX_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
            config.deadline = Duration::from_secs(secs.max(1));
        }
        if let Some(network) = get("CODEGEN_SANDBOX_NETWORK") {
            config.network = NetworkMode::parse(&network);
        }
        if let Some(base) = get("CODEGEN_SANDBOX_WORKSPACE_BASE") {
            config.workspace_base = PathBuf::from(base);
        }
        if let Some(keep) = get("CODEGEN_SANDBOX_KEEP_WORKSPACES") {
            config.keep_workspaces = matches!(keep.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(mb) = get("CODEGEN_SANDBOX_MEMORY_MB").and_then(|v| v.parse::<usize>().ok()) {
            config.limits.memory_mb = mb;
        }
        config
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn with_workspace_base(mut self, base: PathBuf) -> Self {
        self.workspace_base = base;
        self
    }
}

/// A resolved credential handed to the code generator.
///
/// Never transferred into the isolated environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    key_name: String,
    secret: String,
}

impl Credentials {
    pub fn new(key_name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            secret: secret.into(),
        }
    }

    /// Name of the variable the secret was resolved from
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key_name", &self.key_name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Everything the refinement controller needs, injected at construction.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub sandbox: SandboxConfig,
    /// Upper bound on a single code-generation call
    pub generation_timeout: Duration,
    /// Resolved credential passed through to the generator
    pub credentials: Option<Credentials>,
    /// Where successful code is archived, if anywhere
    pub archive_dir: Option<PathBuf>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            generation_timeout: Duration::from_secs(180),
            credentials: None,
            archive_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_parse() {
        assert_eq!(NetworkMode::parse(""), NetworkMode::Default);
        assert_eq!(NetworkMode::parse("None"), NetworkMode::Disabled);
        assert_eq!(
            NetworkMode::parse("analysis-net"),
            NetworkMode::Named("analysis-net".to_string())
        );
        assert_eq!(NetworkMode::Disabled.as_docker_arg(), Some("none"));
        assert_eq!(NetworkMode::Default.as_docker_arg(), None);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CODEGEN_SANDBOX_IMAGE", "my-runner:latest"),
            ("CODEGEN_SANDBOX_TIMEOUT_SECS", "7"),
            ("CODEGEN_SANDBOX_NETWORK", "none"),
            ("CODEGEN_SANDBOX_MEMORY_MB", "not-a-number"),
            ("CODEGEN_SANDBOX_KEEP_WORKSPACES", "True"),
        ]
        .into_iter()
        .collect();

        let config = SandboxConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.image, "my-runner:latest");
        assert_eq!(config.deadline, Duration::from_secs(7));
        assert_eq!(config.network, NetworkMode::Disabled);
        assert!(config.keep_workspaces);
        // unparsable values keep the default
        assert_eq!(config.limits.memory_mb, ResourceLimits::default().memory_mb);
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("OPENAI_API_KEY", "sk-very-secret");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("OPENAI_API_KEY"));
        assert!(!shown.contains("sk-very-secret"));
    }
}

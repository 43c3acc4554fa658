//! Locates the state directory and credentials for standalone use.
//!
//! The workflow never calls into this module; it only receives the resolved
//! [`WorkflowConfig`]. Lookup order for dotenv files:
//!
//! 1. `CODEGEN_SANDBOX_DOTENV_PATH`
//! 2. `./.env`
//! 3. `/secrets/codegen_sandbox/.env`
//! 4. `<user config dir>/codegen_sandbox/.env`
//!
//! The first existing file is read, then `<state dir>/.env`. Values already
//! present in the process environment always win.

use crate::config::{Credentials, SandboxConfig, WorkflowConfig};
use crate::errors::Result;
use directories::{BaseDirs, ProjectDirs};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const APP_NAME: &str = "codegen_sandbox";

/// Keys checked, in order, for the generator credential
pub const CREDENTIAL_KEYS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
];

/// Everything discovery reads from the outside world
#[derive(Debug, Clone, Default)]
pub struct DiscoveryInputs {
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    pub home_dir: Option<PathBuf>,
    pub secrets_dir: PathBuf,
    pub config_dir: Option<PathBuf>,
    pub platform_state_dir: Option<PathBuf>,
}

impl DiscoveryInputs {
    pub fn from_process() -> Self {
        let base = BaseDirs::new();
        let project = ProjectDirs::from("", "", APP_NAME);
        Self {
            env: std::env::vars().collect(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            home_dir: base.as_ref().map(|b| b.home_dir().to_path_buf()),
            secrets_dir: Path::new("/secrets").join(APP_NAME),
            config_dir: base.as_ref().map(|b| b.config_dir().join(APP_NAME)),
            platform_state_dir: project.map(|p| p.state_dir().unwrap_or(p.data_local_dir()).to_path_buf()),
        }
    }

    fn dotenv_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(explicit) = self.env_value("CODEGEN_SANDBOX_DOTENV_PATH") {
            candidates.push(self.expand(explicit));
        }
        candidates.push(self.cwd.join(".env"));
        candidates.push(self.secrets_dir.join(".env"));
        if let Some(config) = &self.config_dir {
            candidates.push(config.join(".env"));
        }
        candidates
    }

    fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn expand(&self, path: &str) -> PathBuf {
        match (path.strip_prefix("~/"), &self.home_dir) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(path),
        }
    }
}

/// Result of discovery
#[derive(Debug, Clone)]
pub struct Discovered {
    pub state_dir: PathBuf,
    /// The dotenv file that was read first, if any
    pub dotenv_path: Option<PathBuf>,
    pub credentials: Option<Credentials>,
    values: HashMap<String, String>,
}

impl Discovered {
    /// Merged value: process environment first, then dotenv files
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    /// Where successful code is archived
    pub fn generated_code_dir(&self) -> PathBuf {
        self.state_dir.join("gen_codes")
    }

    /// Create the state directory and its subdirectories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.state_dir.clone(),
            self.logs_dir(),
            self.cache_dir(),
            self.generated_code_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Workflow configuration built from the discovered values
    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            sandbox: SandboxConfig::from_lookup(|key| self.get(key).map(str::to_string)),
            credentials: self.credentials.clone(),
            archive_dir: Some(self.generated_code_dir()),
            ..Default::default()
        }
    }
}

/// Discover from the real process environment and filesystem
pub fn discover() -> Discovered {
    discover_with(&DiscoveryInputs::from_process())
}

pub fn discover_with(inputs: &DiscoveryInputs) -> Discovered {
    let mut values = inputs.env.clone();

    let dotenv_path = inputs
        .dotenv_candidates()
        .into_iter()
        .find(|path| path.is_file());
    if let Some(path) = &dotenv_path {
        merge_file(&mut values, path);
    }

    let state_dir = match values
        .get("CODEGEN_SANDBOX_STATE")
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
    {
        Some(explicit) => inputs.expand(explicit),
        None => inputs
            .platform_state_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME)),
    };

    let state_env = state_dir.join(".env");
    if state_env.is_file() {
        merge_file(&mut values, &state_env);
    }

    let credentials = CREDENTIAL_KEYS.iter().find_map(|key| {
        values
            .get(*key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|v| Credentials::new(*key, v))
    });

    debug!(
        "[DISCOVERY] state_dir={:?} dotenv={:?} credentials={:?}",
        state_dir, dotenv_path, credentials
    );

    Discovered {
        state_dir,
        dotenv_path,
        credentials,
        values,
    }
}

/// Add the file's entries without overriding existing keys
fn merge_file(values: &mut HashMap<String, String>, path: &Path) {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            for (key, value) in parse_dotenv(&text) {
                values.entry(key).or_insert(value);
            }
        }
        Err(e) => warn!("[DISCOVERY] Failed to read {:?}: {}", path, e),
    }
}

/// `KEY=value` lines; `#` comments, `export` prefixes and quotes are handled
pub fn parse_dotenv(text: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = match value.chars().next() {
            Some(q @ ('"' | '\'')) => match value[1..].find(q) {
                Some(end) => &value[1..=end],
                None => value,
            },
            _ => value.split(" #").next().unwrap_or(value).trim_end(),
        };
        entries.push((key.to_string(), value.to_string()));
    }
    entries
}

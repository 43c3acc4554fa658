use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle of one isolated environment instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Created,
    Running,
    Completed,
    TimedOut,
    Destroyed,
}

/// What a runtime needs to create one environment
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Run-scoped identifier; the runtime names the environment after it
    pub run_id: String,
    /// Host directory mounted read-only at the input mount point
    pub input_dir: PathBuf,
    /// Host directory mounted read-write at the output mount point
    pub output_dir: PathBuf,
    /// Bootstrap command line run inside the environment
    pub command: Vec<String>,
    /// Wall-clock budget for the whole run
    pub deadline: Duration,
}

/// Streams and exit status collected from a finished environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub exit_status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Raw result of one environment run, before capture
#[derive(Debug, Clone)]
pub struct RawExecutionRecord {
    pub run_id: String,
    /// `Completed` or `TimedOut`
    pub state: EnvironmentState,
    pub output: ProcessOutput,
    pub elapsed: Duration,
}

impl RawExecutionRecord {
    pub fn timed_out(&self) -> bool {
        self.state == EnvironmentState::TimedOut
    }
}

/// Trait for container runtimes hosting isolated environments.
///
/// Each method maps to one lifecycle transition; the sandbox drives them in
/// order and guarantees `destroy` (or `release` on drop paths) is reached.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Runtime name for logs
    fn name(&self) -> &str;

    /// One-time preparation before the first environment (image checks)
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Create the environment with both mounts attached (`Created`)
    async fn create(&self, spec: &EnvironmentSpec) -> Result<()>;

    /// Run the bootstrap to completion (`Running` -> `Completed`)
    async fn start(&self, spec: &EnvironmentSpec) -> Result<ProcessOutput>;

    /// Forcibly stop a running environment (`TimedOut`)
    async fn kill(&self, run_id: &str) -> Result<()>;

    /// Remove the environment (`Destroyed`)
    async fn destroy(&self, run_id: &str) -> Result<()>;

    /// Blocking best-effort removal used when the owning future is dropped
    fn release(&self, run_id: &str);
}

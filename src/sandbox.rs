use crate::bootstrap;
use crate::capture::{self, CapturedResult};
use crate::config::SandboxConfig;
use crate::docker::DockerRuntime;
use crate::engine::{EnvironmentSpec, EnvironmentState, ProcessOutput, RawExecutionRecord, SandboxRuntime};
use crate::errors::Result;
use crate::marshal::{self, Variables};
use crate::workspace::Workspace;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything one isolated run produced
#[derive(Debug, Clone)]
pub struct Execution {
    pub run_id: String,
    /// `Completed` or `TimedOut`; the environment itself is already destroyed
    pub state: EnvironmentState,
    pub captured: CapturedResult,
    /// Variables the code handed back with `declare_output`
    pub outputs: Variables,
    /// Names of the variables that were transferred in
    pub transferred: Vec<String>,
    pub elapsed: Duration,
}

/// Destroys the environment exactly once.
///
/// `teardown` is the normal path. If the owning future is dropped first
/// (caller cancellation) the guard falls back to the runtime's blocking
/// `release`.
struct EnvironmentGuard {
    runtime: Arc<dyn SandboxRuntime>,
    run_id: String,
    armed: bool,
}

impl EnvironmentGuard {
    fn arm(runtime: Arc<dyn SandboxRuntime>, run_id: &str) -> Self {
        Self {
            runtime,
            run_id: run_id.to_string(),
            armed: true,
        }
    }

    async fn teardown(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        let result = self.runtime.destroy(&self.run_id).await;
        self.armed = false;
        info!("[SANDBOX] Environment {} -> {:?}", self.run_id, EnvironmentState::Destroyed);
        result
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("[SANDBOX] Releasing environment {} on drop", self.run_id);
            self.runtime.release(&self.run_id);
            self.armed = false;
        }
    }
}

/// Runs one piece of generated code in a fresh isolated environment.
///
/// The caller never cleans up: every path out of [`Sandbox::execute`],
/// including dropping its future, destroys the environment and removes the
/// host workspace.
#[derive(Clone)]
pub struct Sandbox {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxConfig) -> Self {
        Self { runtime, config }
    }

    /// Sandbox backed by the local docker CLI
    pub fn docker(config: SandboxConfig) -> Result<Self> {
        let runtime = DockerRuntime::new(config.clone())?;
        Ok(Self::new(Arc::new(runtime), config))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Marshal `variables`, run `code` under the deadline and capture everything.
    ///
    /// Timeouts and exceptions in the code are part of the returned
    /// [`Execution`]; only infrastructure faults are errors.
    pub async fn execute(&self, code: &str, variables: &Variables) -> Result<Execution> {
        let mut workspace = Workspace::new(&self.config.workspace_base)?;
        if self.config.keep_workspaces {
            workspace.keep();
        }

        let referenced = self
            .config
            .transfer_referenced_only
            .then(|| marshal::referenced_names(code));
        let bundle = marshal::marshal(variables, &workspace.vars_dir(), referenced.as_ref())?;
        bootstrap::install(&workspace, code)?;

        self.runtime.prepare().await?;

        let spec = EnvironmentSpec {
            run_id: workspace.run_id().to_string(),
            input_dir: workspace.input_dir(),
            output_dir: workspace.output_dir(),
            command: bootstrap::entry_command(),
            deadline: self.config.deadline,
        };

        // Armed before `create` so a cancelled create still gets released.
        let mut guard = EnvironmentGuard::arm(self.runtime.clone(), &spec.run_id);
        if let Err(e) = self.runtime.create(&spec).await {
            if let Err(teardown) = guard.teardown().await {
                error!("[SANDBOX] Teardown after failed create: {}", teardown);
            }
            return Err(e);
        }
        info!(
            "[SANDBOX] Environment {} -> {:?} ({} variables, {} bytes)",
            spec.run_id,
            EnvironmentState::Created,
            bundle.entries.len(),
            bundle.bytes_written
        );

        let record = match self.run(&spec).await {
            Ok(record) => record,
            Err(e) => {
                if let Err(teardown) = guard.teardown().await {
                    error!("[SANDBOX] Teardown after failed start: {}", teardown);
                }
                return Err(e);
            }
        };

        let collected = collect(&record, &workspace);
        if let Err(e) = guard.teardown().await {
            error!("[SANDBOX] Failed to destroy environment {}: {}", spec.run_id, e);
        }
        let (captured, outputs) = collected?;

        Ok(Execution {
            run_id: record.run_id,
            state: record.state,
            captured,
            outputs,
            transferred: bundle.entries.into_iter().map(|e| e.name).collect(),
            elapsed: record.elapsed,
        })
    }

    async fn run(&self, spec: &EnvironmentSpec) -> Result<RawExecutionRecord> {
        info!("[SANDBOX] Environment {} -> {:?}", spec.run_id, EnvironmentState::Running);
        let started = Instant::now();

        match tokio::time::timeout(spec.deadline, self.runtime.start(spec)).await {
            Ok(output) => {
                let output = output?;
                info!(
                    "[SANDBOX] Environment {} -> {:?} (exit {:?}, {:?})",
                    spec.run_id,
                    EnvironmentState::Completed,
                    output.exit_status,
                    started.elapsed()
                );
                Ok(RawExecutionRecord {
                    run_id: spec.run_id.clone(),
                    state: EnvironmentState::Completed,
                    output,
                    elapsed: started.elapsed(),
                })
            }
            Err(_) => {
                warn!(
                    "[SANDBOX] Environment {} exceeded deadline of {:?}",
                    spec.run_id, spec.deadline
                );
                if let Err(e) = self.runtime.kill(&spec.run_id).await {
                    warn!("[SANDBOX] Failed to kill {}: {}", spec.run_id, e);
                }
                info!("[SANDBOX] Environment {} -> {:?}", spec.run_id, EnvironmentState::TimedOut);
                Ok(RawExecutionRecord {
                    run_id: spec.run_id.clone(),
                    state: EnvironmentState::TimedOut,
                    output: ProcessOutput::default(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}

fn collect(record: &RawExecutionRecord, workspace: &Workspace) -> Result<(CapturedResult, Variables)> {
    let mut captured = capture::capture(record, workspace)?;
    if captured.timed_out {
        return Ok((captured, Variables::new()));
    }
    if workspace.reserved_dir_replaced() {
        warn!("[SANDBOX] Reserved output directory of {} was replaced", record.run_id);
        captured.declared_output_error = Some("reserved output directory was replaced by generated code".to_string());
        return Ok((captured, Variables::new()));
    }
    match marshal::unmarshal(&workspace.declared_outputs_dir()) {
        Ok(outputs) => Ok((captured, outputs)),
        Err(e) => {
            warn!("[SANDBOX] Rejected declared outputs of {}: {}", record.run_id, e);
            captured.declared_output_error = Some(e.to_string());
            Ok((captured, Variables::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Runtime that only records lifecycle calls and writes a summary
    #[derive(Default)]
    struct RecordingRuntime {
        calls: Mutex<Vec<String>>,
        hang: bool,
    }

    impl RecordingRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SandboxRuntime for RecordingRuntime {
        fn name(&self) -> &str {
            "recording"
        }

        async fn create(&self, spec: &EnvironmentSpec) -> Result<()> {
            self.calls.lock().unwrap().push(format!("create {}", spec.run_id));
            Ok(())
        }

        async fn start(&self, spec: &EnvironmentSpec) -> Result<ProcessOutput> {
            self.calls.lock().unwrap().push("start".to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            let vars = std::fs::read_to_string(spec.input_dir.join("vars/manifest.json")).unwrap();
            std::fs::create_dir_all(spec.output_dir.join(".codegen")).unwrap();
            std::fs::write(
                spec.output_dir.join(".codegen/result.json"),
                r#"{"status":"ok","exit_code":0,"declared_outputs":[]}"#,
            )
            .unwrap();
            Ok(ProcessOutput {
                exit_status: Some(0),
                stdout: vars.into_bytes(),
                stderr: Vec::new(),
            })
        }

        async fn kill(&self, _run_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push("kill".to_string());
            Ok(())
        }

        async fn destroy(&self, _run_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push("destroy".to_string());
            Ok(())
        }

        fn release(&self, _run_id: &str) {
            self.calls.lock().unwrap().push("release".to_string());
        }
    }

    fn config(base: &std::path::Path) -> SandboxConfig {
        SandboxConfig::default()
            .with_workspace_base(base.to_path_buf())
            .with_deadline(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_execute_transfers_referenced_variables_only() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime::default());
        let sandbox = Sandbox::new(runtime.clone(), config(base.path()));
        let vars = Variables::new()
            .with("settings", json!({"k": 1}))
            .with("unused", json!([1, 2]));

        let execution = sandbox.execute("print(settings)", &vars).await.unwrap();
        assert_eq!(execution.state, EnvironmentState::Completed);
        assert_eq!(execution.transferred, vec!["settings".to_string()]);
        assert!(execution.captured.stdout.contains("settings"));
        assert!(!execution.captured.stdout.contains("unused"));

        let calls = runtime.calls();
        assert_eq!(calls.last().map(String::as_str), Some("destroy"));
        assert!(!calls.contains(&"release".to_string()));
        // workspace removed with the execution
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_kills_and_destroys() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime {
            hang: true,
            ..Default::default()
        });
        let sandbox = Sandbox::new(runtime.clone(), config(base.path()));

        let execution = sandbox.execute("while True: pass", &Variables::new()).await.unwrap();
        assert_eq!(execution.state, EnvironmentState::TimedOut);
        assert!(execution.captured.timed_out);
        let calls = runtime.calls();
        assert_eq!(&calls[1..], &["start", "kill", "destroy"]);
    }

    #[tokio::test]
    async fn test_dropped_execution_releases_environment() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime {
            hang: true,
            ..Default::default()
        });
        let sandbox = Sandbox::new(runtime.clone(), config(base.path()).with_deadline(Duration::from_secs(60)));

        let vars = Variables::new();
        let run = sandbox.execute("while True: pass", &vars);
        let cancelled = tokio::time::timeout(Duration::from_millis(50), run).await;
        assert!(cancelled.is_err());
        assert_eq!(runtime.calls().last().map(String::as_str), Some("release"));
    }

    #[tokio::test]
    async fn test_bad_variable_never_creates_environment() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RecordingRuntime::default());
        let sandbox = Sandbox::new(runtime.clone(), config(base.path()));
        let vars = Variables::new().with("class", json!(1));

        let err = sandbox.execute("print(1)", &vars).await.unwrap_err();
        assert!(matches!(err, crate::SandboxError::Serialization { .. }));
        assert!(runtime.calls().is_empty());
    }
}

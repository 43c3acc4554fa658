#![allow(dead_code)]

use async_trait::async_trait;
use codegen_sandbox::marshal::{self, Variables};
use codegen_sandbox::{
    CodeGenerator, EnvironmentSpec, EventSink, GenerationRequest, ProcessOutput, Result, Sandbox,
    SandboxConfig, SandboxError, SandboxRuntime, WorkflowEvent,
};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Lifecycle {
    pub live: HashSet<String>,
    pub max_live: usize,
    pub created: Vec<String>,
    pub killed: Vec<String>,
    pub destroyed: Vec<String>,
    pub released: Vec<String>,
}

/// In-process runtime that interprets a tiny line-based script instead of Python.
///
/// ```text
/// print <text>        line on stdout
/// echo <var>          transferred variable as JSON on stdout
/// raise <Type> <msg>  exception trace on stderr, exit 1
/// exit <n>            exit with status n
/// sleep               never finishes
/// write-input         attempt to write to the input mount
/// export <var>        hand a transferred variable back as a declared output
/// artifact <file>     write a file to the output mount
/// corrupt-outputs     leave a declared-output manifest pointing outside its bundle
/// leak <host path>    declare an output that is a symlink to a host file
/// ```
#[derive(Default)]
pub struct FakeRuntime {
    pub lifecycle: Mutex<Lifecycle>,
    pub fail_create: bool,
    pub hang_create: bool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_create() -> Arc<Self> {
        Arc::new(Self {
            fail_create: true,
            ..Default::default()
        })
    }

    /// Registers the environment, then never returns from `create`
    pub fn hanging_create() -> Arc<Self> {
        Arc::new(Self {
            hang_create: true,
            ..Default::default()
        })
    }

    pub fn snapshot<T>(&self, f: impl FnOnce(&Lifecycle) -> T) -> T {
        f(&self.lifecycle.lock().unwrap())
    }
}

fn trace(kind: &str, message: &str) -> String {
    format!(
        "Traceback (most recent call last):\n  File \"<generated>\", line 1, in <module>\n{}: {}\n",
        kind, message
    )
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<()> {
        if self.fail_create {
            return Err(SandboxError::EnvironmentCreateFailed(
                "daemon not reachable".to_string(),
            ));
        }
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            lifecycle.live.insert(spec.run_id.clone());
            lifecycle.max_live = lifecycle.max_live.max(lifecycle.live.len());
            lifecycle.created.push(spec.run_id.clone());
        }
        if self.hang_create {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn start(&self, spec: &EnvironmentSpec) -> Result<ProcessOutput> {
        let code = std::fs::read_to_string(spec.input_dir.join("code.py"))?;
        let inputs = marshal::unmarshal(&spec.input_dir.join("vars"))?;
        let reserved = spec.output_dir.join(".codegen");
        std::fs::create_dir_all(&reserved)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;
        let mut exception = serde_json::Value::Null;
        let mut exports = Variables::new();
        let mut corrupt = false;
        let mut leak: Option<String> = None;

        for line in code.lines() {
            let (directive, arg) = line.split_once(' ').unwrap_or((line, ""));
            match directive {
                "print" => {
                    stdout.push_str(arg);
                    stdout.push('\n');
                }
                "echo" => {
                    let value = inputs.get(arg).and_then(|v| v.as_json()).cloned();
                    stdout.push_str(&serde_json::to_string(&value)?);
                    stdout.push('\n');
                }
                "raise" => {
                    let (kind, message) = arg.split_once(' ').unwrap_or((arg, ""));
                    stderr.push_str(&trace(kind, message));
                    exception = json!({"type": kind, "message": message, "traceback": stderr});
                    exit_code = 1;
                    break;
                }
                "exit" => {
                    exit_code = arg.parse().unwrap_or(1);
                    break;
                }
                "sleep" => std::future::pending::<()>().await,
                "write-input" => {
                    let message = "[Errno 30] Read-only file system: '/inputs/tips.csv'";
                    stderr.push_str(&trace("OSError", message));
                    exception = json!({"type": "OSError", "message": message, "traceback": stderr});
                    exit_code = 1;
                    break;
                }
                "export" => {
                    if let Some(value) = inputs.get(arg) {
                        exports.insert(arg, value.clone());
                    }
                }
                "artifact" => std::fs::write(spec.output_dir.join(arg), b"artifact")?,
                "corrupt-outputs" => corrupt = true,
                "leak" => leak = Some(arg.to_string()),
                _ => {}
            }
        }

        let declared: Vec<&str> = exports.names().collect();
        let status = match (exit_code, exception.is_null()) {
            (0, _) => "ok",
            (_, false) => "raised",
            _ => "exited",
        };
        let summary = json!({
            "status": status,
            "exit_code": exit_code,
            "exception": exception,
            "declared_outputs": declared,
        });
        marshal::marshal(&exports, &reserved.join("vars"), None)?;
        if corrupt {
            std::fs::write(
                reserved.join("vars").join("manifest.json"),
                r#"{"version":1,"variables":[{"name":"stolen","kind":"bytes","file":"../../../etc/passwd"}]}"#,
            )?;
        }
        #[cfg(unix)]
        if let Some(target) = leak {
            std::os::unix::fs::symlink(target, reserved.join("vars").join("loot.bin"))?;
            std::fs::write(
                reserved.join("vars").join("manifest.json"),
                r#"{"version":1,"variables":[{"name":"loot","kind":"bytes","file":"loot.bin"}]}"#,
            )?;
        }
        std::fs::write(reserved.join("result.json"), serde_json::to_vec(&summary)?)?;

        Ok(ProcessOutput {
            exit_status: Some(exit_code),
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
        })
    }

    async fn kill(&self, run_id: &str) -> Result<()> {
        self.lifecycle.lock().unwrap().killed.push(run_id.to_string());
        Ok(())
    }

    async fn destroy(&self, run_id: &str) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        lifecycle.live.remove(run_id);
        lifecycle.destroyed.push(run_id.to_string());
        Ok(())
    }

    fn release(&self, run_id: &str) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        lifecycle.live.remove(run_id);
        lifecycle.released.push(run_id.to_string());
    }
}

/// What the generator was shown on one call
#[derive(Debug, Clone)]
pub struct Seen {
    pub attempt: u32,
    pub previous_code: Option<String>,
    pub previous_stderr: Option<String>,
    pub previous_analysis: Option<String>,
    pub history_len: usize,
    pub variables: Vec<String>,
    pub had_credentials: bool,
}

/// Returns the scripts in order, repeating the last one
pub struct ScriptedGenerator {
    scripts: Vec<String>,
    delay: Option<Duration>,
    fail: bool,
    pub seen: Mutex<Vec<Seen>>,
}

impl ScriptedGenerator {
    pub fn new<S: Into<String>>(scripts: impl IntoIterator<Item = S>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts.into_iter().map(Into::into).collect(),
            delay: None,
            fail: false,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: vec!["print late".to_string()],
            delay: Some(delay),
            fail: false,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            scripts: Vec::new(),
            delay: None,
            fail: true,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> anyhow::Result<String> {
        self.seen.lock().unwrap().push(Seen {
            attempt: request.attempt,
            previous_code: request.previous.map(|f| f.code.clone()),
            previous_stderr: request.previous.map(|f| f.stderr.clone()),
            previous_analysis: request.previous.map(|f| f.analysis.clone()),
            history_len: request.history.len(),
            variables: request.variables.iter().map(|v| v.name.clone()).collect(),
            had_credentials: request.credentials.is_some(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("model endpoint returned 503");
        }
        let index = (request.attempt as usize - 1).min(self.scripts.len().saturating_sub(1));
        Ok(self.scripts.get(index).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &WorkflowEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn sandbox(runtime: Arc<FakeRuntime>, base: &Path, deadline: Duration) -> Sandbox {
    let config = SandboxConfig::default()
        .with_workspace_base(base.to_path_buf())
        .with_deadline(deadline);
    Sandbox::new(runtime, config)
}

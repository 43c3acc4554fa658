//! Runs the real bootstrap with a local `python3` instead of a container.
//! Skipped when no interpreter is installed.

use async_trait::async_trait;
use codegen_sandbox::bootstrap::BOOTSTRAP_FILE;
use codegen_sandbox::evaluator::classify;
use codegen_sandbox::{
    EnvironmentSpec, Execution, FailureKind, ProcessOutput, Result, Sandbox, SandboxConfig,
    SandboxRuntime, Variables,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Runs the bootstrap as a plain host process with the mounts passed by env
struct LocalPython {
    python: PathBuf,
}

#[async_trait]
impl SandboxRuntime for LocalPython {
    fn name(&self) -> &str {
        "local-python"
    }

    async fn create(&self, _spec: &EnvironmentSpec) -> Result<()> {
        Ok(())
    }

    async fn start(&self, spec: &EnvironmentSpec) -> Result<ProcessOutput> {
        let output = Command::new(&self.python)
            .arg("-u")
            .arg(spec.input_dir.join(BOOTSTRAP_FILE))
            .env("CODEGEN_INPUT_DIR", &spec.input_dir)
            .env("CODEGEN_OUTPUT_DIR", &spec.output_dir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(ProcessOutput {
            exit_status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn kill(&self, _run_id: &str) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, _run_id: &str) -> Result<()> {
        Ok(())
    }

    fn release(&self, _run_id: &str) {}
}

fn local_sandbox(base: &Path) -> Option<Sandbox> {
    let Ok(python) = which::which("python3") else {
        eprintln!("python3 not found, skipping");
        return None;
    };
    let config = SandboxConfig::default()
        .with_workspace_base(base.to_path_buf())
        .with_deadline(Duration::from_secs(30));
    Some(Sandbox::new(Arc::new(LocalPython { python }), config))
}

async fn run(sandbox: &Sandbox, code: &str, vars: &Variables) -> Execution {
    sandbox.execute(code, vars).await.unwrap()
}

#[tokio::test]
async fn test_declared_outputs_round_trip() {
    let base = tempfile::tempdir().unwrap();
    let Some(sandbox) = local_sandbox(base.path()) else {
        return;
    };
    let vars = Variables::new()
        .with("numbers", json!([1, 2, 3.5]))
        .with("settings", json!({"label": "tips", "nested": [null, true]}))
        .with("blob", vec![0u8, 1, 254, 255]);

    let code = "\
declare_output('total', sum(numbers))
declare_output('settings_back', settings)
declare_output('blob_back', blob[::-1])
print('done')
";
    let execution = run(&sandbox, code, &vars).await;

    let evaluation = classify(&execution.captured);
    assert!(evaluation.success, "{}", evaluation.analysis);
    assert_eq!(execution.captured.stdout.trim(), "done");
    assert_eq!(
        execution.outputs.get("total").and_then(|v| v.as_json()),
        Some(&json!(6.5))
    );
    assert_eq!(
        execution.outputs.get("settings_back").and_then(|v| v.as_json()),
        vars.get("settings").and_then(|v| v.as_json())
    );
    assert_eq!(
        execution.outputs.get("blob_back").and_then(|v| v.as_bytes()),
        Some(&[255u8, 254, 1, 0][..])
    );
    let summary = execution.captured.summary.unwrap();
    assert_eq!(summary.declared_outputs.len(), 3);
}

#[tokio::test]
async fn test_raised_exception_is_classified() {
    let base = tempfile::tempdir().unwrap();
    let Some(sandbox) = local_sandbox(base.path()) else {
        return;
    };

    let execution = run(&sandbox, "lookup = {}\nlookup['missing']\n", &Variables::new()).await;
    assert_eq!(execution.captured.exit_status, Some(1));
    assert!(execution.captured.stderr.contains("Traceback"));
    let evaluation = classify(&execution.captured);
    assert_eq!(evaluation.failure, Some(FailureKind::Raised));
    assert_eq!(evaluation.exception_type.as_deref(), Some("KeyError"));
}

#[tokio::test]
async fn test_explicit_exit_status() {
    let base = tempfile::tempdir().unwrap();
    let Some(sandbox) = local_sandbox(base.path()) else {
        return;
    };

    let execution = run(&sandbox, "import sys\nsys.exit(3)\n", &Variables::new()).await;
    assert_eq!(execution.captured.exit_status, Some(3));
    assert_eq!(classify(&execution.captured).failure, Some(FailureKind::NonZeroExit));
}

#[tokio::test]
async fn test_syntax_error_is_raised() {
    let base = tempfile::tempdir().unwrap();
    let Some(sandbox) = local_sandbox(base.path()) else {
        return;
    };

    let execution = run(&sandbox, "def broken(:\n    pass\n", &Variables::new()).await;
    let evaluation = classify(&execution.captured);
    assert_eq!(evaluation.failure, Some(FailureKind::Raised));
    assert_eq!(evaluation.exception_type.as_deref(), Some("SyntaxError"));
}

#[tokio::test]
async fn test_keyword_output_name_fails_at_call_site() {
    let base = tempfile::tempdir().unwrap();
    let Some(sandbox) = local_sandbox(base.path()) else {
        return;
    };

    let execution = run(&sandbox, "declare_output('class', 1)\n", &Variables::new()).await;
    let evaluation = classify(&execution.captured);
    assert_eq!(evaluation.failure, Some(FailureKind::Raised));
    assert_eq!(evaluation.exception_type.as_deref(), Some("ValueError"));
    assert!(execution.captured.declared_output_error.is_none());
    assert!(execution.outputs.is_empty());
}

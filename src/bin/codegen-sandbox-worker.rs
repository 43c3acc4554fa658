use base64::Engine as _;
use codegen_sandbox::discovery::{self, Discovered};
use codegen_sandbox::evaluator::classify;
use codegen_sandbox::{DockerRuntime, Execution, Sandbox, SandboxConfig, Table, Value as SandboxValue, Variables};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

struct WorkerState {
    discovered: Discovered,
    config: SandboxConfig,
    runtime: std::result::Result<Arc<DockerRuntime>, String>,
}

impl WorkerState {
    fn new() -> Self {
        let discovered = discovery::discover();
        let config = discovered.workflow_config().sandbox;
        let runtime = DockerRuntime::new(config.clone())
            .map(Arc::new)
            .map_err(|e| e.to_string());
        Self {
            discovered,
            config,
            runtime,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "codegen_sandbox_worker=info,codegen_sandbox=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let state = WorkerState::new();
    tracing::info!(
        "codegen-sandbox-worker starting (state_dir={:?}, docker={})",
        state.discovered.state_dir,
        state.runtime.is_ok()
    );

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid json-rpc line: {} | err={}", line, e);
                continue;
            }
        };

        let (response, shutdown) = handle_message(&state, parsed).await;
        if let Some(resp) = response {
            let s = serde_json::to_string(&resp)?;
            stdout.write_all(s.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        if shutdown {
            break;
        }
    }

    Ok(())
}

/// Response to send, and whether the worker should stop afterwards
async fn handle_message(state: &WorkerState, msg: Value) -> (Option<Value>, bool) {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = msg.get("id").cloned();
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    // Notifications have no id; only "exit" matters.
    if id.is_none() {
        return (None, method == "exit");
    }

    let mut shutdown = false;
    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-06-18",
            "serverInfo": {
                "name": "codegen-sandbox worker",
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": {
                "tools": { "listChanged": false }
            }
        })),
        "tools/list" => Ok(json!({ "tools": tools_list() })),
        "tools/call" => Ok(call_tool(state, &params).await),
        "shutdown" => {
            shutdown = true;
            Ok(json!({}))
        }
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    let response = match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    };
    (Some(response), shutdown)
}

fn tools_list() -> Vec<Value> {
    vec![
        json!({
            "name": "codegen_sandbox.ping",
            "description": "Liveness check for the sandbox worker.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }
        }),
        json!({
            "name": "codegen_sandbox.health",
            "description": "Report docker availability, state directory and whether credentials were found.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }
        }),
        json!({
            "name": "sandbox_execute",
            "description": "Run Python code once in a fresh container with the given variables bound by name.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Python source. Call declare_output(name, value) to return values." },
                    "variables": { "type": "object", "description": "JSON values bound as variables of the same name." },
                    "tables": { "type": "object", "description": "Columnar tables ({\"columns\": [{\"name\", \"dtype\", \"values\"}]}) bound as DataFrames." },
                    "timeout_seconds": { "type": "integer", "minimum": 1, "maximum": 600, "description": "Wall-clock deadline for the run." }
                },
                "required": ["code"],
                "additionalProperties": false
            }
        }),
    ]
}

async fn call_tool(state: &WorkerState, params: &Value) -> Value {
    let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let args = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "codegen_sandbox.ping" => json!({
            "content": [{ "type": "text", "text": "pong" }],
            "isError": false,
        }),
        "codegen_sandbox.health" => {
            let text = if state.runtime.is_ok() { "ok" } else { "docker unavailable" };
            json!({
                "content": [{ "type": "text", "text": text }],
                "structuredContent": {
                    "ok": state.runtime.is_ok(),
                    "worker": "codegen-sandbox-worker",
                    "version": env!("CARGO_PKG_VERSION"),
                    "docker_error": state.runtime.as_ref().err(),
                    "image": state.config.image,
                    "state_dir": state.discovered.state_dir,
                    "dotenv_path": state.discovered.dotenv_path,
                    "credentials_found": state.discovered.credentials.is_some(),
                },
                "isError": false
            })
        }
        "sandbox_execute" => match sandbox_execute(state, &args).await {
            Ok(v) => v,
            Err(message) => tool_error(message),
        },
        other => tool_error(format!("Unknown tool: {}", other)),
    }
}

fn tool_error(message: String) -> Value {
    json!({
        "content": [{ "type": "text", "text": format!("error: {}", message) }],
        "structuredContent": { "error": message },
        "isError": true
    })
}

fn variables_from_args(args: &Value) -> std::result::Result<Variables, String> {
    let mut vars = Variables::new();
    if let Some(obj) = args.get("variables").and_then(|v| v.as_object()) {
        for (name, value) in obj {
            vars.insert(name.clone(), value.clone());
        }
    }
    if let Some(obj) = args.get("tables").and_then(|v| v.as_object()) {
        for (name, value) in obj {
            let table: Table = serde_json::from_value(value.clone())
                .map_err(|e| format!("table `{}` is malformed: {}", name, e))?;
            vars.insert(name.clone(), table);
        }
    }
    Ok(vars)
}

async fn sandbox_execute(state: &WorkerState, args: &Value) -> std::result::Result<Value, String> {
    let code = args
        .get("code")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "Missing required argument: code".to_string())?;
    let variables = variables_from_args(args)?;
    let runtime = state.runtime.clone()?;

    let mut config = state.config.clone();
    if let Some(secs) = args.get("timeout_seconds").and_then(|v| v.as_u64()) {
        config.deadline = Duration::from_secs(secs.clamp(1, 600));
    }

    let sandbox = Sandbox::new(runtime, config);
    let execution = sandbox
        .execute(code, &variables)
        .await
        .map_err(|e| e.to_string())?;
    Ok(execution_payload(&execution))
}

fn execution_payload(execution: &Execution) -> Value {
    let captured = &execution.captured;
    let b64 = base64::engine::general_purpose::STANDARD;

    let outputs: serde_json::Map<String, Value> = execution
        .outputs
        .iter()
        .map(|(name, value)| {
            let encoded = match value {
                SandboxValue::Json(v) => json!({ "kind": "json", "value": v }),
                SandboxValue::Bytes(b) => json!({ "kind": "bytes", "base64": b64.encode(b) }),
                SandboxValue::Table(t) => json!({ "kind": "table", "value": t }),
            };
            (name.to_string(), encoded)
        })
        .collect();

    let artifacts: Vec<Value> = captured
        .output_files
        .iter()
        .map(|f| {
            json!({
                "path": f.path,
                "size_bytes": f.contents.len(),
                "base64": b64.encode(&f.contents),
            })
        })
        .collect();

    let mut summary = String::new();
    if !captured.stdout.trim().is_empty() {
        summary.push_str("stdout:\n");
        summary.push_str(captured.stdout.trim_end());
        summary.push('\n');
    }
    if !captured.stderr.trim().is_empty() {
        if !summary.is_empty() {
            summary.push('\n');
        }
        summary.push_str("stderr:\n");
        summary.push_str(captured.stderr.trim_end());
        summary.push('\n');
    }
    if summary.is_empty() {
        summary.push_str(if captured.timed_out { "timed out" } else { "ok" });
    }

    let evaluation = classify(captured);
    json!({
        "content": [{ "type": "text", "text": summary }],
        "structuredContent": {
            "run_id": execution.run_id,
            "state": execution.state,
            "exit_status": captured.exit_status,
            "timed_out": captured.timed_out,
            "stdout": captured.stdout,
            "stderr": captured.stderr,
            "summary": captured.summary,
            "diagnostics": captured.diagnostics,
            "declared_output_error": captured.declared_output_error,
            "transferred": execution.transferred,
            "outputs": outputs,
            "artifacts": artifacts,
            "elapsed_ms": execution.elapsed.as_millis() as u64,
            "success": evaluation.success,
            "failure": evaluation.failure,
            "exception_type": evaluation.exception_type,
            "analysis": evaluation.analysis,
        },
        "isError": !evaluation.success
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegen_sandbox::{CapturedResult, EnvironmentState, RunStatus, RunSummary};

    fn execution(captured: CapturedResult) -> Execution {
        Execution {
            run_id: "codegen-test".to_string(),
            state: EnvironmentState::Completed,
            captured,
            outputs: Variables::new(),
            transferred: Vec::new(),
            elapsed: Duration::from_millis(5),
        }
    }

    fn clean_summary() -> Option<RunSummary> {
        Some(RunSummary {
            status: RunStatus::Ok,
            exit_code: 0,
            exception: None,
            declared_outputs: Vec::new(),
            elapsed_ms: None,
        })
    }

    #[test]
    fn test_payload_ok_for_clean_run() {
        let payload = execution_payload(&execution(CapturedResult {
            stdout: "42\n".to_string(),
            exit_status: Some(0),
            summary: clean_summary(),
            ..Default::default()
        }));
        assert_eq!(payload["isError"], json!(false));
        assert_eq!(payload["structuredContent"]["failure"], Value::Null);
    }

    #[test]
    fn test_payload_error_follows_classification() {
        let traceback = CapturedResult {
            stderr: "Traceback (most recent call last):\n  File \"<generated>\", line 1\nValueError: bad\n"
                .to_string(),
            exit_status: Some(0),
            summary: clean_summary(),
            ..Default::default()
        };
        let payload = execution_payload(&execution(traceback));
        assert_eq!(payload["isError"], json!(true));
        assert_eq!(payload["structuredContent"]["failure"], json!("raised"));

        let no_summary = CapturedResult {
            exit_status: Some(0),
            ..Default::default()
        };
        let payload = execution_payload(&execution(no_summary));
        assert_eq!(payload["isError"], json!(true));
        assert_eq!(payload["structuredContent"]["failure"], json!("missing_summary"));
    }
}

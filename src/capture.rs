use crate::engine::RawExecutionRecord;
use crate::errors::{Result, SandboxError};
use crate::marshal;
use crate::workspace::{Workspace, RESERVED_OUTPUT_DIR};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How the bootstrap saw the generated code finish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Raised,
    Exited,
}

/// Exception raised by the generated code, as reported by the bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

/// Structured summary the bootstrap writes to the output mount before exit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub exit_code: i32,
    #[serde(default)]
    pub exception: Option<ExceptionInfo>,
    #[serde(default)]
    pub declared_outputs: Vec<String>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

/// A file the generated code left in the output mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Path relative to the output mount
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

/// Faithful copy of everything one execution produced
#[derive(Debug, Clone, Default)]
pub struct CapturedResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when killed by a signal or the deadline
    pub exit_status: Option<i32>,
    pub timed_out: bool,
    pub output_files: Vec<OutputFile>,
    /// `None` when the bootstrap never reached the end (or the summary was unreadable)
    pub summary: Option<RunSummary>,
    /// Host-side notes about the capture (missing or malformed summary)
    pub diagnostics: Vec<String>,
    /// Set when declared outputs could not be read back
    pub declared_output_error: Option<String>,
}

impl CapturedResult {
    pub fn file(&self, path: impl AsRef<Path>) -> Option<&OutputFile> {
        self.output_files.iter().find(|f| f.path == path.as_ref())
    }

    pub fn exception(&self) -> Option<&ExceptionInfo> {
        self.summary.as_ref().and_then(|s| s.exception.as_ref())
    }
}

/// Collect streams, summary and artifacts of a finished environment.
///
/// Must run after the environment stopped and before the workspace is dropped.
/// An empty output is a valid result; failing to read is `CaptureFailed`.
pub fn capture(record: &RawExecutionRecord, workspace: &Workspace) -> Result<CapturedResult> {
    let mut captured = CapturedResult {
        stdout: String::from_utf8_lossy(&record.output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&record.output.stderr).into_owned(),
        exit_status: record.output.exit_status,
        timed_out: record.timed_out(),
        ..Default::default()
    };

    if captured.timed_out {
        captured.exit_status = None;
        captured
            .diagnostics
            .push(format!("execution exceeded its deadline after {:?}; output discarded", record.elapsed));
        return Ok(captured);
    }

    let output_dir = workspace.output_dir();
    if !output_dir.is_dir() {
        return Err(SandboxError::capture(
            "output mount disappeared",
            &output_dir,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    }

    if workspace.reserved_dir_replaced() {
        warn!("[SANDBOX] Reserved output directory of {} is not a directory", record.run_id);
        captured
            .diagnostics
            .push("run summary is malformed: reserved output directory was replaced".to_string());
    } else {
        captured.summary = read_summary(&workspace.summary_path(), &mut captured.diagnostics)?;
    }
    collect_files(&output_dir, &output_dir, &mut captured.output_files)?;
    captured.output_files.sort_by(|a, b| a.path.cmp(&b.path));

    debug!(
        "[SANDBOX] Captured {} bytes stdout, {} bytes stderr, {} files from {}",
        captured.stdout.len(),
        captured.stderr.len(),
        captured.output_files.len(),
        record.run_id
    );
    Ok(captured)
}

fn read_summary(path: &Path, diagnostics: &mut Vec<String>) -> Result<Option<RunSummary>> {
    let read = marshal::open_regular(path).and_then(|mut file| {
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map(|_| bytes)
    });
    let bytes = match read {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            diagnostics.push("bootstrap did not write a run summary".to_string());
            return Ok(None);
        }
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            warn!("[SANDBOX] Ignoring run summary: {}", e);
            diagnostics.push(format!("run summary is malformed: {}", e));
            return Ok(None);
        }
        Err(e) => return Err(SandboxError::capture("reading run summary", path, e)),
    };
    // The output mount is writable by generated code, so a bad summary is its problem
    match serde_json::from_slice(&bytes) {
        Ok(summary) => Ok(Some(summary)),
        Err(e) => {
            warn!("[SANDBOX] Ignoring malformed run summary: {}", e);
            diagnostics.push(format!("run summary is malformed: {}", e));
            Ok(None)
        }
    }
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<OutputFile>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| SandboxError::capture("listing outputs", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SandboxError::capture("listing outputs", dir, e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| SandboxError::capture("inspecting output", &path, e))?;

        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            if dir == root && entry.file_name() == RESERVED_OUTPUT_DIR {
                continue;
            }
            collect_files(root, &path, files)?;
        } else if file_type.is_file() {
            let contents =
                std::fs::read(&path).map_err(|e| SandboxError::capture("reading output", &path, e))?;
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            files.push(OutputFile {
                path: relative,
                contents,
            });
        }
    }
    Ok(())
}

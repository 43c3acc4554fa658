use crate::bootstrap::OUTPUT_MOUNT;
use crate::capture::{CapturedResult, RunStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Why an attempt counted as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Killed at the deadline
    TimedOut,
    /// The generated code raised an exception
    Raised,
    /// Non-zero exit without an exception (explicit `sys.exit(n)`, OOM kill, ...)
    NonZeroExit,
    /// Clean exit but the bootstrap never wrote its summary
    MissingSummary,
    /// Declared outputs could not be read back
    OutputRejected,
}

/// Verdict on one captured execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub success: bool,
    /// Free text fed back to the generator
    pub analysis: String,
    pub failure: Option<FailureKind>,
    /// Exception class name, when one was recognised
    pub exception_type: Option<String>,
    /// The code tried to write to the read-only input mount
    pub mount_write_violation: bool,
}

/// Optional qualitative reviewer of successful runs.
///
/// The answer is advisory text; it never flips the verdict.
#[async_trait]
pub trait OutputJudge: Send + Sync {
    async fn judge(
        &self,
        request_text: &str,
        code: &str,
        captured: &CapturedResult,
    ) -> anyhow::Result<String>;
}

/// Classifies executions as success or failure
#[derive(Clone, Default)]
pub struct Evaluator {
    judge: Option<Arc<dyn OutputJudge>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_judge(mut self, judge: Arc<dyn OutputJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Baseline rule plus, for clean runs, the judge's advisory note
    pub async fn evaluate(&self, request_text: &str, code: &str, captured: &CapturedResult) -> Evaluation {
        let mut evaluation = classify(captured);
        if !evaluation.success {
            return evaluation;
        }
        if let Some(judge) = &self.judge {
            match judge.judge(request_text, code, captured).await {
                Ok(note) if !note.trim().is_empty() => {
                    evaluation.analysis.push_str("\nReviewer notes: ");
                    evaluation.analysis.push_str(note.trim());
                }
                Ok(_) => {}
                Err(e) => warn!("[EVAL] Output judge failed, ignoring: {:#}", e),
            }
        }
        evaluation
    }
}

/// Mechanical part of the evaluation: exit status and stderr inspection
pub fn classify(captured: &CapturedResult) -> Evaluation {
    let mount_write_violation = is_mount_write_violation(&captured.stderr);
    let exception = captured
        .exception()
        .map(|e| (e.kind.clone(), e.message.clone()))
        .or_else(|| exception_from_trace(&captured.stderr));

    let failure = if captured.timed_out {
        Some(FailureKind::TimedOut)
    } else if exception.is_some() {
        Some(FailureKind::Raised)
    } else if captured.exit_status != Some(0) {
        Some(FailureKind::NonZeroExit)
    } else if captured.summary.is_none() {
        Some(FailureKind::MissingSummary)
    } else if captured.declared_output_error.is_some() {
        Some(FailureKind::OutputRejected)
    } else {
        None
    };

    let mut analysis = match failure {
        None => {
            let declared = captured
                .summary
                .as_ref()
                .map(|s| s.declared_outputs.len())
                .unwrap_or(0);
            format!(
                "Execution finished cleanly with {} output file(s) and {} declared output(s).",
                captured.output_files.len(),
                declared
            )
        }
        Some(FailureKind::TimedOut) => {
            "Execution did not finish before the deadline and was terminated; any partial output was discarded. Make the code faster or process less data.".to_string()
        }
        Some(FailureKind::Raised) => match &exception {
            Some((kind, message)) if !message.is_empty() => format!("The code raised {}: {}", kind, message),
            Some((kind, _)) => format!("The code raised {}.", kind),
            None => "The code raised an exception.".to_string(),
        },
        Some(FailureKind::NonZeroExit) => {
            let exited = captured
                .summary
                .as_ref()
                .map(|s| s.status == RunStatus::Exited)
                .unwrap_or(false);
            match (captured.exit_status, exited) {
                (Some(code), true) => format!("The code called exit with status {}.", code),
                (Some(code), false) => format!("The process exited with status {}.", code),
                (None, _) => "The process was killed before it could exit.".to_string(),
            }
        }
        Some(FailureKind::MissingSummary) => {
            "The process exited without the sandbox recording a result; do not call os._exit or replace the output directory.".to_string()
        }
        Some(FailureKind::OutputRejected) => format!(
            "Declared outputs could not be read back: {}",
            captured.declared_output_error.as_deref().unwrap_or("unknown error")
        ),
    };

    if mount_write_violation {
        analysis.push_str(&format!(
            "\nThe code tried to write to the read-only input directory. Write files under {} instead.",
            OUTPUT_MOUNT
        ));
    }

    debug!("[EVAL] failure={:?} violation={}", failure, mount_write_violation);

    Evaluation {
        success: failure.is_none(),
        analysis,
        failure,
        exception_type: exception.map(|(kind, _)| kind),
        mount_write_violation,
    }
}

fn is_mount_write_violation(stderr: &str) -> bool {
    stderr.contains("Read-only file system") || stderr.contains("[Errno 30]")
}

/// Exception type and message from the last Python traceback in `stderr`
pub fn exception_from_trace(stderr: &str) -> Option<(String, String)> {
    let start = stderr.rfind(TRACEBACK_HEADER)?;
    let line = stderr[start + TRACEBACK_HEADER.len()..]
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with(char::is_whitespace))
        .last()?;

    let (kind, message) = match line.split_once(':') {
        Some((kind, message)) => (kind.trim(), message.trim()),
        None => (line.trim(), ""),
    };
    let is_type_name = !kind.is_empty()
        && kind
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if !is_type_name {
        return None;
    }
    let kind = kind.rsplit('.').next().unwrap_or(kind);
    Some((kind.to_string(), message.to_string()))
}

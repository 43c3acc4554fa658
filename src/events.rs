use crate::engine::EnvironmentState;
use crate::evaluator::FailureKind;
use crate::workflow::WorkflowState;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Structured progress events emitted by the workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: String,
        ceiling: u32,
        variables: usize,
    },
    StateChanged {
        workflow_id: String,
        from: WorkflowState,
        to: WorkflowState,
    },
    AttemptStarted {
        workflow_id: String,
        attempt: u32,
    },
    CodeGenerated {
        workflow_id: String,
        attempt: u32,
        code_bytes: usize,
    },
    ExecutionFinished {
        workflow_id: String,
        attempt: u32,
        run_id: String,
        environment: EnvironmentState,
        exit_status: Option<i32>,
        elapsed_ms: u64,
    },
    AttemptFinished {
        workflow_id: String,
        attempt: u32,
        success: bool,
        failure: Option<FailureKind>,
        mount_write_violation: bool,
    },
    WorkflowFinished {
        workflow_id: String,
        success: bool,
        attempts: usize,
        state: WorkflowState,
    },
    WorkflowAborted {
        workflow_id: String,
        attempt: u32,
        reason: String,
    },
    WorkflowCancelled {
        workflow_id: String,
    },
}

/// Destination for workflow events; injected into the workflow
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &WorkflowEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::WorkflowStarted {
                workflow_id,
                ceiling,
                variables,
            } => info!(
                "[WORKFLOW] {} started (ceiling {}, {} variables)",
                workflow_id, ceiling, variables
            ),
            WorkflowEvent::StateChanged { workflow_id, from, to } => {
                info!("[WORKFLOW] {} {:?} -> {:?}", workflow_id, from, to)
            }
            WorkflowEvent::AttemptStarted { workflow_id, attempt } => {
                info!("[WORKFLOW] {} attempt {} started", workflow_id, attempt)
            }
            WorkflowEvent::CodeGenerated {
                workflow_id,
                attempt,
                code_bytes,
            } => info!(
                "[WORKFLOW] {} attempt {} generated {} bytes of code",
                workflow_id, attempt, code_bytes
            ),
            WorkflowEvent::ExecutionFinished {
                workflow_id,
                attempt,
                run_id,
                environment,
                exit_status,
                elapsed_ms,
            } => info!(
                "[WORKFLOW] {} attempt {} ran in {} ({:?}, exit {:?}, {} ms)",
                workflow_id, attempt, run_id, environment, exit_status, elapsed_ms
            ),
            WorkflowEvent::AttemptFinished {
                workflow_id,
                attempt,
                success: true,
                ..
            } => info!("[WORKFLOW] {} attempt {} succeeded", workflow_id, attempt),
            WorkflowEvent::AttemptFinished {
                workflow_id,
                attempt,
                failure,
                mount_write_violation,
                ..
            } => warn!(
                "[WORKFLOW] {} attempt {} failed: {:?}{}",
                workflow_id,
                attempt,
                failure,
                if *mount_write_violation {
                    " (wrote to read-only input mount)"
                } else {
                    ""
                }
            ),
            WorkflowEvent::WorkflowFinished {
                workflow_id,
                success,
                attempts,
                state,
            } => info!(
                "[WORKFLOW] {} finished: {:?} after {} attempts (success={})",
                workflow_id, state, attempts, success
            ),
            WorkflowEvent::WorkflowAborted {
                workflow_id,
                attempt,
                reason,
            } => warn!(
                "[WORKFLOW] {} aborted during attempt {}: {}",
                workflow_id, attempt, reason
            ),
            WorkflowEvent::WorkflowCancelled { workflow_id } => {
                warn!("[WORKFLOW] {} cancelled by caller", workflow_id)
            }
        }
    }
}

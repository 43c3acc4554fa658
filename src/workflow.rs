//! Refinement controller.
//!
//! One workflow run walks the state machine
//!
//! ```text
//! Generating -> Executing -> Evaluating -> Succeeded
//!      ^                          |
//!      +------- Retrying <--------+-----> Exhausted
//! ```
//!
//! Attempts run strictly one after another. Each attempt gets its own
//! environment, destroyed before the next attempt's code is generated.

use crate::capture::OutputFile;
use crate::config::WorkflowConfig;
use crate::engine::EnvironmentState;
use crate::errors::{GenerationTimeout, Result, SandboxError};
use crate::evaluator::{Evaluation, Evaluator, FailureKind, OutputJudge};
use crate::events::{EventSink, TracingSink, WorkflowEvent};
use crate::generator::{strip_code_fence, CodeGenerator, Feedback, GenerationRequest};
use crate::marshal::{self, Value, VariableSummary, Variables};
use crate::sandbox::{Execution, Sandbox};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Immutable description of what the caller wants
#[derive(Debug, Clone)]
pub struct Request {
    request_text: String,
    variables: Variables,
    ceiling: u32,
    prior_context: Option<String>,
}

impl Request {
    /// `ceiling` is the maximum number of attempts and must be positive
    pub fn new(request_text: impl Into<String>, ceiling: u32) -> Result<Self> {
        if ceiling == 0 {
            return Err(SandboxError::InvalidRequest(
                "attempt ceiling must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            request_text: request_text.into(),
            variables: Variables::new(),
            ceiling,
            prior_context: None,
        })
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name, value);
        self
    }

    pub fn with_prior_context(mut self, context: impl Into<String>) -> Self {
        self.prior_context = Some(context.into());
        self
    }

    pub fn request_text(&self) -> &str {
        &self.request_text
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn prior_context(&self) -> Option<&str> {
        self.prior_context.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Generating,
    Executing,
    Evaluating,
    Retrying,
    Succeeded,
    Exhausted,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Succeeded | WorkflowState::Exhausted)
    }

    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Generating, Executing)
                | (Executing, Evaluating)
                | (Evaluating, Succeeded)
                | (Evaluating, Retrying)
                | (Evaluating, Exhausted)
                | (Retrying, Generating)
        )
    }
}

/// State after evaluating attempt number `attempt` (1-based)
pub fn next_state(success: bool, attempt: u32, ceiling: u32) -> WorkflowState {
    if success {
        WorkflowState::Succeeded
    } else if attempt < ceiling {
        WorkflowState::Retrying
    } else {
        WorkflowState::Exhausted
    }
}

/// One finished iteration of the loop
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based, gap-free
    pub index: u32,
    pub code: String,
    pub run_id: String,
    pub environment: EnvironmentState,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i32>,
    pub success: bool,
    pub analysis: String,
    pub failure: Option<FailureKind>,
    pub exception_type: Option<String>,
    pub mount_write_violation: bool,
    pub output_files: Vec<OutputFile>,
    pub outputs: Variables,
    pub elapsed: Duration,
}

impl Attempt {
    fn record(index: u32, code: String, execution: Execution, evaluation: Evaluation) -> Self {
        Self {
            index,
            code,
            run_id: execution.run_id,
            environment: execution.state,
            stdout: execution.captured.stdout,
            stderr: execution.captured.stderr,
            exit_status: execution.captured.exit_status,
            success: evaluation.success,
            analysis: evaluation.analysis,
            failure: evaluation.failure,
            exception_type: evaluation.exception_type,
            mount_write_violation: evaluation.mount_write_violation,
            output_files: execution.captured.output_files,
            outputs: execution.outputs,
            elapsed: execution.elapsed,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.failure == Some(FailureKind::TimedOut)
    }

    /// Feedback bundle handed to the next generation call
    pub fn feedback(&self) -> Feedback {
        Feedback {
            attempt: self.index,
            code: self.code.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            exit_status: self.exit_status,
            failure: self.failure,
            analysis: self.analysis.clone(),
        }
    }
}

/// Terminal outcome of one workflow run
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub success: bool,
    /// `Succeeded` or `Exhausted`
    pub final_state: WorkflowState,
    pub attempts: Vec<Attempt>,
    /// Code of the successful attempt
    pub final_code: Option<String>,
    /// Where the successful code was archived
    pub archived_to: Option<PathBuf>,
}

impl WorkflowResult {
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Declared outputs of the successful attempt
    pub fn outputs(&self) -> Option<&Variables> {
        self.attempts.last().filter(|a| a.success).map(|a| &a.outputs)
    }
}

/// Generate, execute, evaluate and retry until success or the ceiling.
pub struct Workflow {
    id: String,
    request: Request,
    generator: Arc<dyn CodeGenerator>,
    sandbox: Sandbox,
    evaluator: Evaluator,
    sink: Arc<dyn EventSink>,
    config: WorkflowConfig,
}

impl Workflow {
    pub fn new(
        request: Request,
        generator: Arc<dyn CodeGenerator>,
        sandbox: Sandbox,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            id: format!("wf-{}", uuid::Uuid::new_v4().simple()),
            request,
            generator,
            sandbox,
            evaluator: Evaluator::new(),
            sink: Arc::new(TracingSink),
            config,
        }
    }

    /// Workflow executing attempts through the local docker CLI
    pub fn with_docker(
        request: Request,
        generator: Arc<dyn CodeGenerator>,
        config: WorkflowConfig,
    ) -> Result<Self> {
        let sandbox = Sandbox::docker(config.sandbox.clone())?;
        Ok(Self::new(request, generator, sandbox, config))
    }

    pub fn with_judge(mut self, judge: Arc<dyn OutputJudge>) -> Self {
        self.evaluator = Evaluator::new().with_judge(judge);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Run to completion.
    ///
    /// Returns `Ok` for both `Succeeded` and `Exhausted`; errors mean an
    /// infrastructure step (marshaling, environment, capture, generation)
    /// failed and the run was abandoned.
    pub async fn run(&self) -> Result<WorkflowResult> {
        let variables = self.request.variables();
        if let Err(e) = marshal::validate(variables) {
            self.abort(0, &e);
            return Err(e);
        }
        let summaries = variables.describe();
        let ceiling = self.request.ceiling();

        self.sink.emit(&WorkflowEvent::WorkflowStarted {
            workflow_id: self.id.clone(),
            ceiling,
            variables: variables.len(),
        });

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut history: Vec<Feedback> = Vec::new();
        let mut state = WorkflowState::Generating;
        let mut index = 0;

        while !state.is_terminal() {
            index += 1;
            self.sink.emit(&WorkflowEvent::AttemptStarted {
                workflow_id: self.id.clone(),
                attempt: index,
            });

            let code = match self.generate(index, &summaries, &history).await {
                Ok(code) => code,
                Err(e) => {
                    self.abort(index, &e);
                    return Err(e);
                }
            };
            self.transition(&mut state, WorkflowState::Executing)?;

            let execution = match self.sandbox.execute(&code, variables).await {
                Ok(execution) => execution,
                Err(e) => {
                    self.abort(index, &e);
                    return Err(e);
                }
            };
            self.sink.emit(&WorkflowEvent::ExecutionFinished {
                workflow_id: self.id.clone(),
                attempt: index,
                run_id: execution.run_id.clone(),
                environment: execution.state,
                exit_status: execution.captured.exit_status,
                elapsed_ms: execution.elapsed.as_millis() as u64,
            });
            self.transition(&mut state, WorkflowState::Evaluating)?;

            let evaluation = self
                .evaluator
                .evaluate(self.request.request_text(), &code, &execution.captured)
                .await;
            let attempt = Attempt::record(index, code, execution, evaluation);
            self.sink.emit(&WorkflowEvent::AttemptFinished {
                workflow_id: self.id.clone(),
                attempt: index,
                success: attempt.success,
                failure: attempt.failure,
                mount_write_violation: attempt.mount_write_violation,
            });

            let next = next_state(attempt.success, index, ceiling);
            history.push(attempt.feedback());
            attempts.push(attempt);
            self.transition(&mut state, next)?;

            if state == WorkflowState::Retrying {
                self.transition(&mut state, WorkflowState::Generating)?;
            }
        }

        let success = state == WorkflowState::Succeeded;
        let final_code = attempts
            .last()
            .filter(|a| a.success)
            .map(|a| a.code.clone());

        let archived_to = match (&final_code, &self.config.archive_dir) {
            (Some(code), Some(dir)) => match self.archive(dir, code) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("[WORKFLOW] Failed to archive code for {}: {}", self.id, e);
                    None
                }
            },
            _ => None,
        };

        self.sink.emit(&WorkflowEvent::WorkflowFinished {
            workflow_id: self.id.clone(),
            success,
            attempts: attempts.len(),
            state,
        });

        Ok(WorkflowResult {
            workflow_id: self.id.clone(),
            success,
            final_state: state,
            attempts,
            final_code,
            archived_to,
        })
    }

    /// Like [`Workflow::run`], abandoned as soon as `cancel` completes.
    ///
    /// The in-flight environment, if any, is released before this returns.
    pub async fn run_until<F>(&self, cancel: F) -> Result<WorkflowResult>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            _ = cancel => {
                self.sink.emit(&WorkflowEvent::WorkflowCancelled {
                    workflow_id: self.id.clone(),
                });
                Err(SandboxError::Cancelled)
            }
        }
    }

    async fn generate(
        &self,
        attempt: u32,
        variables: &[VariableSummary],
        history: &[Feedback],
    ) -> Result<String> {
        let request = GenerationRequest {
            attempt,
            request_text: self.request.request_text(),
            prior_context: self.request.prior_context(),
            variables,
            previous: history.last(),
            history,
            credentials: self.config.credentials.as_ref(),
        };

        let limit = self.config.generation_timeout;
        let code = match tokio::time::timeout(limit, self.generator.generate(request)).await {
            Ok(Ok(text)) => strip_code_fence(&text).to_string(),
            Ok(Err(e)) => {
                return Err(SandboxError::GenerationFailed {
                    attempt,
                    source: e.into(),
                })
            }
            Err(_) => {
                return Err(SandboxError::GenerationFailed {
                    attempt,
                    source: Box::new(GenerationTimeout(limit)),
                })
            }
        };

        self.sink.emit(&WorkflowEvent::CodeGenerated {
            workflow_id: self.id.clone(),
            attempt,
            code_bytes: code.len(),
        });
        Ok(code)
    }

    fn transition(&self, state: &mut WorkflowState, next: WorkflowState) -> Result<()> {
        if !state.can_transition_to(next) {
            return Err(SandboxError::InternalError(format!(
                "illegal workflow transition {:?} -> {:?}",
                state, next
            )));
        }
        self.sink.emit(&WorkflowEvent::StateChanged {
            workflow_id: self.id.clone(),
            from: *state,
            to: next,
        });
        *state = next;
        Ok(())
    }

    fn abort(&self, attempt: u32, error: &SandboxError) {
        self.sink.emit(&WorkflowEvent::WorkflowAborted {
            workflow_id: self.id.clone(),
            attempt,
            reason: error.to_string(),
        });
    }

    fn archive(&self, dir: &Path, code: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.py", self.id));
        let header = format!(
            "# User request: {}\n\n",
            self.request.request_text().replace('\n', " ")
        );
        std::fs::write(&path, header + code)?;
        Ok(path)
    }
}

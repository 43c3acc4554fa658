//! Run generated Python against host variables in disposable containers and
//! refine it until it works.
//!
//! ```no_run
//! use codegen_sandbox::{CodeGenerator, GenerationRequest, Request, Workflow, WorkflowConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct Canned;
//!
//! #[async_trait::async_trait]
//! impl CodeGenerator for Canned {
//!     async fn generate(&self, _request: GenerationRequest<'_>) -> anyhow::Result<String> {
//!         Ok("print(sum(numbers))".to_string())
//!     }
//! }
//!
//! # async fn demo() -> codegen_sandbox::Result<()> {
//! let request = Request::new("add up the numbers", 3)?.with_variable("numbers", json!([1, 2, 3]));
//! let workflow = Workflow::with_docker(request, Arc::new(Canned), WorkflowConfig::default())?;
//! let result = workflow.run().await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod capture;
pub mod config;
pub mod discovery;
pub mod docker;
pub mod engine;
pub mod errors;
pub mod evaluator;
pub mod events;
pub mod generator;
pub mod marshal;
pub mod sandbox;
pub mod workflow;
pub mod workspace;

pub use capture::{CapturedResult, OutputFile, RunStatus, RunSummary};
pub use config::{Credentials, NetworkMode, ResourceLimits, SandboxConfig, WorkflowConfig};
pub use docker::DockerRuntime;
pub use engine::{EnvironmentSpec, EnvironmentState, ProcessOutput, SandboxRuntime};
pub use errors::{Result, SandboxError};
pub use evaluator::{Evaluation, Evaluator, FailureKind, OutputJudge};
pub use events::{EventSink, TracingSink, WorkflowEvent};
pub use generator::{CodeGenerator, Feedback, GenerationRequest};
pub use marshal::{Column, Table, Value, Variables};
pub use sandbox::{Execution, Sandbox};
pub use workflow::{Attempt, Request, Workflow, WorkflowResult, WorkflowState};

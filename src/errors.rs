use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Boxed error produced by an external collaborator.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Variable `{name}` cannot be marshaled: {reason}")]
    Serialization { name: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to create isolated environment: {0}")]
    EnvironmentCreateFailed(String),

    #[error("Failed to capture execution results ({context}): {source}")]
    CaptureFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Code generation failed on attempt {attempt}: {source}")]
    GenerationFailed {
        attempt: u32,
        #[source]
        source: CollaboratorError,
    },

    #[error("Workflow cancelled by caller")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl SandboxError {
    pub(crate) fn serialization(name: impl Into<String>, reason: impl Into<String>) -> Self {
        SandboxError::Serialization {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn capture(context: impl Into<String>, path: &Path, source: std::io::Error) -> Self {
        SandboxError::CaptureFailed {
            context: format!("{}: {}", context.into(), path.display()),
            source,
        }
    }
}

/// The code generator did not answer within the configured timeout.
#[derive(Error, Debug)]
#[error("code generation did not finish within {0:?}")]
pub struct GenerationTimeout(pub Duration);

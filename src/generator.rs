use crate::config::Credentials;
use crate::evaluator::FailureKind;
use crate::marshal::VariableSummary;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// What the generator gets to see about one finished attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub attempt: u32,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i32>,
    pub failure: Option<FailureKind>,
    pub analysis: String,
}

impl Feedback {
    /// Markdown block describing this attempt, for prompt-based generators
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Attempt {}", self.attempt);
        let _ = writeln!(out, "```python\n{}\n```", self.code.trim_end());
        let _ = writeln!(out, "stdout:\n```\n{}\n```", self.stdout.trim_end());
        let _ = writeln!(out, "stderr:\n```\n{}\n```", self.stderr.trim_end());
        match self.exit_status {
            Some(code) => {
                let _ = writeln!(out, "exit status: {}", code);
            }
            None => {
                let _ = writeln!(out, "exit status: none (terminated)");
            }
        }
        let _ = write!(out, "analysis: {}", self.analysis);
        out
    }
}

/// Everything passed to one code-generation call
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// 1-based index of the attempt this code is for
    pub attempt: u32,
    pub request_text: &'a str,
    pub prior_context: Option<&'a str>,
    pub variables: &'a [VariableSummary],
    /// Feedback of the attempt immediately before this one
    pub previous: Option<&'a Feedback>,
    /// Every finished attempt so far, oldest first
    pub history: &'a [Feedback],
    pub credentials: Option<&'a Credentials>,
}

impl GenerationRequest<'_> {
    pub fn is_retry(&self) -> bool {
        self.previous.is_some()
    }

    /// One line per available variable
    pub fn data_description(&self) -> String {
        if self.variables.is_empty() {
            return "No data variables available.".to_string();
        }
        self.variables
            .iter()
            .map(|v| format!("- {}", v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// External collaborator turning a request into Python source.
///
/// Called once per attempt with growing context; any error ends the workflow.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> anyhow::Result<String>;
}

/// Body of the first fenced code block in `text`, or `text` itself.
pub fn strip_code_fence(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after_open = &text[open + 3..];
    // skip the info string (`python`, `py`, ...)
    let body_start = match after_open.find('\n') {
        Some(i) => i + 1,
        None => return text,
    };
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim_end_matches([' ', '\t']),
        None => text,
    }
}

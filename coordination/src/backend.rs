//! The backend seam.
//!
//! A backend takes a model name, a system prompt and user content, and
//! returns raw text plus an exit code. Concrete adapters (CLI agents, HTTP
//! clients) live outside this crate; the cascade and the multi-pass
//! orchestrator only see this trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::exit_code;

/// Optional backend feature a route may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read-only sandboxed execution.
    Sandbox,
    /// No session persistence.
    Ephemeral,
    /// Final message written to a file instead of stdout.
    OutputFile,
    /// Accepts a reasoning-effort hint.
    ReasoningEffort,
    /// Can run the planning/review/verification pipeline.
    MultiPass,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Self::Sandbox,
        Self::Ephemeral,
        Self::OutputFile,
        Self::ReasoningEffort,
        Self::MultiPass,
    ];

    /// Exact-name lookup; unknown names are `None`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Ephemeral => "ephemeral",
            Self::OutputFile => "output_file",
            Self::ReasoningEffort => "reasoning_effort",
            Self::MultiPass => "multi_pass",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_content: String,
    pub timeout_seconds: u64,
    /// Only set for backends reporting [`Capability::ReasoningEffort`].
    pub reasoning_effort: Option<String>,
}

/// Raw backend result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    pub output: String,
    pub exit_code: i32,
}

impl BackendOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: exit_code::SUCCESS,
        }
    }

    pub fn failure(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == exit_code::SUCCESS
    }
}

/// A named backend that can run one review prompt.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Run one prompt. Failures are reported through the exit code, never
    /// by panicking.
    async fn invoke(&self, request: &InvocationRequest) -> BackendOutput;

    /// Whether this backend supports `capability`.
    fn has_capability(&self, _capability: Capability) -> bool {
        false
    }
}

/// Invoke with an enforced wall-clock timeout.
///
/// A timeout is an ordinary failure with exit code 1; the in-flight future
/// is dropped, which kills child processes spawned with `kill_on_drop`.
pub async fn invoke_bounded(backend: &dyn Backend, request: &InvocationRequest) -> BackendOutput {
    let limit = Duration::from_secs(request.timeout_seconds.max(1));
    match tokio::time::timeout(limit, backend.invoke(request)).await {
        Ok(output) => output,
        Err(_) => {
            warn!(
                backend = %backend.name(),
                timeout_secs = request.timeout_seconds,
                "Backend invocation timed out"
            );
            BackendOutput::failure(
                exit_code::BACKEND_FAILURE,
                format!("timed out after {}s", request.timeout_seconds),
            )
        }
    }
}

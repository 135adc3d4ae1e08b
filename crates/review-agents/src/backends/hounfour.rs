//! Model-routing service, reached through its project-local CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use review_coordination::error::exit_code;
use review_coordination::redaction::Redactor;
use review_coordination::{Backend, BackendOutput, Capability, InvocationRequest};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::process::{map_exit_status, run_with_timeout, stderr_tail};
use crate::config::HounfourSettings;

pub const NAME: &str = "hounfour";

pub struct HounfourBackend {
    command: PathBuf,
    agent: String,
    project_root: PathBuf,
    redactor: Redactor,
}

impl HounfourBackend {
    pub fn new(project_root: &Path, settings: &HounfourSettings) -> Self {
        let command = PathBuf::from(&settings.command);
        let command = if command.is_absolute() {
            command
        } else {
            project_root.join(command)
        };
        Self {
            command,
            agent: settings.agent.clone(),
            project_root: project_root.to_path_buf(),
            redactor: Redactor::from_env(),
        }
    }

    pub fn command_path(&self) -> &Path {
        &self.command
    }

    pub fn is_available(&self) -> bool {
        is_executable(&self.command)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// The CLI's JSON envelope carries the model text under `content`.
fn unwrap_envelope(stdout: &str) -> String {
    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(Value::Object(map)) => match map.get("content") {
            Some(Value::String(content)) => content.clone(),
            _ => stdout.to_string(),
        },
        _ => stdout.to_string(),
    }
}

#[async_trait]
impl Backend for HounfourBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn invoke(&self, request: &InvocationRequest) -> BackendOutput {
        let scratch = match tempfile::Builder::new().prefix("review-hounfour-").tempdir() {
            Ok(d) => d,
            Err(e) => return BackendOutput::failure(exit_code::BACKEND_FAILURE, format!("scratch dir: {e}")),
        };
        let system_file = scratch.path().join("system.md");
        let input_file = scratch.path().join("input.md");
        if let Err(e) = std::fs::write(&system_file, &request.system_prompt)
            .and_then(|_| std::fs::write(&input_file, &request.user_content))
        {
            return BackendOutput::failure(exit_code::BACKEND_FAILURE, format!("prompt files: {e}"));
        }

        let mut cmd = Command::new(&self.command);
        cmd.arg("--agent")
            .arg(&self.agent)
            .arg("--model")
            .arg(&request.model)
            .arg("--system")
            .arg(&system_file)
            .arg("--input")
            .arg(&input_file)
            .args(["--output-format", "json"])
            .arg("--timeout")
            .arg(request.timeout_seconds.to_string());

        debug!(command = %self.command.display(), model = %request.model, "Invoking model router");
        let output = match run_with_timeout(
            &mut cmd,
            Some(&self.project_root),
            None,
            Duration::from_secs(request.timeout_seconds.max(1)),
        )
        .await
        {
            Ok(o) => o,
            Err(e) => return BackendOutput::failure(exit_code::BACKEND_FAILURE, e),
        };

        let code = map_exit_status(output.status.code());
        if code != exit_code::SUCCESS {
            let tail = stderr_tail(&output.stderr, &self.redactor);
            warn!(backend = NAME, code, stderr = %tail, "Model router failed");
            return BackendOutput::failure(code, tail);
        }
        BackendOutput::success(unwrap_envelope(&String::from_utf8_lossy(&output.stdout)))
    }

    fn has_capability(&self, capability: Capability) -> bool {
        matches!(capability, Capability::MultiPass)
    }
}

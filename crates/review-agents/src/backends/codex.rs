//! Agent CLI backend (`codex exec`).
//!
//! Runs read-only in a scratch workspace. Optional flags are passed only
//! when the installed CLI advertises them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use review_coordination::error::exit_code;
use review_coordination::redaction::Redactor;
use review_coordination::{Backend, BackendOutput, Capability, InvocationRequest};
use tracing::{debug, warn};

use super::auth::{require_credential, CODEX_KEY_VARS};
use super::capabilities::{probe, CapabilityCache, CapabilityRecord};
use super::process::{map_exit_status, run_with_timeout, stderr_tail, CommandLine};
use super::workspace::ScopedWorkspace;

pub const NAME: &str = "codex";

pub struct CodexBackend {
    cli: Option<CommandLine>,
    capabilities: CapabilityRecord,
    project_root: PathBuf,
    tool_access: bool,
    redactor: Redactor,
}

impl CodexBackend {
    /// Build with an already-known capability record.
    pub fn new(command: &str, capabilities: CapabilityRecord, project_root: &Path, tool_access: bool) -> Self {
        let cli = CommandLine::parse(command);
        if cli.is_none() {
            warn!(command, "Unparseable agent CLI command");
        }
        Self {
            cli,
            capabilities,
            project_root: project_root.to_path_buf(),
            tool_access,
            redactor: Redactor::from_env(),
        }
    }

    /// Build after probing the installed CLI (cached per version).
    pub async fn detect(command: &str, cache: &CapabilityCache, project_root: &Path, tool_access: bool) -> Self {
        let capabilities = match CommandLine::parse(command) {
            Some(cli) => probe(NAME, &cli, cache).await,
            None => CapabilityRecord::unprobed(NAME),
        };
        Self::new(command, capabilities, project_root, tool_access)
    }

    pub fn capabilities(&self) -> &CapabilityRecord {
        &self.capabilities
    }

    /// Arguments after the configured command line. The prompt goes on stdin.
    pub fn exec_args(&self, request: &InvocationRequest, workspace: &Path, output_file: Option<&Path>) -> Vec<String> {
        let caps = &self.capabilities;
        let mut args: Vec<String> = vec!["exec".into(), "--sandbox".into(), "read-only".into()];
        if caps.supports(Capability::Ephemeral) {
            args.push("--ephemeral".into());
        }
        args.push("--skip-git-repo-check".into());
        args.push("--model".into());
        args.push(request.model.clone());
        if let Some(file) = output_file {
            args.push("--output-last-message".into());
            args.push(file.to_string_lossy().into_owned());
        }
        args.push("-C".into());
        args.push(workspace.to_string_lossy().into_owned());
        if let Some(effort) = request.reasoning_effort.as_deref() {
            if caps.supports(Capability::ReasoningEffort) {
                args.push("-c".into());
                args.push(format!("model_reasoning_effort={effort}"));
            }
        }
        args.push("-".into());
        args
    }
}

#[async_trait]
impl Backend for CodexBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn invoke(&self, request: &InvocationRequest) -> BackendOutput {
        if let Err(e) = require_credential(CODEX_KEY_VARS) {
            warn!(backend = NAME, "{e}");
            return BackendOutput::failure(e.exit_code(), e.to_string());
        }
        let Some(cli) = &self.cli else {
            return BackendOutput::failure(exit_code::BACKEND_FAILURE, "agent CLI command is empty or malformed");
        };

        let workspace = if self.tool_access {
            ScopedWorkspace::populate(&self.project_root, &request.user_content)
        } else {
            ScopedWorkspace::empty()
        };
        let workspace = match workspace {
            Ok(ws) => ws,
            Err(e) => return BackendOutput::failure(exit_code::BACKEND_FAILURE, format!("workspace: {e}")),
        };

        let scratch = match tempfile::Builder::new().prefix("review-codex-").tempdir() {
            Ok(d) => d,
            Err(e) => return BackendOutput::failure(exit_code::BACKEND_FAILURE, format!("scratch dir: {e}")),
        };
        let output_file = self
            .capabilities
            .supports(Capability::OutputFile)
            .then(|| scratch.path().join("last-message.txt"));

        let mut cmd = cli.command();
        cmd.args(self.exec_args(request, workspace.path(), output_file.as_deref()));
        let prompt = format!("{}\n\n{}", request.system_prompt, request.user_content);

        debug!(
            backend = NAME,
            model = %request.model,
            files = workspace.files().len(),
            output_file = output_file.is_some(),
            "Invoking agent CLI"
        );
        let output = match run_with_timeout(
            &mut cmd,
            Some(workspace.path()),
            Some(prompt.into_bytes()),
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
            warn!(backend = NAME, code, stderr = %tail, "Agent CLI failed");
            return BackendOutput::failure(code, tail);
        }

        let from_file = output_file
            .and_then(|p| std::fs::read_to_string(p).ok())
            .filter(|s| !s.trim().is_empty());
        BackendOutput::success(from_file.unwrap_or_else(|| String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn has_capability(&self, capability: Capability) -> bool {
        match capability {
            Capability::MultiPass => true,
            // Always passed; older CLIs default to read-only anyway.
            Capability::Sandbox => true,
            other => self.capabilities.supports(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::capabilities::parse_help_flags;
    use chrono::Utc;

    fn request(effort: Option<&str>) -> InvocationRequest {
        InvocationRequest {
            model: "gpt-5.2".into(),
            system_prompt: "sys".into(),
            user_content: "diff".into(),
            timeout_seconds: 30,
            reasoning_effort: effort.map(String::from),
        }
    }

    fn full_caps() -> CapabilityRecord {
        CapabilityRecord::new(
            NAME,
            "1.0",
            parse_help_flags("--sandbox --ephemeral --output-last-message --config --model"),
            Utc::now(),
        )
    }

    #[test]
    fn test_exec_args_with_all_flags() {
        let b = CodexBackend::new("codex", full_caps(), Path::new("."), false);
        let args = b.exec_args(&request(Some("high")), Path::new("/ws"), Some(Path::new("/tmp/out")));
        assert_eq!(&args[..4], &["exec", "--sandbox", "read-only", "--ephemeral"]);
        assert!(args.windows(2).any(|w| w == ["--output-last-message", "/tmp/out"]));
        assert!(args.windows(2).any(|w| w == ["-C", "/ws"]));
        assert!(args.windows(2).any(|w| w == ["-c", "model_reasoning_effort=high"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_exec_args_unprobed_cli() {
        let b = CodexBackend::new("codex", CapabilityRecord::unprobed(NAME), Path::new("."), false);
        let args = b.exec_args(&request(Some("high")), Path::new("/ws"), None);
        assert!(!args.contains(&"--ephemeral".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("model_reasoning_effort")));
        assert!(args.contains(&"--skip-git-repo-check".to_string()));
        assert!(b.has_capability(Capability::MultiPass));
        assert!(!b.has_capability(Capability::ReasoningEffort));
    }

    #[test]
    fn test_configured_prefix_args_kept() {
        let b = CodexBackend::new("npx -y codex", full_caps(), Path::new("."), false);
        let cli = b.cli.as_ref().unwrap();
        assert_eq!(cli.program, "npx");
        assert_eq!(cli.args, vec!["-y", "codex"]);
    }
}

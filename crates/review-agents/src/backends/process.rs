//! Child-process plumbing shared by the CLI backends.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use review_coordination::error::exit_code;
use review_coordination::redaction::Redactor;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const STDERR_TAIL_CHARS: usize = 2000;

/// A configured command line, split with shell quoting rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// `None` for an empty or unbalanced command string.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = shlex::split(raw)?.into_iter();
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Fresh `Command` with the configured leading arguments.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Run to completion, killing the whole process group if the timeout
/// elapses or the future is dropped. `input` is written to stdin.
pub async fn run_with_timeout(
    cmd: &mut Command,
    working_dir: Option<&Path>,
    input: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<std::process::Output, String> {
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    let stdin = if input.is_some() { Stdio::piped() } else { Stdio::null() };
    cmd.stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so kill_on_drop also reaches grandchildren.
    #[cfg(unix)]
    cmd.process_group(0);

    let run = async {
        let mut child = cmd.spawn()?;
        if let (Some(bytes), Some(mut pipe)) = (input, child.stdin.take()) {
            // Feed stdin concurrently so a chatty child cannot deadlock on stdout.
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&bytes).await {
                    debug!(error = %e, bytes = bytes.len(), "Child stdin closed before the prompt was fully written");
                }
            });
        }
        child.wait_with_output().await
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("Failed to execute: {e}")),
        Err(_) => Err(format!("Timed out after {}s", timeout.as_secs())),
    }
}

/// Fold a child's exit status into the cascade's codes.
///
/// Credential and unparseable-output codes keep their meaning; everything
/// else, signals and the child's own "invalid input" included, is a backend
/// failure.
pub fn map_exit_status(code: Option<i32>) -> i32 {
    match code {
        Some(0) => exit_code::SUCCESS,
        Some(c) if c == exit_code::MISSING_AUTH || c == exit_code::UNPARSEABLE_OUTPUT => c,
        _ => exit_code::BACKEND_FAILURE,
    }
}

/// Last part of stderr, scrubbed, for logs.
pub fn stderr_tail(stderr: &[u8], redactor: &Redactor) -> String {
    let text = String::from_utf8_lossy(stderr);
    let count = text.chars().count();
    let tail: String = if count > STDERR_TAIL_CHARS {
        text.chars().skip(count - STDERR_TAIL_CHARS).collect()
    } else {
        text.into_owned()
    };
    redactor.redact_text(tail.trim())
}

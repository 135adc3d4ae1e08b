//! Review entry point.
//!
//! Reads the caller's files, short-circuits disabled and over-iterated
//! reviews, resolves the route table, runs the cascade and persists a
//! redacted, validated result. Every outcome is an exit code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use review_coordination::contract::ReviewResult;
use review_coordination::error::exit_code;
use review_coordination::redaction::Redactor;
use review_coordination::routes::{
    execute, resolve_route_table, CascadeContext, CascadeOptions, ConditionRegistry, EnvSnapshot,
    ReviewRequest,
};
use review_coordination::Verdict;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backends::BackendSet;
use crate::config::{ConditionSpec, ReviewConfig};

/// What is being reviewed; selects the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReviewType {
    Code,
    Prd,
    Sdd,
    Sprint,
}

const RESPONSE_FORMAT: &str = "\
Respond with a single JSON object and nothing else:
{\"verdict\": \"APPROVED\" | \"CHANGES_REQUIRED\" | \"DECISION_NEEDED\", \
\"summary\": string, \"findings\": [{\"severity\", \"file\", \"line\", \"description\", \"suggestion\"}]}";

impl ReviewType {
    pub fn system_header(self) -> &'static str {
        match self {
            Self::Code => {
                "You are reviewing a code change. Look for correctness bugs, security \
                 issues, missing error handling and missing tests."
            }
            Self::Prd => {
                "You are reviewing a product requirements document. Look for ambiguous \
                 requirements, missing acceptance criteria and unstated assumptions."
            }
            Self::Sdd => {
                "You are reviewing a software design document. Look for gaps between the \
                 design and its requirements, unsafe interfaces and unhandled failure modes."
            }
            Self::Sprint => {
                "You are reviewing a sprint plan. Look for tasks without clear outcomes, \
                 missing dependencies and scope that cannot fit the sprint."
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Prd => "prd",
            Self::Sdd => "sdd",
            Self::Sprint => "sprint",
        }
    }
}

/// One review request from the caller.
#[derive(Debug, Clone)]
pub struct ReviewInvocation {
    pub review_type: ReviewType,
    pub content_path: PathBuf,
    pub expertise_path: Option<PathBuf>,
    pub context_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub iteration: u32,
    pub previous_path: Option<PathBuf>,
    /// Force a single combined pass.
    pub fast: bool,
    /// Overrides the configured per-attempt timeout.
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is empty")]
    Empty(PathBuf),
    #[error("previous review {path} is not valid JSON: {source}")]
    InvalidPrevious {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl InputError {
    pub fn exit_code(&self) -> i32 {
        exit_code::NO_VIABLE_ROUTE
    }
}

fn read_file(path: &Path) -> Result<String, InputError> {
    std::fs::read_to_string(path).map_err(|source| InputError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn read_optional(path: Option<&Path>) -> Result<Option<String>, InputError> {
    path.map(read_file)
        .transpose()
        .map(|text| text.filter(|t| !t.trim().is_empty()))
}

/// Prompt pieces assembled from the caller's files.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPrompt {
    pub system_prompt: String,
    pub content: String,
    pub previous: Option<Value>,
}

/// Expertise goes ahead of the type header; context goes ahead of the content.
pub fn prepare_prompt(invocation: &ReviewInvocation) -> Result<PreparedPrompt, InputError> {
    let content = read_file(&invocation.content_path)?;
    if content.trim().is_empty() {
        return Err(InputError::Empty(invocation.content_path.clone()));
    }
    let expertise = read_optional(invocation.expertise_path.as_deref())?;
    let context = read_optional(invocation.context_path.as_deref())?;
    let previous = match invocation.previous_path.as_deref() {
        None => None,
        Some(path) => {
            let raw = read_file(path)?;
            let value = serde_json::from_str(&raw).map_err(|source| InputError::InvalidPrevious {
                path: path.to_path_buf(),
                source,
            })?;
            Some(value)
        }
    };

    let mut system_prompt = String::new();
    if let Some(expertise) = expertise {
        system_prompt.push_str(expertise.trim_end());
        system_prompt.push_str("\n\n");
    }
    system_prompt.push_str(invocation.review_type.system_header());
    system_prompt.push_str("\n\n");
    system_prompt.push_str(RESPONSE_FORMAT);

    let content = match context {
        Some(context) => format!("{}\n\n{}", context.trim_end(), content),
        None => content,
    };

    Ok(PreparedPrompt {
        system_prompt,
        content,
        previous,
    })
}

/// Result written when the iteration cap is exceeded.
pub fn auto_approved(iteration: u32, max_iterations: u32) -> ReviewResult {
    ReviewResult {
        verdict: Verdict::Approved,
        summary: format!("Auto-approved: iteration {iteration} exceeds the limit of {max_iterations}"),
        findings: Vec::new(),
        iteration,
        pass_metadata: None,
        verification: None,
        auto_approved: Some(true),
    }
}

/// Redact, re-validate and write the final document.
pub fn persist(result: &ReviewResult, path: &Path, redactor: &Redactor) -> i32 {
    let redacted = match redactor.redact_json(&result.to_value()) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "Redaction failed; refusing to write output");
            return exit_code::BACKEND_FAILURE;
        }
    };
    let validated = match ReviewResult::from_persisted_value(&redacted) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Final result violates the review contract");
            return e.exit_code();
        }
    };
    let body = match serde_json::to_string_pretty(&validated.to_value()) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "Failed to serialize result");
            return exit_code::BACKEND_FAILURE;
        }
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!(path = %parent.display(), error = %e, "Failed to create output directory");
            return exit_code::BACKEND_FAILURE;
        }
    }
    match std::fs::write(path, body + "\n") {
        Ok(()) => {
            info!(path = %path.display(), verdict = %validated.verdict, "Review written");
            exit_code::SUCCESS
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to write review");
            exit_code::BACKEND_FAILURE
        }
    }
}

/// Register config-declared conditions, each evaluated now.
///
/// A declaration that cannot be registered (bad name, shadows a built-in)
/// is logged and left out, so routes naming it are dropped at parse time.
pub fn register_operator_conditions(
    registry: &mut ConditionRegistry,
    specs: &BTreeMap<String, ConditionSpec>,
    lookup: &dyn Fn(&str) -> Option<String>,
) {
    for (name, spec) in specs {
        let value = spec.evaluate(lookup);
        match registry.register(name, Arc::new(move || value)) {
            Ok(()) => debug!(condition = %name, value, "Registered operator condition"),
            Err(e) => error!(condition = %name, error = %e, "Ignoring operator condition"),
        }
    }
}

/// Run one review against an already-built backend set.
pub async fn run_review(
    invocation: &ReviewInvocation,
    config: &ReviewConfig,
    env: &EnvSnapshot,
    backends: BackendSet,
    options: CascadeOptions,
) -> i32 {
    let redactor = Redactor::from_env();
    let settings = &config.review;

    if !settings.enabled {
        info!("Review disabled by configuration");
        let skipped = ReviewResult::skipped("Review disabled by configuration", invocation.iteration);
        return persist(&skipped, &invocation.output_path, &redactor);
    }
    if invocation.iteration > settings.max_iterations {
        info!(
            iteration = invocation.iteration,
            max = settings.max_iterations,
            "Iteration limit exceeded, auto-approving"
        );
        let approved = auto_approved(invocation.iteration, settings.max_iterations);
        return persist(&approved, &invocation.output_path, &redactor);
    }

    let prompt = match prepare_prompt(invocation) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Invalid review input");
            return e.exit_code();
        }
    };

    let multi_pass = env.multi_pass_enabled(settings.multi_pass) && !invocation.fast;
    let mut conditions = ConditionRegistry::with_builtins(backends.probes.clone(), env.in_ci, multi_pass);
    register_operator_conditions(&mut conditions, &config.conditions, &|key: &str| std::env::var(key).ok());
    let route_table = config.route_table_json();
    let report = resolve_route_table(env, route_table.as_ref(), &backends.registry, &conditions);
    if !report.dropped.is_empty() {
        warn!(dropped = report.dropped.len(), "Some route entries were dropped");
    }
    if let Some(reason) = &report.fallback_reason {
        warn!(%reason, "Route table rejected, using default cascade");
    }
    info!(
        review_type = invocation.review_type.as_str(),
        iteration = invocation.iteration,
        routes = report.table.len(),
        source = ?report.table.source(),
        multi_pass,
        "Starting review"
    );

    let request = ReviewRequest {
        model: settings.model.clone(),
        system_prompt: prompt.system_prompt,
        content: prompt.content,
        timeout_seconds: invocation.timeout_seconds.unwrap_or(settings.timeout_seconds),
        iteration: invocation.iteration,
        previous: prompt.previous,
    };
    let mut ctx = CascadeContext::new(CascadeOptions {
        multi_pass,
        budgets: settings.budgets,
        ..options
    });
    let outcome = execute(&report.table, &backends.registry, &conditions, &request, &mut ctx).await;

    if !outcome.is_success() {
        error!(
            exit_code = outcome.exit_code,
            attempted = ?outcome.attempted_sequence(),
            "Review failed"
        );
        return outcome.exit_code;
    }
    info!(
        backend = outcome.backend.as_deref().unwrap_or("unknown"),
        attempts = outcome.attempts.len(),
        "Persisting review"
    );
    match &outcome.result {
        Some(result) => persist(result, &invocation.output_path, &redactor),
        None => exit_code::BACKEND_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(dir: &Path) -> ReviewInvocation {
        ReviewInvocation {
            review_type: ReviewType::Code,
            content_path: dir.join("content.diff"),
            expertise_path: None,
            context_path: None,
            output_path: dir.join("out/result.json"),
            iteration: 1,
            previous_path: None,
            fast: false,
            timeout_seconds: None,
        }
    }

    #[test]
    fn test_prepare_prompt_layers_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("content.diff"), "+fn a() {}\n").unwrap();
        std::fs::write(dir.path().join("expertise.md"), "Rust expert.\n").unwrap();
        std::fs::write(dir.path().join("context.md"), "Sprint goal: auth.\n").unwrap();
        let mut inv = invocation(dir.path());
        inv.expertise_path = Some(dir.path().join("expertise.md"));
        inv.context_path = Some(dir.path().join("context.md"));

        let p = prepare_prompt(&inv).unwrap();
        assert!(p.system_prompt.starts_with("Rust expert.\n\nYou are reviewing a code change"));
        assert!(p.system_prompt.contains("\"verdict\""));
        assert_eq!(p.content, "Sprint goal: auth.\n\n+fn a() {}\n");
        assert!(p.previous.is_none());
    }

    #[test]
    fn test_prepare_prompt_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path());
        assert_eq!(prepare_prompt(&inv).unwrap_err().exit_code(), 2);

        std::fs::write(dir.path().join("content.diff"), "   \n").unwrap();
        assert!(matches!(prepare_prompt(&inv), Err(InputError::Empty(_))));

        std::fs::write(dir.path().join("content.diff"), "+x\n").unwrap();
        std::fs::write(dir.path().join("prev.json"), "{broken").unwrap();
        let mut inv = inv;
        inv.previous_path = Some(dir.path().join("prev.json"));
        assert!(matches!(prepare_prompt(&inv), Err(InputError::InvalidPrevious { .. })));
    }

    #[test]
    fn test_persist_redacts_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/result.json");
        let mut result = ReviewResult::skipped("found sk-abcdefghijklmnopqrstuvwxyz123456 in diff", 2);
        result.verdict = Verdict::ChangesRequired;

        assert_eq!(persist(&result, &path, &Redactor::new()), 0);
        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["verdict"], "CHANGES_REQUIRED");
        assert_eq!(written["iteration"], 2);
        assert!(!written["summary"].as_str().unwrap().contains("sk-abcdef"));
    }

    #[test]
    fn test_operator_conditions_cannot_shadow_builtins() {
        let mut registry = ConditionRegistry::with_builtins(
            review_coordination::routes::AvailabilityProbes::fixed(false, false, false),
            false,
            false,
        );
        let specs: BTreeMap<String, ConditionSpec> = [
            ("nightly".to_string(), ConditionSpec::EnvSet("NIGHTLY".into())),
            ("ci".to_string(), ConditionSpec::EnvSet("NIGHTLY".into())),
            ("bad;name".to_string(), ConditionSpec::EnvSet("NIGHTLY".into())),
        ]
        .into();
        let lookup = |k: &str| (k == "NIGHTLY").then(|| "1".to_string());

        register_operator_conditions(&mut registry, &specs, &lookup);

        assert!(registry.evaluate("nightly"));
        assert!(!registry.evaluate("ci"));
        assert!(!registry.contains("bad;name"));
    }

    #[test]
    fn test_auto_approved_shape() {
        let r = auto_approved(4, 3);
        assert_eq!(r.verdict, Verdict::Approved);
        assert_eq!(r.auto_approved, Some(true));
        assert_eq!(r.to_value()["auto_approved"], true);
    }

    #[test]
    fn test_review_type_headers_differ() {
        let headers: std::collections::HashSet<_> = [ReviewType::Code, ReviewType::Prd, ReviewType::Sdd, ReviewType::Sprint]
            .iter()
            .map(|t| t.system_header())
            .collect();
        assert_eq!(headers.len(), 4);
    }
}

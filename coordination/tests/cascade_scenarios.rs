//! End-to-end cascade scenarios
//!
//! Drives route resolution and the cascade with scripted backends: config
//! text in, attempted backend sequence and exit code out.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use review_coordination::contract::{PassMode, VerificationStatus};
use review_coordination::multipass::orchestrator::PassOutcome;
use review_coordination::multipass::prompts::{
    COMBINED_HEADER, PLANNING_HEADER, REVIEW_HEADER, VERIFICATION_HEADER,
};
use review_coordination::routes::{
    execute, resolve_route_table, AvailabilityProbes, BackendRegistry, CascadeContext,
    CascadeOptions, ConditionRegistry, EnvSnapshot, ReviewRequest, RouteSource, RouteTable,
};
use review_coordination::{Backend, BackendOutput, Capability, InvocationRequest, Verdict};
use serde_json::json;

const APPROVED: &str = r#"{"verdict": "APPROVED", "summary": "ok", "findings": []}"#;

/// Replies by pass header; a single-pass backend only ever sees the combined header.
struct ScriptedBackend {
    name: &'static str,
    replies: Mutex<HashMap<&'static str, VecDeque<BackendOutput>>>,
    calls: Mutex<Vec<&'static str>>,
    multi_pass: bool,
}

impl ScriptedBackend {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            multi_pass: false,
        }
    }

    fn multi_pass(mut self) -> Self {
        self.multi_pass = true;
        self
    }

    fn reply(self, header: &'static str, output: BackendOutput) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(header)
            .or_default()
            .push_back(output);
        self
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, request: &InvocationRequest) -> BackendOutput {
        let header = [PLANNING_HEADER, REVIEW_HEADER, VERIFICATION_HEADER, COMBINED_HEADER]
            .into_iter()
            .find(|h| request.system_prompt.contains(h))
            .unwrap_or(COMBINED_HEADER);
        self.calls.lock().unwrap().push(header);
        self.replies
            .lock()
            .unwrap()
            .get_mut(header)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| BackendOutput::failure(1, "no scripted reply"))
    }

    fn has_capability(&self, capability: Capability) -> bool {
        self.multi_pass && capability == Capability::MultiPass
    }
}

fn registry(backends: &[Arc<ScriptedBackend>]) -> BackendRegistry {
    let mut reg = BackendRegistry::new();
    for b in backends {
        reg.register(b.clone()).unwrap();
    }
    reg
}

fn conditions(multi_pass: bool) -> ConditionRegistry {
    ConditionRegistry::with_builtins(AvailabilityProbes::fixed(true, true, true), false, multi_pass)
}

fn options(multi_pass: bool) -> CascadeOptions {
    CascadeOptions {
        backoff_base: Duration::ZERO,
        multi_pass,
        ..CascadeOptions::default()
    }
}

fn request() -> ReviewRequest {
    ReviewRequest {
        model: "gpt-5.2".into(),
        system_prompt: "You review code.".into(),
        content: "diff --git a/src/lib.rs b/src/lib.rs\n+pub fn f() {}\n".into(),
        timeout_seconds: 60,
        iteration: 1,
        previous: None,
    }
}

fn three_route_config() -> serde_json::Value {
    serde_yaml::from_str(
        r#"
schema_version: 1
routes:
  - backend: hounfour
    fail_mode: fallthrough
    retries: 0
  - backend: codex
    fail_mode: fallthrough
    retries: 0
  - backend: curl
    fail_mode: hard_fail
    retries: 0
"#,
    )
    .unwrap()
}

/// Test: every backend fails but the last → the last one's result, full sequence attempted
#[tokio::test]
async fn test_fallthrough_to_last_backend() {
    let hounfour = Arc::new(ScriptedBackend::new("hounfour").reply(COMBINED_HEADER, BackendOutput::failure(1, "down")));
    let codex = Arc::new(ScriptedBackend::new("codex").reply(COMBINED_HEADER, BackendOutput::failure(5, "garbage")));
    let curl = Arc::new(ScriptedBackend::new("curl").reply(COMBINED_HEADER, BackendOutput::success(APPROVED)));
    let backends = registry(&[hounfour.clone(), codex.clone(), curl.clone()]);
    let conds = conditions(false);

    let report = resolve_route_table(&EnvSnapshot::default(), Some(&three_route_config()), &backends, &conds);
    assert_eq!(report.table.source(), RouteSource::Config);

    let mut ctx = CascadeContext::new(options(false));
    let outcome = execute(&report.table, &backends, &conds, &request(), &mut ctx).await;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.attempted_sequence(), vec!["hounfour", "codex", "curl"]);
    assert_eq!(outcome.backend.as_deref(), Some("curl"));
    assert_eq!(outcome.result.unwrap().verdict, Verdict::Approved);
}

/// Test: first backend succeeds → nothing else is tried
#[tokio::test]
async fn test_first_backend_success_stops_cascade() {
    let hounfour = Arc::new(ScriptedBackend::new("hounfour").reply(COMBINED_HEADER, BackendOutput::success(APPROVED)));
    let codex = Arc::new(ScriptedBackend::new("codex"));
    let curl = Arc::new(ScriptedBackend::new("curl"));
    let backends = registry(&[hounfour.clone(), codex.clone(), curl.clone()]);
    let conds = conditions(false);

    let report = resolve_route_table(&EnvSnapshot::default(), Some(&three_route_config()), &backends, &conds);
    let mut ctx = CascadeContext::new(options(false));
    let outcome = execute(&report.table, &backends, &conds, &request(), &mut ctx).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempted_sequence(), vec!["hounfour"]);
    assert!(codex.calls().is_empty());
    assert!(curl.calls().is_empty());
}

/// Test: an empty table fails with exit 2 and invokes nothing
#[tokio::test]
async fn test_empty_table_is_no_viable_route() {
    let curl = Arc::new(ScriptedBackend::new("curl").reply(COMBINED_HEADER, BackendOutput::success(APPROVED)));
    let backends = registry(&[curl.clone()]);
    let conds = conditions(false);

    let mut ctx = CascadeContext::new(options(false));
    let outcome = execute(&RouteTable::empty(), &backends, &conds, &request(), &mut ctx).await;

    assert_eq!(outcome.exit_code, 2);
    assert!(outcome.result.is_none());
    assert!(outcome.attempts.is_empty());
    assert!(curl.calls().is_empty());
}

/// Test: forcing an unregistered backend yields the same empty-table failure
#[tokio::test]
async fn test_forced_unknown_backend_is_no_viable_route() {
    let curl = Arc::new(ScriptedBackend::new("curl").reply(COMBINED_HEADER, BackendOutput::success(APPROVED)));
    let backends = registry(&[curl.clone()]);
    let conds = conditions(false);
    let env = EnvSnapshot {
        execution_mode: Some("gemini".into()),
        ..EnvSnapshot::default()
    };

    let report = resolve_route_table(&env, None, &backends, &conds);
    assert!(report.table.is_empty());

    let mut ctx = CascadeContext::new(options(false));
    let outcome = execute(&report.table, &backends, &conds, &request(), &mut ctx).await;
    assert_eq!(outcome.exit_code, 2);
    assert!(curl.calls().is_empty());
}

/// Test: verification failure keeps the review pass's verdict and marks verification skipped
#[tokio::test]
async fn test_multi_pass_verification_failure_degrades() {
    let review = r#"{"verdict": "CHANGES_REQUIRED", "summary": "two issues", "findings": [{"id": 1}, {"id": 2}]}"#;
    let codex = Arc::new(
        ScriptedBackend::new("codex")
            .multi_pass()
            .reply(PLANNING_HEADER, BackendOutput::success(r#"{"scope": "small", "risk_areas": []}"#))
            .reply(REVIEW_HEADER, BackendOutput::success(review))
            .reply(VERIFICATION_HEADER, BackendOutput::failure(1, "verifier crashed")),
    );
    let backends = registry(&[codex.clone()]);
    let conds = conditions(true);
    let config = json!({"schema_version": 1, "routes": [{"backend": "codex", "fail_mode": "hard_fail", "retries": 0}]});

    let report = resolve_route_table(&EnvSnapshot::default(), Some(&config), &backends, &conds);
    let mut ctx = CascadeContext::new(options(true));
    let outcome = execute(&report.table, &backends, &conds, &request(), &mut ctx).await;

    assert_eq!(outcome.exit_code, 0);
    let result = outcome.result.unwrap();
    assert_eq!(result.verdict, Verdict::ChangesRequired);
    assert_eq!(result.findings.len(), 2);
    assert_eq!(result.verification, Some(VerificationStatus::Skipped));
    let meta = result.pass_metadata.unwrap();
    assert_eq!(meta.mode, PassMode::MultiPass);
    assert_eq!(meta.passes_completed, 2);

    assert_eq!(outcome.passes.len(), 3);
    assert_eq!(outcome.passes[2].outcome, PassOutcome::Failed { exit_code: 1 });
    assert_eq!(
        codex.calls(),
        vec![PLANNING_HEADER, REVIEW_HEADER, VERIFICATION_HEADER]
    );
}

/// Test: a backend name carrying shell metacharacters is dropped at parse time
#[tokio::test]
async fn test_injected_backend_name_rejected() {
    let curl = Arc::new(ScriptedBackend::new("curl").reply(COMBINED_HEADER, BackendOutput::success(APPROVED)));
    let backends = registry(&[curl.clone()]);
    let conds = conditions(false);
    let config = json!({
        "schema_version": 1,
        "routes": [{"backend": "curl; rm -rf /", "fail_mode": "hard_fail"}],
    });

    let report = resolve_route_table(&EnvSnapshot::default(), Some(&config), &backends, &conds);

    // The only entry was dropped, so the table falls back to the defaults.
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.table.source(), RouteSource::Default);
    assert!(report
        .table
        .routes()
        .iter()
        .all(|r| !r.backend.contains(';')));
    assert!(curl.calls().is_empty());
}

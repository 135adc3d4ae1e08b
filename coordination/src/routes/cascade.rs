//! Route cascade executor.
//!
//! Walks the table in declared order. Each eligible route gets up to
//! `retries + 1` attempts; every attempt, on any route, counts against one
//! cascade-wide cap owned by the per-call [`CascadeContext`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use super::registry::{BackendRegistry, ConditionRegistry};
use super::state::{after_failure, AttemptEvent, IllegalTransition, RouteMachine, TransitionRecord};
use super::table::{FailMode, Route, RouteTable};
use crate::backend::{Backend, Capability};
use crate::contract::ReviewResult;
use crate::error::{exit_code, ErrorClass};
use crate::multipass::{
    run_multi_pass, run_single_pass, FusionPolicy, MultiPassOutcome, MultiPassRequest, PassBudgets,
    PassResult,
};

/// Default cap on attempts across the whole cascade.
pub const MAX_TOTAL_ATTEMPTS: u32 = 6;

/// Per-call knobs.
#[derive(Debug, Clone)]
pub struct CascadeOptions {
    pub max_total_attempts: u32,
    /// First retry delay; doubles on each further retry of the same route.
    pub backoff_base: Duration,
    /// Run the three-pass pipeline on backends that support it.
    pub multi_pass: bool,
    pub budgets: PassBudgets,
    pub fusion: FusionPolicy,
}

impl Default for CascadeOptions {
    fn default() -> Self {
        Self {
            max_total_attempts: MAX_TOTAL_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
            multi_pass: false,
            budgets: PassBudgets::default(),
            fusion: FusionPolicy::default(),
        }
    }
}

/// The review to dispatch.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub model: String,
    pub system_prompt: String,
    pub content: String,
    /// Caller's ceiling; each attempt uses the smaller of this and the route's.
    pub timeout_seconds: u64,
    pub iteration: u32,
    pub previous: Option<Value>,
}

/// One backend attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub backend: String,
    pub route_index: usize,
    /// 1-based position on its route.
    pub route_attempt: u32,
    pub exit_code: i32,
    pub error_class: Option<ErrorClass>,
    pub elapsed_ms: u64,
}

/// State owned by one top-level invocation.
#[derive(Debug)]
pub struct CascadeContext {
    options: CascadeOptions,
    attempts_used: u32,
    records: Vec<ExecutionAttempt>,
    machine: RouteMachine,
}

impl CascadeContext {
    pub fn new(options: CascadeOptions) -> Self {
        Self {
            options,
            attempts_used: 0,
            records: Vec::new(),
            machine: RouteMachine::new(),
        }
    }

    pub fn options(&self) -> &CascadeOptions {
        &self.options
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    pub fn remaining(&self) -> u32 {
        self.options
            .max_total_attempts
            .saturating_sub(self.attempts_used)
    }

    pub fn records(&self) -> &[ExecutionAttempt] {
        &self.records
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        self.machine.transitions()
    }

    fn fire(&mut self, event: AttemptEvent) -> Result<(), IllegalTransition> {
        self.machine.fire(event).map(|_| ())
    }
}

/// Result of one cascade run.
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub result: Option<ReviewResult>,
    pub exit_code: i32,
    /// Backend that produced `result`.
    pub backend: Option<String>,
    pub attempts: Vec<ExecutionAttempt>,
    pub passes: Vec<PassResult>,
}

impl CascadeOutcome {
    fn failure(exit_code: i32, attempts: &[ExecutionAttempt]) -> Self {
        Self {
            result: None,
            exit_code,
            backend: None,
            attempts: attempts.to_vec(),
            passes: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == exit_code::SUCCESS && self.result.is_some()
    }

    /// Backends in the order they were tried, retries collapsed.
    pub fn attempted_sequence(&self) -> Vec<String> {
        let mut seq: Vec<(usize, String)> = Vec::new();
        for a in &self.attempts {
            if seq.last().map(|(i, _)| *i) != Some(a.route_index) {
                seq.push((a.route_index, a.backend.clone()));
            }
        }
        seq.into_iter().map(|(_, b)| b).collect()
    }
}

/// Run the cascade. Never panics; every failure becomes an exit code.
pub async fn execute(
    table: &RouteTable,
    backends: &BackendRegistry,
    conditions: &ConditionRegistry,
    request: &ReviewRequest,
    ctx: &mut CascadeContext,
) -> CascadeOutcome {
    match run(table, backends, conditions, request, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Route cascade reached an illegal state");
            CascadeOutcome::failure(e.exit_code(), &ctx.records)
        }
    }
}

async fn run(
    table: &RouteTable,
    backends: &BackendRegistry,
    conditions: &ConditionRegistry,
    request: &ReviewRequest,
    ctx: &mut CascadeContext,
) -> Result<CascadeOutcome, IllegalTransition> {
    let mut last_exit: Option<i32> = None;

    for (index, route) in table.routes().iter().enumerate() {
        ctx.machine.enter_route(index, &route.backend);

        let Some(backend) = eligible_backend(route, backends, conditions) else {
            ctx.fire(AttemptEvent::Ineligible)?;
            ctx.fire(AttemptEvent::Advance)?;
            continue;
        };

        if ctx.remaining() == 0 {
            return budget_spent(ctx, last_exit);
        }

        let timeout = u64::from(route.timeout_seconds).min(request.timeout_seconds.max(1));
        let mut route_attempt = 0u32;
        loop {
            ctx.fire(AttemptEvent::Invoke)?;
            ctx.attempts_used += 1;
            route_attempt += 1;

            let started = Instant::now();
            let result = attempt(backend.as_ref(), request, timeout, &ctx.options).await;
            let (code, error_class) = match &result {
                Ok(_) => (exit_code::SUCCESS, None),
                Err((code, class)) => (*code, Some(*class)),
            };
            ctx.records.push(ExecutionAttempt {
                backend: route.backend.clone(),
                route_index: index,
                route_attempt,
                exit_code: code,
                error_class,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });

            match result {
                Ok(outcome) => {
                    ctx.fire(AttemptEvent::Succeeded)?;
                    info!(
                        backend = %route.backend,
                        attempts = ctx.attempts_used,
                        verdict = %outcome.result.verdict,
                        "Review produced"
                    );
                    return Ok(CascadeOutcome {
                        result: Some(outcome.result),
                        exit_code: exit_code::SUCCESS,
                        backend: Some(route.backend.clone()),
                        attempts: ctx.records.clone(),
                        passes: outcome.passes,
                    });
                }
                Err((code, class)) => {
                    ctx.fire(AttemptEvent::Failed)?;
                    last_exit = Some(code);
                    warn!(
                        backend = %route.backend,
                        attempt = route_attempt,
                        exit_code = code,
                        %class,
                        remaining = ctx.remaining(),
                        "Backend attempt failed"
                    );
                    match after_failure(class, route_attempt, route.retries, ctx.remaining()) {
                        AttemptEvent::Invoke => {
                            let delay = backoff(ctx.options.backoff_base, route_attempt);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        AttemptEvent::BudgetSpent => return budget_spent(ctx, last_exit),
                        _ => {
                            ctx.fire(AttemptEvent::Exhausted)?;
                            break;
                        }
                    }
                }
            }
        }

        match route.fail_mode {
            FailMode::HardFail => {
                ctx.fire(AttemptEvent::HardFail)?;
                let code = last_exit.unwrap_or(exit_code::BACKEND_FAILURE);
                warn!(backend = %route.backend, exit_code = code, "Hard-fail route exhausted");
                return Ok(CascadeOutcome::failure(code, &ctx.records));
            }
            FailMode::Fallthrough => ctx.fire(AttemptEvent::Fallthrough)?,
        }
    }

    ctx.fire(AttemptEvent::NoMoreRoutes)?;
    warn!(
        routes = table.len(),
        attempts = ctx.attempts_used,
        "No viable route produced a review"
    );
    Ok(CascadeOutcome::failure(exit_code::NO_VIABLE_ROUTE, &ctx.records))
}

/// The route's backend when its conditions hold and its capability is present.
fn eligible_backend(
    route: &Route,
    backends: &BackendRegistry,
    conditions: &ConditionRegistry,
) -> Option<std::sync::Arc<dyn Backend>> {
    let Some(backend) = backends.lookup(&route.backend) else {
        error!(backend = %route.backend, "Route names an unregistered backend, skipping");
        return None;
    };
    if !conditions.evaluate_all(&route.conditions) {
        info!(backend = %route.backend, conditions = ?route.conditions, "Route conditions not met");
        return None;
    }
    if let Some(cap) = route.capability {
        if !backend.has_capability(cap) {
            info!(backend = %route.backend, capability = %cap, "Route capability missing");
            return None;
        }
    }
    Some(backend)
}

fn budget_spent(
    ctx: &mut CascadeContext,
    last_exit: Option<i32>,
) -> Result<CascadeOutcome, IllegalTransition> {
    ctx.fire(AttemptEvent::BudgetSpent)?;
    let code = last_exit.unwrap_or(exit_code::NO_VIABLE_ROUTE);
    warn!(
        max_total_attempts = ctx.options.max_total_attempts,
        exit_code = code,
        "Global attempt cap reached"
    );
    Ok(CascadeOutcome::failure(code, &ctx.records))
}

/// `base * 2^(n-1)` for the n-th retry.
fn backoff(base: Duration, route_attempt: u32) -> Duration {
    base.saturating_mul(1u32 << route_attempt.saturating_sub(1).min(16))
}

async fn attempt(
    backend: &dyn Backend,
    request: &ReviewRequest,
    timeout_seconds: u64,
    options: &CascadeOptions,
) -> Result<MultiPassOutcome, (i32, ErrorClass)> {
    let mp = MultiPassRequest {
        model: request.model.clone(),
        system_prompt: request.system_prompt.clone(),
        content: request.content.clone(),
        timeout_seconds,
        iteration: request.iteration,
        previous: request.previous.clone(),
        budgets: options.budgets,
        fusion: options.fusion,
    };
    let outcome = if options.multi_pass && backend.has_capability(Capability::MultiPass) {
        run_multi_pass(backend, &mp).await
    } else {
        run_single_pass(backend, &mp).await
    };
    outcome.map_err(|e| {
        warn!(backend = %backend.name(), error = %e, "Review attempt failed");
        (e.exit_code(), e.class())
    })
}

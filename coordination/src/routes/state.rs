//! Per-attempt state machine for the route cascade.
//!
//! ```text
//! Pending ──Ineligible──▸ Skipped ──Advance──▸ (next route) Pending
//!    │
//!    └──Invoke──▸ Invoking ──Succeeded──▸ Success
//!                    │
//!                    └──Failed──▸ Failed ──Invoke (retry)──▸ Invoking
//!                                   │
//!                                   └──Exhausted──▸ RouteExhausted ──Fallthrough──▸ (next route) Pending
//!                                                        │
//!                                                        └──HardFail──▸ Terminal
//! ```
//!
//! `BudgetSpent` moves any live state to `Terminal` when the cascade-wide
//! attempt cap is reached; `NoMoreRoutes` ends a cascade that ran out of
//! routes. The transition function is pure so the graph can be tested
//! without a backend.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{exit_code, ErrorClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Skipped,
    Invoking,
    Success,
    Failed,
    RouteExhausted,
    Terminal,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Terminal)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Invoking => write!(f, "INVOKING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::RouteExhausted => write!(f, "ROUTE_EXHAUSTED"),
            Self::Terminal => write!(f, "TERMINAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptEvent {
    /// Conditions false or required capability missing.
    Ineligible,
    /// Start an attempt (first or retry).
    Invoke,
    Succeeded,
    Failed,
    /// No retries left on this route.
    Exhausted,
    Fallthrough,
    HardFail,
    /// Move past a skipped route.
    Advance,
    /// Global attempt cap reached.
    BudgetSpent,
    NoMoreRoutes,
}

impl fmt::Display for AttemptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ineligible => "ineligible",
            Self::Invoke => "invoke",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Exhausted => "exhausted",
            Self::Fallthrough => "fallthrough",
            Self::HardFail => "hard_fail",
            Self::Advance => "advance",
            Self::BudgetSpent => "budget_spent",
            Self::NoMoreRoutes => "no_more_routes",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal attempt transition: {from} --{event}--> ?")]
pub struct IllegalTransition {
    pub from: AttemptState,
    pub event: AttemptEvent,
}

impl IllegalTransition {
    /// A broken cascade is a configuration-level failure.
    pub fn exit_code(&self) -> i32 {
        exit_code::NO_VIABLE_ROUTE
    }
}

/// The transition function.
pub fn transition(from: AttemptState, event: AttemptEvent) -> Result<AttemptState, IllegalTransition> {
    use AttemptEvent as E;
    use AttemptState as S;

    let to = match (from, event) {
        (S::Pending, E::Ineligible) => S::Skipped,
        (S::Pending, E::Invoke) | (S::Failed, E::Invoke) => S::Invoking,
        (S::Invoking, E::Succeeded) => S::Success,
        (S::Invoking, E::Failed) => S::Failed,
        (S::Failed, E::Exhausted) => S::RouteExhausted,
        (S::RouteExhausted, E::Fallthrough) | (S::Skipped, E::Advance) => S::Pending,
        (S::RouteExhausted, E::HardFail) => S::Terminal,
        (S::Skipped, E::NoMoreRoutes) | (S::RouteExhausted, E::NoMoreRoutes) => S::Terminal,
        (S::Pending, E::NoMoreRoutes) => S::Terminal,
        (s, E::BudgetSpent) if !s.is_terminal() => S::Terminal,
        _ => return Err(IllegalTransition { from, event }),
    };
    Ok(to)
}

/// What to do after a failed attempt on a route.
///
/// Non-retryable failures (auth, budget) skip remaining retries on this
/// route; the cascade may still fall through to a backend with different
/// credentials. An exhausted
/// route is reported before the global cap, which the cascade checks again
/// before the next route's first attempt.
pub fn after_failure(
    failure: ErrorClass,
    attempts_on_route: u32,
    route_retries: u32,
    global_remaining: u32,
) -> AttemptEvent {
    if !failure.is_retryable() || attempts_on_route > route_retries {
        AttemptEvent::Exhausted
    } else if global_remaining == 0 {
        AttemptEvent::BudgetSpent
    } else {
        AttemptEvent::Invoke
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub route_index: usize,
    pub backend: String,
    pub from: AttemptState,
    pub event: AttemptEvent,
    pub to: AttemptState,
    pub elapsed_ms: u64,
}

/// Current cascade position plus the full transition log.
#[derive(Debug)]
pub struct RouteMachine {
    current: AttemptState,
    route_index: usize,
    backend: String,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl Default for RouteMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteMachine {
    pub fn new() -> Self {
        Self {
            current: AttemptState::Pending,
            route_index: 0,
            backend: String::new(),
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> AttemptState {
        self.current
    }

    /// Label subsequent transitions with the route being evaluated.
    pub fn enter_route(&mut self, index: usize, backend: &str) {
        self.route_index = index;
        self.backend = backend.to_string();
    }

    pub fn fire(&mut self, event: AttemptEvent) -> Result<AttemptState, IllegalTransition> {
        let to = transition(self.current, event)?;
        debug!(
            route = self.route_index,
            backend = %self.backend,
            from = %self.current,
            %event,
            to = %to,
            "Route state transition"
        );
        self.transitions.push(TransitionRecord {
            route_index: self.route_index,
            backend: self.backend.clone(),
            from: self.current,
            event,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
        });
        self.current = to;
        Ok(to)
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }
}

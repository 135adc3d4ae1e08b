//! Three-pass review pipeline with graceful degradation.
//!
//! Pass 1 and Pass 3 are optional: losing either still yields a review.
//! Pass 2 is the only fatal stage, and gets one retry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::complexity::{model_signal, Complexity, ComplexityClassifier, FusionPolicy};
use super::prompts::{
    combined_prompt, planning_prompt, review_prompt, verification_prompt, PassPrompt,
};
use super::tokens::{
    check_budget_overflow, enforce_token_budget, estimate_token_count, BudgetCheck, PassBudgets,
};
use super::PassKind;
use crate::backend::{invoke_bounded, Backend, Capability, InvocationRequest};
use crate::contract::{PassMetadata, PassMode, ReviewResult, VerificationStatus, Verdict};
use crate::error::{exit_code, ErrorClass};
use crate::normalize::normalize_output;

/// Review attempts allowed for Pass 2.
const REVIEW_PASS_ATTEMPTS: u32 = 2;

/// Inputs shared by every pass of one review.
#[derive(Debug, Clone)]
pub struct MultiPassRequest {
    pub model: String,
    pub system_prompt: String,
    pub content: String,
    pub timeout_seconds: u64,
    pub iteration: u32,
    /// Prior iteration's result, for re-review.
    pub previous: Option<Value>,
    pub budgets: PassBudgets,
    pub fusion: FusionPolicy,
}

impl MultiPassRequest {
    pub fn new(
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        content: impl Into<String>,
        timeout_seconds: u64,
        iteration: u32,
    ) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            content: content.into(),
            timeout_seconds,
            iteration,
            previous: None,
            budgets: PassBudgets::default(),
            fusion: FusionPolicy::default(),
        }
    }
}

/// Estimated tokens sent and received by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u32,
    pub output: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PassOutcome {
    Completed,
    Failed { exit_code: i32 },
    Skipped,
}

/// One stage's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassResult {
    pub pass: PassKind,
    pub outcome: PassOutcome,
    pub verdict: Option<Verdict>,
    pub summary: Option<String>,
    pub findings: Option<Vec<Value>>,
    /// Planning pass only: complexity implied by its risk report.
    pub complexity_signal: Option<Complexity>,
    pub tokens: TokenCounts,
}

impl PassResult {
    fn skipped(pass: PassKind) -> Self {
        Self {
            pass,
            outcome: PassOutcome::Skipped,
            verdict: None,
            summary: None,
            findings: None,
            complexity_signal: None,
            tokens: TokenCounts::default(),
        }
    }

    fn failed(pass: PassKind, exit_code: i32, tokens: TokenCounts) -> Self {
        Self {
            outcome: PassOutcome::Failed { exit_code },
            tokens,
            ..Self::skipped(pass)
        }
    }

    fn completed(pass: PassKind, value: &Value, tokens: TokenCounts) -> Self {
        Self {
            pass,
            outcome: PassOutcome::Completed,
            verdict: value
                .get("verdict")
                .and_then(Value::as_str)
                .and_then(Verdict::parse),
            summary: value
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string),
            findings: value.get("findings").and_then(Value::as_array).cloned(),
            complexity_signal: (pass == PassKind::Planning).then(|| model_signal(value)),
            tokens,
        }
    }
}

/// Final review plus the per-pass trail.
#[derive(Debug, Clone)]
pub struct MultiPassOutcome {
    pub result: ReviewResult,
    pub passes: Vec<PassResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiPassError {
    #[error("{pass} pass failed with exit code {exit_code}: {reason}")]
    PassFailed {
        pass: PassKind,
        exit_code: i32,
        reason: String,
    },
    #[error("content does not fit the {pass} pass token budget")]
    BudgetExhausted { pass: PassKind },
}

impl MultiPassError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PassFailed { exit_code, .. } => *exit_code,
            Self::BudgetExhausted { .. } => exit_code::BACKEND_FAILURE,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PassFailed { exit_code, .. } => {
                ErrorClass::from_exit_code(*exit_code).unwrap_or(ErrorClass::Backend)
            }
            Self::BudgetExhausted { .. } => ErrorClass::Budget,
        }
    }
}

struct PassFailure {
    exit_code: i32,
    reason: String,
}

struct PassRunner<'a> {
    backend: &'a dyn Backend,
    request: &'a MultiPassRequest,
    used_tokens: u32,
    passes: Vec<PassResult>,
}

impl<'a> PassRunner<'a> {
    fn new(backend: &'a dyn Backend, request: &'a MultiPassRequest) -> Self {
        Self {
            backend,
            request,
            used_tokens: 0,
            passes: Vec::new(),
        }
    }

    /// Build the pass prompt with content fitted to the pass budget.
    ///
    /// `None` means the pass is skipped. With `within_total`, tokens already
    /// spent by earlier passes also count against the call-wide budget.
    fn fit(
        &mut self,
        pass: PassKind,
        within_total: bool,
        build: impl Fn(&str) -> PassPrompt,
    ) -> Option<PassPrompt> {
        let budgets = &self.request.budgets;
        let mut budget = budgets.for_pass(pass);
        if within_total {
            budget = budget.min(budgets.total.saturating_sub(self.used_tokens));
        }
        let overhead = estimate_token_count(&build("").full_text());
        let content_tokens = estimate_token_count(&self.request.content);

        match check_budget_overflow(overhead, content_tokens, budget) {
            BudgetCheck::Fits => Some(build(&self.request.content)),
            BudgetCheck::Truncate { allowed } => {
                let cut = enforce_token_budget(&self.request.content, allowed);
                warn!(
                    %pass,
                    original_tokens = cut.original_tokens,
                    kept_tokens = cut.tokens,
                    "Content truncated to fit pass budget"
                );
                if cut.text.is_empty() {
                    self.passes.push(PassResult::skipped(pass));
                    None
                } else {
                    Some(build(&cut.text))
                }
            }
            BudgetCheck::Skip => {
                warn!(%pass, budget, overhead, class = %ErrorClass::Budget, "Pass skipped, token budget exhausted");
                self.passes.push(PassResult::skipped(pass));
                None
            }
        }
    }

    fn effort(&self, complexity: Complexity) -> Option<String> {
        self.backend
            .has_capability(Capability::ReasoningEffort)
            .then(|| complexity.reasoning_effort().to_string())
    }

    /// Run one pass and normalize its output to a JSON object.
    async fn invoke(
        &mut self,
        prompt: PassPrompt,
        complexity: Complexity,
    ) -> Result<Value, PassFailure> {
        let pass = prompt.pass;
        let input = estimate_token_count(&prompt.full_text());
        let request = InvocationRequest {
            model: self.request.model.clone(),
            system_prompt: prompt.system,
            user_content: prompt.user,
            timeout_seconds: self.request.timeout_seconds,
            reasoning_effort: self.effort(complexity),
        };

        debug!(backend = %self.backend.name(), %pass, input_tokens = input, "Invoking pass");
        let out = invoke_bounded(self.backend, &request).await;
        let tokens = TokenCounts {
            input,
            output: estimate_token_count(&out.output),
        };
        self.used_tokens = self
            .used_tokens
            .saturating_add(tokens.input)
            .saturating_add(tokens.output);

        if !out.is_success() {
            self.passes
                .push(PassResult::failed(pass, out.exit_code, tokens));
            return Err(PassFailure {
                exit_code: out.exit_code,
                reason: format!("backend exited with code {}", out.exit_code),
            });
        }

        match normalize_output(&out.output) {
            Ok(normalized) => {
                self.passes
                    .push(PassResult::completed(pass, &normalized.value, tokens));
                Ok(normalized.value)
            }
            Err(e) => {
                self.passes
                    .push(PassResult::failed(pass, e.exit_code(), tokens));
                Err(PassFailure {
                    exit_code: e.exit_code(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// One pass that must satisfy the result contract.
    async fn invoke_review(
        &mut self,
        prompt: PassPrompt,
        complexity: Complexity,
    ) -> Result<ReviewResult, PassFailure> {
        let value = self.invoke(prompt, complexity).await?;
        ReviewResult::from_backend_value(&value, self.request.iteration).map_err(|e| PassFailure {
            exit_code: e.exit_code(),
            reason: e.to_string(),
        })
    }

    /// Combined single prompt, used for fast mode and Pass 1 degradation.
    async fn single(
        mut self,
        mode: PassMode,
        complexity: Complexity,
    ) -> Result<MultiPassOutcome, MultiPassError> {
        let request = self.request;
        let prompt = self
            .fit(PassKind::Combined, false, |c| {
                combined_prompt(&request.system_prompt, c, request.previous.as_ref())
            })
            .ok_or(MultiPassError::BudgetExhausted {
                pass: PassKind::Combined,
            })?;

        let mut result = self
            .invoke_review(prompt, complexity)
            .await
            .map_err(|f| MultiPassError::PassFailed {
                pass: PassKind::Combined,
                exit_code: f.exit_code,
                reason: f.reason,
            })?;
        result.pass_metadata = Some(PassMetadata {
            mode,
            passes_completed: 1,
            complexity: Some(complexity),
        });
        Ok(MultiPassOutcome {
            result,
            passes: self.passes,
        })
    }
}

/// Run the full planning/review/verification pipeline.
pub async fn run_multi_pass(
    backend: &dyn Backend,
    request: &MultiPassRequest,
) -> Result<MultiPassOutcome, MultiPassError> {
    let analysis = ComplexityClassifier::default().analyze(&request.content);
    info!(backend = %backend.name(), "Multi-pass review: {}", analysis.summary());
    let mut runner = PassRunner::new(backend, request);

    // Pass 1: planning.
    let planning = match runner.fit(PassKind::Planning, true, |c| {
        planning_prompt(&request.system_prompt, c)
    }) {
        Some(prompt) => runner.invoke(prompt, analysis.complexity).await.ok(),
        None => None,
    };
    let Some(planning) = planning else {
        warn!(backend = %backend.name(), "Planning pass unavailable, falling back to single pass");
        return runner
            .single(PassMode::SinglePassFallback, analysis.complexity)
            .await;
    };

    let complexity = request
        .fusion
        .fuse(analysis.complexity, model_signal(&planning));
    if complexity != analysis.complexity {
        info!(
            deterministic = %analysis.complexity,
            fused = %complexity,
            "Complexity raised by planning pass"
        );
    }

    // Pass 2: review. Fatal if both attempts fail.
    let mut last_failure = None;
    let mut review = None;
    for attempt in 1..=REVIEW_PASS_ATTEMPTS {
        let Some(prompt) = runner.fit(PassKind::Review, true, |c| {
            review_prompt(&request.system_prompt, c, &planning, request.previous.as_ref())
        }) else {
            warn!("Review pass exceeds remaining budget, falling back to single pass");
            return runner
                .single(PassMode::SinglePassFallback, complexity)
                .await;
        };
        match runner.invoke_review(prompt, complexity).await {
            Ok(result) => {
                review = Some(result);
                break;
            }
            Err(failure) => {
                warn!(
                    attempt,
                    exit_code = failure.exit_code,
                    reason = %failure.reason,
                    "Review pass failed"
                );
                last_failure = Some(failure);
            }
        }
    }
    let Some(mut review) = review else {
        let failure = last_failure.unwrap_or(PassFailure {
            exit_code: exit_code::BACKEND_FAILURE,
            reason: "review pass did not run".to_string(),
        });
        return Err(MultiPassError::PassFailed {
            pass: PassKind::Review,
            exit_code: failure.exit_code,
            reason: failure.reason,
        });
    };

    // Pass 3: verification. Losing it keeps Pass 2 as is.
    let review_value = review.to_value();
    let verified = match runner.fit(PassKind::Verification, true, |c| {
        verification_prompt(&request.system_prompt, c, &review_value)
    }) {
        Some(prompt) => match runner.invoke_review(prompt, complexity).await {
            Ok(result) => Some(result),
            Err(failure) => {
                warn!(
                    exit_code = failure.exit_code,
                    reason = %failure.reason,
                    "Verification pass failed, returning unverified review"
                );
                None
            }
        },
        None => None,
    };

    let result = match verified {
        Some(mut verified) => {
            verified.verification = Some(VerificationStatus::Passed);
            verified.pass_metadata = Some(PassMetadata {
                mode: PassMode::MultiPass,
                passes_completed: 3,
                complexity: Some(complexity),
            });
            verified
        }
        None => {
            review.verification = Some(VerificationStatus::Skipped);
            review.pass_metadata = Some(PassMetadata {
                mode: PassMode::MultiPass,
                passes_completed: 2,
                complexity: Some(complexity),
            });
            review
        }
    };

    Ok(MultiPassOutcome {
        result,
        passes: runner.passes,
    })
}

/// Single combined pass (fast mode or multi-pass disabled).
pub async fn run_single_pass(
    backend: &dyn Backend,
    request: &MultiPassRequest,
) -> Result<MultiPassOutcome, MultiPassError> {
    let analysis = ComplexityClassifier::default().analyze(&request.content);
    PassRunner::new(backend, request)
        .single(PassMode::SinglePass, analysis.complexity)
        .await
}

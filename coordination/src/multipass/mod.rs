//! Multi-pass reasoning pipeline.
//!
//! ```text
//! content ─▸ classify ─▸ Pass 1 (planning) ─▸ Pass 2 (review) ─▸ Pass 3 (verification)
//!                              │ fail/skip          │ 2 failures         │ fail/skip
//!                              ▼                    ▼                    ▼
//!                    single-pass-fallback      call fails        Pass 2 result,
//!                    (passes_completed=1)                        verification=skipped
//! ```

pub mod complexity;
pub mod orchestrator;
pub mod prompts;
pub mod tokens;

use serde::{Deserialize, Serialize};

pub use complexity::{
    classify_complexity, reclassify_with_model_signals, Complexity, ComplexityAnalysis,
    ComplexityClassifier, FusionPolicy,
};
pub use orchestrator::{
    run_multi_pass, run_single_pass, MultiPassError, MultiPassOutcome, MultiPassRequest,
    PassResult, TokenCounts,
};
pub use tokens::{
    check_budget_overflow, enforce_token_budget, estimate_token_count, BudgetCheck,
    HybridEstimator, PassBudgets, TokenEstimator,
};

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Planning,
    Review,
    Verification,
    /// Single prompt doing planning and review at once.
    Combined,
}

impl std::fmt::Display for PassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Review => write!(f, "review"),
            Self::Verification => write!(f, "verification"),
            Self::Combined => write!(f, "combined"),
        }
    }
}

//! Token estimation and per-pass budgets.
//!
//! Estimation is heuristic: no tokenizer is loaded. The hybrid estimator
//! blends character and word counts by content size and corrects for the
//! punctuation density of source code, which tokenizes denser than prose.

use serde::{Deserialize, Serialize};

use super::PassKind;

/// Trait for estimating token counts from text.
pub trait TokenEstimator {
    /// Estimate the number of tokens in the given text.
    fn estimate(&self, text: &str) -> u32;

    /// Estimator name for logging.
    fn name(&self) -> &str;
}

/// Words × factor (~1.3 tokens per English word).
#[derive(Debug, Clone)]
pub struct WordCountEstimator {
    pub factor: f64,
}

impl Default for WordCountEstimator {
    fn default() -> Self {
        Self { factor: 1.3 }
    }
}

impl TokenEstimator for WordCountEstimator {
    fn estimate(&self, text: &str) -> u32 {
        let words = text.split_whitespace().count();
        (words as f64 * self.factor).ceil() as u32
    }

    fn name(&self) -> &str {
        "word_count"
    }
}

/// Bytes / divisor (~4 characters per token).
#[derive(Debug, Clone)]
pub struct CharCountEstimator {
    pub chars_per_token: f64,
}

impl Default for CharCountEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl TokenEstimator for CharCountEstimator {
    fn estimate(&self, text: &str) -> u32 {
        (text.len() as f64 / self.chars_per_token).ceil() as u32
    }

    fn name(&self) -> &str {
        "char_count"
    }
}

/// Size tier boundary and the character-estimate weight used below it.
const TIERS: &[(usize, f64)] = &[(1_000, 0.5), (20_000, 0.6), (usize::MAX, 0.7)];

/// Punctuation density above which text is treated as code.
const CODE_DENSITY: f64 = 0.10;
/// Upper bound on the code correction multiplier.
const MAX_CODE_CORRECTION: f64 = 1.25;

/// Character baseline refined per content-size tier.
#[derive(Debug, Clone, Default)]
pub struct HybridEstimator {
    chars: CharCountEstimator,
    words: WordCountEstimator,
}

impl HybridEstimator {
    fn char_weight(len: usize) -> f64 {
        TIERS
            .iter()
            .find(|(limit, _)| len < *limit)
            .map(|(_, w)| *w)
            .unwrap_or(0.7)
    }

    fn code_correction(text: &str) -> f64 {
        let (mut visible, mut punct) = (0usize, 0usize);
        for c in text.chars().filter(|c| !c.is_whitespace()) {
            visible += 1;
            if c.is_ascii_punctuation() {
                punct += 1;
            }
        }
        if visible == 0 {
            return 1.0;
        }
        let density = punct as f64 / visible as f64;
        if density <= CODE_DENSITY {
            1.0
        } else {
            (1.0 + (density - CODE_DENSITY)).min(MAX_CODE_CORRECTION)
        }
    }
}

impl TokenEstimator for HybridEstimator {
    fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let w = Self::char_weight(text.len());
        let blended = w * f64::from(self.chars.estimate(text))
            + (1.0 - w) * f64::from(self.words.estimate(text));
        (blended * Self::code_correction(text)).ceil() as u32
    }

    fn name(&self) -> &str {
        "hybrid"
    }
}

/// Estimate tokens with the default hybrid estimator.
pub fn estimate_token_count(text: &str) -> u32 {
    HybridEstimator::default().estimate(text)
}

/// Content after budget enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetedContent {
    pub text: String,
    pub truncated: bool,
    pub original_tokens: u32,
    pub tokens: u32,
}

/// Truncate `content` to fit `budget` tokens.
///
/// Diffs are cut at file boundaries so every kept file section is whole;
/// if not even the first file fits, or the content is not a diff, whole
/// lines are kept from the top. A marker records what was dropped.
pub fn enforce_token_budget(content: &str, budget: u32) -> BudgetedContent {
    let estimator = HybridEstimator::default();
    let original_tokens = estimator.estimate(content);
    if original_tokens <= budget {
        return BudgetedContent {
            text: content.to_string(),
            truncated: false,
            original_tokens,
            tokens: original_tokens,
        };
    }

    let sections = diff_sections(content);
    let text = if sections.len() > 1 {
        fit_prefix(&estimator, &sections, budget, "files")
            .or_else(|| fit_prefix(&estimator, &line_units(content), budget, "lines"))
    } else {
        fit_prefix(&estimator, &line_units(content), budget, "lines")
    }
    .unwrap_or_default();

    let tokens = estimator.estimate(&text);
    BudgetedContent {
        text,
        truncated: true,
        original_tokens,
        tokens,
    }
}

/// Longest prefix of `units` that fits with its truncation marker.
fn fit_prefix(
    estimator: &HybridEstimator,
    units: &[&str],
    budget: u32,
    unit_name: &str,
) -> Option<String> {
    let render = |n: usize| {
        let mut out: String = units[..n].concat();
        if !out.ends_with('\n') && !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!(
            "[... truncated {} of {} {unit_name} to fit token budget ...]\n",
            units.len() - n,
            units.len()
        ));
        out
    };

    // Every candidate is measured, so whatever is returned fits.
    let (mut lo, mut hi) = (0usize, units.len());
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if estimator.estimate(&render(mid)) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    (lo > 0).then(|| render(lo))
}

/// Split a diff into per-file sections starting at `diff --git`.
fn diff_sections(content: &str) -> Vec<&str> {
    let starts: Vec<usize> = line_offsets(content)
        .filter(|&i| content[i..].starts_with("diff --git "))
        .collect();
    if starts.is_empty() {
        return vec![content];
    }
    let mut sections = Vec::with_capacity(starts.len() + 1);
    if starts[0] > 0 {
        sections.push(&content[..starts[0]]);
    }
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(content.len());
        sections.push(&content[start..end]);
    }
    sections
}

fn line_units(content: &str) -> Vec<&str> {
    content.split_inclusive('\n').collect()
}

fn line_offsets(content: &str) -> impl Iterator<Item = usize> + '_ {
    std::iter::once(0).chain(
        content
            .match_indices('\n')
            .map(|(i, _)| i + 1)
            .filter(move |&i| i < content.len()),
    )
}

/// Outcome of a pre-pass budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    /// Incoming content fits as is.
    Fits,
    /// Content must be truncated to `allowed` tokens.
    Truncate { allowed: u32 },
    /// Too little room left for a useful pass.
    Skip,
}

/// Smallest remaining budget worth running a pass with.
pub const MIN_USEFUL_TOKENS: u32 = 1_000;

/// Decide whether `incoming` tokens can be sent given `used` of `budget`.
pub fn check_budget_overflow(used: u32, incoming: u32, budget: u32) -> BudgetCheck {
    let remaining = budget.saturating_sub(used);
    if incoming <= remaining {
        BudgetCheck::Fits
    } else if remaining >= MIN_USEFUL_TOKENS {
        BudgetCheck::Truncate { allowed: remaining }
    } else {
        BudgetCheck::Skip
    }
}

/// Token budgets for the whole call and each pass's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassBudgets {
    pub total: u32,
    pub planning: u32,
    pub review: u32,
    pub verification: u32,
}

impl Default for PassBudgets {
    fn default() -> Self {
        Self {
            total: 128_000,
            planning: 48_000,
            review: 64_000,
            verification: 32_000,
        }
    }
}

impl PassBudgets {
    /// Input budget for one pass. The combined pass shares the review budget.
    pub fn for_pass(&self, pass: PassKind) -> u32 {
        match pass {
            PassKind::Planning => self.planning,
            PassKind::Review | PassKind::Combined => self.review,
            PassKind::Verification => self.verification,
        }
    }
}

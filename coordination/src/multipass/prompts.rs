//! Pass prompt builders.
//!
//! Templating only. The section markers below are load-bearing: backends
//! and tests locate embedded content by them, so they must not change.

use serde_json::{json, Value};

use super::PassKind;

pub const PLANNING_HEADER: &str = "## PLANNING PASS";
pub const REVIEW_HEADER: &str = "## REVIEW PASS";
pub const VERIFICATION_HEADER: &str = "## VERIFICATION PASS";
pub const COMBINED_HEADER: &str = "## SINGLE-PASS REVIEW";

pub const CONTENT_MARKER: &str = "=== CONTENT ===";
pub const PLANNING_CONTEXT_MARKER: &str = "=== PLANNING CONTEXT (JSON) ===";
pub const FINDINGS_MARKER: &str = "=== FINDINGS TO VERIFY (JSON) ===";
pub const PREVIOUS_REVIEW_MARKER: &str = "=== PREVIOUS REVIEW (JSON) ===";

const RESULT_SHAPE: &str = r#"Respond with a single JSON object:
{"verdict": "APPROVED" | "CHANGES_REQUIRED" | "DECISION_NEEDED", "summary": "...", "findings": [{"severity": "...", "file": "...", "description": "..."}]}"#;

const PLANNING_INSTRUCTIONS: &str = r#"Do not review line by line yet. Map the change: its scope, the components and dependencies it touches, the risk areas, and missing tests.
Respond with a single JSON object:
{"scope": "...", "dependencies": ["..."], "risk_areas": [{"area": "...", "severity": "low" | "medium" | "high" | "critical"}], "test_gaps": ["..."], "complexity": "low" | "medium" | "high"}"#;

const REVIEW_INSTRUCTIONS: &str = "Review the content in depth, using the planning context to focus on the risk areas it lists.";

const VERIFICATION_INSTRUCTIONS: &str = "Re-examine each finding against the content. Drop false positives, keep confirmed findings unchanged, and adjust the verdict if no blocking finding remains.";

const COMBINED_INSTRUCTIONS: &str = "Review the content in depth in a single pass.";

/// System and user text for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassPrompt {
    pub pass: PassKind,
    pub system: String,
    pub user: String,
}

impl PassPrompt {
    fn new(pass: PassKind, base_system: &str, header: &str, instructions: &str, user: String) -> Self {
        let system = if base_system.trim().is_empty() {
            format!("{header}\n\n{instructions}")
        } else {
            format!("{}\n\n{header}\n\n{instructions}", base_system.trim_end())
        };
        Self { pass, system, user }
    }

    /// Both halves, for token estimation.
    pub fn full_text(&self) -> String {
        format!("{}\n{}", self.system, self.user)
    }
}

fn section(marker: &str, body: &str) -> String {
    format!("{marker}\n{}\n", body.trim_end())
}

fn json_section(marker: &str, value: &Value) -> String {
    let body = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    section(marker, &body)
}

/// Verdict and findings of a prior iteration, the only parts a re-review needs.
fn previous_digest(previous: &Value) -> Value {
    json!({
        "verdict": previous.get("verdict").cloned().unwrap_or(Value::Null),
        "findings": previous.get("findings").cloned().unwrap_or_else(|| json!([])),
    })
}

pub fn planning_prompt(base_system: &str, content: &str) -> PassPrompt {
    PassPrompt::new(
        PassKind::Planning,
        base_system,
        PLANNING_HEADER,
        PLANNING_INSTRUCTIONS,
        section(CONTENT_MARKER, content),
    )
}

pub fn review_prompt(
    base_system: &str,
    content: &str,
    planning: &Value,
    previous: Option<&Value>,
) -> PassPrompt {
    let mut user = json_section(PLANNING_CONTEXT_MARKER, planning);
    if let Some(prev) = previous {
        user.push('\n');
        user.push_str(&json_section(PREVIOUS_REVIEW_MARKER, &previous_digest(prev)));
    }
    user.push('\n');
    user.push_str(&section(CONTENT_MARKER, content));
    PassPrompt::new(
        PassKind::Review,
        base_system,
        REVIEW_HEADER,
        &format!("{REVIEW_INSTRUCTIONS}\n{RESULT_SHAPE}"),
        user,
    )
}

pub fn verification_prompt(base_system: &str, content: &str, review: &Value) -> PassPrompt {
    let mut user = json_section(FINDINGS_MARKER, review);
    user.push('\n');
    user.push_str(&section(CONTENT_MARKER, content));
    PassPrompt::new(
        PassKind::Verification,
        base_system,
        VERIFICATION_HEADER,
        &format!("{VERIFICATION_INSTRUCTIONS}\n{RESULT_SHAPE}"),
        user,
    )
}

pub fn combined_prompt(base_system: &str, content: &str, previous: Option<&Value>) -> PassPrompt {
    let mut user = String::new();
    if let Some(prev) = previous {
        user.push_str(&json_section(PREVIOUS_REVIEW_MARKER, &previous_digest(prev)));
        user.push('\n');
    }
    user.push_str(&section(CONTENT_MARKER, content));
    PassPrompt::new(
        PassKind::Combined,
        base_system,
        COMBINED_HEADER,
        &format!("{COMBINED_INSTRUCTIONS}\n{RESULT_SHAPE}"),
        user,
    )
}

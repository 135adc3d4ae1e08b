//! Review result contract and fail-closed validation.
//!
//! Every backend response must be parsed into a [`ReviewResult`] before the
//! cascade treats an attempt as successful. Validation is hand-written
//! rather than delegated to serde so that each rejection names the field
//! that broke the contract.
//!
//! ## Contract schema
//!
//! ```text
//! ReviewResult {
//!     verdict:        APPROVED | CHANGES_REQUIRED | DECISION_NEEDED | SKIPPED,
//!     summary:        string,
//!     findings:       array<object>,
//!     iteration:      int >= 0,
//!     pass_metadata?: { mode, passes_completed, complexity? },
//!     verification?:  passed | skipped,
//!     auto_approved?: bool,
//! }
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::exit_code;
use crate::multipass::complexity::Complexity;

/// Overall review verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    ChangesRequired,
    DecisionNeeded,
    Skipped,
}

impl Verdict {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVED" => Some(Self::Approved),
            "CHANGES_REQUIRED" => Some(Self::ChangesRequired),
            "DECISION_NEEDED" => Some(Self::DecisionNeeded),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::ChangesRequired => "CHANGES_REQUIRED",
            Self::DecisionNeeded => "DECISION_NEEDED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Passed,
    Skipped,
}

/// How the review was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PassMode {
    /// Planning → review → verification pipeline.
    MultiPass,
    /// One combined pass by configuration (multi-pass off or fast mode).
    SinglePass,
    /// Planning failed; degraded to one combined pass.
    SinglePassFallback,
}

impl std::fmt::Display for PassMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MultiPass => write!(f, "multi-pass"),
            Self::SinglePass => write!(f, "single-pass"),
            Self::SinglePassFallback => write!(f, "single-pass-fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PassMetadata {
    pub mode: PassMode,
    pub passes_completed: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
}

/// The persisted review document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReviewResult {
    pub verdict: Verdict,
    pub summary: String,
    pub findings: Vec<Map<String, Value>>,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_metadata: Option<PassMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approved: Option<bool>,
}

/// Why a document failed the contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("review output must be a JSON object")]
    NotAnObject,
    #[error("required field '{0}' is missing")]
    MissingField(&'static str),
    #[error("field '{field}' has the wrong type (expected {expected})")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("verdict '{0}' is not one of APPROVED, CHANGES_REQUIRED, DECISION_NEEDED, SKIPPED")]
    InvalidVerdict(String),
    #[error("finding #{0} is not a JSON object")]
    FindingNotObject(usize),
}

impl ContractError {
    pub fn exit_code(&self) -> i32 {
        exit_code::UNPARSEABLE_OUTPUT
    }
}

impl ReviewResult {
    /// A result that performed no review.
    pub fn skipped(summary: impl Into<String>, iteration: u32) -> Self {
        Self {
            verdict: Verdict::Skipped,
            summary: summary.into(),
            findings: Vec::new(),
            iteration,
            pass_metadata: None,
            verification: None,
            auto_approved: None,
        }
    }

    /// Validate a backend response and stamp it with the caller's iteration.
    ///
    /// Backends are not required to echo `iteration`; if they do, it must be
    /// a non-negative integer, but the caller's value always wins.
    pub fn from_backend_value(value: &Value, iteration: u32) -> Result<Self, ContractError> {
        let obj = value.as_object().ok_or(ContractError::NotAnObject)?;
        if let Some(it) = obj.get("iteration") {
            if it.as_u64().is_none() {
                return Err(ContractError::WrongType {
                    field: "iteration",
                    expected: "non-negative integer",
                });
            }
        }
        let (verdict, summary, findings) = validate_core(obj)?;
        Ok(Self {
            verdict,
            summary,
            findings,
            iteration,
            pass_metadata: None,
            verification: None,
            auto_approved: None,
        })
    }

    /// Validate a complete persisted document, `iteration` included.
    pub fn from_persisted_value(value: &Value) -> Result<Self, ContractError> {
        let obj = value.as_object().ok_or(ContractError::NotAnObject)?;
        let iteration = obj
            .get("iteration")
            .ok_or(ContractError::MissingField("iteration"))?
            .as_u64()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or(ContractError::WrongType {
                field: "iteration",
                expected: "non-negative integer",
            })?;
        validate_core(obj)?;
        let mut result: ReviewResult =
            serde_json::from_value(value.clone()).map_err(|_| ContractError::WrongType {
                field: "pass_metadata",
                expected: "pass metadata, verification and auto_approved in contract shape",
            })?;
        result.iteration = iteration;
        Ok(result)
    }

    /// Serialize for persistence.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn validate_core(
    obj: &Map<String, Value>,
) -> Result<(Verdict, String, Vec<Map<String, Value>>), ContractError> {
    let verdict_raw = obj
        .get("verdict")
        .ok_or(ContractError::MissingField("verdict"))?
        .as_str()
        .ok_or(ContractError::WrongType {
            field: "verdict",
            expected: "string",
        })?;
    let verdict = Verdict::parse(verdict_raw)
        .ok_or_else(|| ContractError::InvalidVerdict(verdict_raw.to_string()))?;

    let summary = obj
        .get("summary")
        .ok_or(ContractError::MissingField("summary"))?
        .as_str()
        .ok_or(ContractError::WrongType {
            field: "summary",
            expected: "string",
        })?
        .to_string();

    let findings = obj
        .get("findings")
        .ok_or(ContractError::MissingField("findings"))?
        .as_array()
        .ok_or(ContractError::WrongType {
            field: "findings",
            expected: "array",
        })?
        .iter()
        .enumerate()
        .map(|(idx, f)| f.as_object().cloned().ok_or(ContractError::FindingNotObject(idx)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((verdict, summary, findings))
}

/// JSON schema of the persisted review document.
pub fn review_result_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(ReviewResult)).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_backend_output() {
        let value = json!({
            "verdict": "CHANGES_REQUIRED",
            "summary": "Two issues",
            "findings": [{"file": "a.rs", "severity": "high"}, {"file": "b.rs"}]
        });
        let result = ReviewResult::from_backend_value(&value, 2).unwrap();
        assert_eq!(result.verdict, Verdict::ChangesRequired);
        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.iteration, 2);
        assert!(result.pass_metadata.is_none());
    }

    #[test]
    fn test_caller_iteration_wins() {
        let value = json!({"verdict": "APPROVED", "summary": "", "findings": [], "iteration": 9});
        let result = ReviewResult::from_backend_value(&value, 1).unwrap();
        assert_eq!(result.iteration, 1);
    }

    #[test]
    fn test_missing_fields() {
        let cases = [
            (json!({"summary": "s", "findings": []}), "verdict"),
            (json!({"verdict": "APPROVED", "findings": []}), "summary"),
            (json!({"verdict": "APPROVED", "summary": "s"}), "findings"),
        ];
        for (value, field) in cases {
            assert_eq!(
                ReviewResult::from_backend_value(&value, 1),
                Err(ContractError::MissingField(field))
            );
        }
    }

    #[test]
    fn test_invalid_verdict() {
        let value = json!({"verdict": "LGTM", "summary": "s", "findings": []});
        let err = ReviewResult::from_backend_value(&value, 1).unwrap_err();
        assert_eq!(err, ContractError::InvalidVerdict("LGTM".into()));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_verdict_is_case_sensitive() {
        let value = json!({"verdict": "approved", "summary": "s", "findings": []});
        assert!(ReviewResult::from_backend_value(&value, 1).is_err());
    }

    #[test]
    fn test_findings_must_be_objects() {
        let value = json!({"verdict": "APPROVED", "summary": "s", "findings": [{}, "oops"]});
        assert_eq!(
            ReviewResult::from_backend_value(&value, 1),
            Err(ContractError::FindingNotObject(1))
        );
    }

    #[test]
    fn test_wrong_types() {
        let value = json!({"verdict": "APPROVED", "summary": 3, "findings": []});
        assert!(matches!(
            ReviewResult::from_backend_value(&value, 1),
            Err(ContractError::WrongType { field: "summary", .. })
        ));
        let value = json!({"verdict": "APPROVED", "summary": "s", "findings": [], "iteration": -1});
        assert!(matches!(
            ReviewResult::from_backend_value(&value, 1),
            Err(ContractError::WrongType { field: "iteration", .. })
        ));
        assert_eq!(
            ReviewResult::from_backend_value(&json!([]), 1),
            Err(ContractError::NotAnObject)
        );
    }

    #[test]
    fn test_persisted_document_requires_iteration() {
        let value = json!({"verdict": "APPROVED", "summary": "s", "findings": []});
        assert_eq!(
            ReviewResult::from_persisted_value(&value),
            Err(ContractError::MissingField("iteration"))
        );
    }

    #[test]
    fn test_optional_fields_serialization() {
        let mut result = ReviewResult::skipped("review disabled", 1);
        assert_eq!(
            result.to_value(),
            json!({"verdict": "SKIPPED", "summary": "review disabled", "findings": [], "iteration": 1})
        );

        result.pass_metadata = Some(PassMetadata {
            mode: PassMode::SinglePassFallback,
            passes_completed: 1,
            complexity: None,
        });
        result.verification = Some(VerificationStatus::Skipped);
        let value = result.to_value();
        assert_eq!(value["pass_metadata"]["mode"], "single-pass-fallback");
        assert_eq!(value["pass_metadata"]["passes_completed"], 1);
        assert_eq!(value["verification"], "skipped");

        let restored = ReviewResult::from_persisted_value(&value).unwrap();
        assert_eq!(restored, result);
    }

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = review_result_schema();
        let required = schema["required"].as_array().unwrap();
        for field in ["verdict", "summary", "findings", "iteration"] {
            assert!(required.iter().any(|r| r == field), "{field} not required");
        }
    }
}

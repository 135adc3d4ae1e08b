//! Credential lookup. Keys only ever come from the environment.

use review_coordination::error::exit_code;

/// Keys accepted by the HTTP backend.
pub const OPENAI_KEY_VARS: &[&str] = &["OPENAI_API_KEY"];

/// Keys accepted by the agent CLI.
pub const CODEX_KEY_VARS: &[&str] = &["OPENAI_API_KEY", "CODEX_API_KEY"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no credential found; set one of: {}", .vars.join(", "))]
pub struct MissingCredential {
    pub vars: Vec<String>,
}

impl MissingCredential {
    pub fn exit_code(&self) -> i32 {
        exit_code::MISSING_AUTH
    }
}

/// First non-blank value among `vars`.
pub fn credential_from(vars: &[&str], lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    vars.iter()
        .filter_map(|v| lookup(v))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

pub fn credential_from_env(vars: &[&str]) -> Option<String> {
    credential_from(vars, |k| std::env::var(k).ok())
}

pub fn require_credential(vars: &[&str]) -> Result<String, MissingCredential> {
    credential_from_env(vars).ok_or_else(|| MissingCredential {
        vars: vars.iter().map(|v| v.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_first_non_blank_wins() {
        let env: HashMap<&str, &str> = [("OPENAI_API_KEY", "  "), ("CODEX_API_KEY", "sk-codex")].into();
        let got = credential_from(CODEX_KEY_VARS, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(got.as_deref(), Some("sk-codex"));
    }

    #[test]
    fn test_missing() {
        assert_eq!(credential_from(OPENAI_KEY_VARS, |_| None), None);
        let err = MissingCredential {
            vars: vec!["OPENAI_API_KEY".into()],
        };
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}

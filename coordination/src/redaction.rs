//! Secret redaction for review content and review output.
//!
//! Two modes:
//! - **Text**: every secret-shaped substring is replaced by [`REDACTED`].
//! - **JSON**: only scalar values are rewritten, keys are never touched, and
//!   the set of leaf paths must be identical before and after. A structural
//!   mismatch is an error, never a silently altered document.
//!
//! The same module owns the sensitive-file denylist used when a backend is
//! given workspace access.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder substituted for every redacted value.
pub const REDACTED: &str = "***REDACTED***";

/// Environment variables whose values are always treated as secrets.
pub const SECRET_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "CODEX_API_KEY",
    "MOONSHOT_API_KEY",
    "GOOGLE_API_KEY",
];

/// Redaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionMode {
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum RedactionError {
    #[error("content is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("redaction changed document structure ({before} leaf paths before, {after} after)")]
    StructureChanged { before: usize, after: usize },
    #[error("secret pattern '{0}' still present after redaction")]
    SecretRemains(&'static str),
}

/// A named secret shape.
struct SecretPattern {
    name: &'static str,
    regex: Regex,
    /// Capture group holding a prefix to keep (header name, URL parameter).
    keep_prefix: bool,
}

const PATTERN_SOURCES: &[(&str, &str, bool)] = &[
    (
        "private_key_block",
        r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
        false,
    ),
    ("openai_anthropic_key", r"sk-[A-Za-z0-9_-]{20,}", false),
    ("github_token", r"gh[pousr]_[A-Za-z0-9]{36,}", false),
    ("github_pat", r"github_pat_[A-Za-z0-9_]{22,}", false),
    ("gitlab_token", r"glpat-[A-Za-z0-9_-]{20,}", false),
    ("slack_token", r"xox[abprs]-[A-Za-z0-9-]{10,}", false),
    ("google_api_key", r"AIza[0-9A-Za-z_-]{35}", false),
    (
        "jwt",
        r"eyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}",
        false,
    ),
    (
        "aws_access_key",
        r"\b(?:AKIA|ASIA|AGPA|AIDA|AROA|ANPA)[0-9A-Z]{16}\b",
        false,
    ),
    (
        "bearer_header",
        r"(?i)(authorization:\s*bearer\s+)[^\s*][^\s]*",
        true,
    ),
    ("api_key_header", r"(?i)(x-api-key:\s*)[^\s*][^\s]*", true),
    (
        "url_credential_param",
        r#"(?i)([?&](?:api[_-]?key|token|secret|auth)=)[^&\s"*][^&\s"]*"#,
        true,
    ),
];

fn patterns() -> &'static [SecretPattern] {
    static PATTERNS: OnceLock<Vec<SecretPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        PATTERN_SOURCES
            .iter()
            .filter_map(|&(name, source, keep_prefix)| match Regex::new(source) {
                Ok(regex) => Some(SecretPattern {
                    name,
                    regex,
                    keep_prefix,
                }),
                Err(e) => {
                    tracing::error!(pattern = name, error = %e, "Secret pattern failed to compile");
                    None
                }
            })
            .collect()
    })
}

fn is_sensitive_key(key: &str) -> bool {
    static KEY: OnceLock<Option<Regex>> = OnceLock::new();
    KEY.get_or_init(|| {
        Regex::new(
            r"(?i)^(api[_-]?key|secret|client[_-]?secret|token|access[_-]?token|auth[_-]?token|password|passwd|credentials?|private[_-]?key|access[_-]?key|bearer|authorization)$",
        )
        .ok()
    })
    .as_ref()
    .is_some_and(|re| re.is_match(key))
}

/// Secret redactor: fixed patterns plus optional literal secret values.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    literals: Vec<String>,
}

impl Redactor {
    /// Pattern-only redactor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Redactor that also scrubs the live values of known secret env vars.
    ///
    /// Values shorter than 8 characters are ignored to avoid scrubbing
    /// common words.
    pub fn from_env() -> Self {
        let mut redactor = Self::new();
        for var in SECRET_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                redactor = redactor.with_literal(value);
            }
        }
        redactor
    }

    /// Add a literal secret value.
    pub fn with_literal(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if value.len() >= 8 && !self.literals.contains(&value) {
            self.literals.push(value);
        }
        self
    }

    /// Redact secrets from free text.
    pub fn redact_text(&self, text: &str) -> String {
        let mut result = text.to_string();
        for literal in &self.literals {
            if result.contains(literal.as_str()) {
                result = result.replace(literal.as_str(), REDACTED);
            }
        }
        for pattern in patterns() {
            if !pattern.regex.is_match(&result) {
                continue;
            }
            let replacement = if pattern.keep_prefix {
                format!("${{1}}{REDACTED}")
            } else {
                REDACTED.to_string()
            };
            result = pattern
                .regex
                .replace_all(&result, replacement.as_str())
                .into_owned();
        }
        result
    }

    /// Redact scalar values of a JSON document, leaving keys untouched.
    ///
    /// Fails if the leaf-path set changed or a secret pattern survived.
    pub fn redact_json(&self, value: &Value) -> Result<Value, RedactionError> {
        let redacted = self.redact_value(None, value);

        let before = leaf_paths(value);
        let after = leaf_paths(&redacted);
        if before != after {
            return Err(RedactionError::StructureChanged {
                before: before.len(),
                after: after.len(),
            });
        }
        if let Some(name) = first_secret_in_value(&redacted) {
            return Err(RedactionError::SecretRemains(name));
        }
        Ok(redacted)
    }

    /// Redact a document in the requested mode.
    pub fn redact(&self, content: &str, mode: RedactionMode) -> Result<String, RedactionError> {
        match mode {
            RedactionMode::Text => Ok(self.redact_text(content)),
            RedactionMode::Json => {
                let value: Value = serde_json::from_str(content)?;
                let redacted = self.redact_json(&value)?;
                Ok(serde_json::to_string_pretty(&redacted)?)
            }
        }
    }

    fn redact_value(&self, key: Option<&str>, value: &Value) -> Value {
        let key_is_sensitive = key.is_some_and(is_sensitive_key);
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(Some(k), v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.redact_value(key, item))
                    .collect(),
            ),
            Value::String(s) if key_is_sensitive && !s.is_empty() => {
                Value::String(REDACTED.to_string())
            }
            Value::String(s) => Value::String(self.redact_text(s)),
            other => other.clone(),
        }
    }
}

/// Redact `content` with the pattern-only redactor.
pub fn redact_secrets(content: &str, mode: RedactionMode) -> Result<String, RedactionError> {
    Redactor::new().redact(content, mode)
}

/// Name of the first secret pattern found in `text`, if any.
pub fn find_secret(text: &str) -> Option<&'static str> {
    patterns()
        .iter()
        .find(|p| p.regex.is_match(text))
        .map(|p| p.name)
}

fn first_secret_in_value(value: &Value) -> Option<&'static str> {
    match value {
        Value::String(s) => find_secret(s),
        Value::Array(items) => items.iter().find_map(first_secret_in_value),
        Value::Object(map) => map.values().find_map(first_secret_in_value),
        _ => None,
    }
}

/// Collect every leaf path of a JSON document as a JSON pointer.
///
/// Scalars and empty containers are leaves.
pub fn leaf_paths(value: &Value) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    collect_paths(value, String::new(), &mut paths);
    paths
}

fn collect_paths(value: &Value, prefix: String, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let escaped = k.replace('~', "~0").replace('/', "~1");
                collect_paths(v, format!("{prefix}/{escaped}"), out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                collect_paths(v, format!("{prefix}/{i}"), out);
            }
        }
        _ => {
            out.insert(prefix);
        }
    }
}

/// File names that are always sensitive.
const SENSITIVE_FILENAMES: &[&str] = &[
    ".env",
    ".envrc",
    ".netrc",
    ".npmrc",
    ".pypirc",
    ".pgpass",
    ".git-credentials",
    "credentials",
    "credentials.json",
    "service-account.json",
    "secrets.json",
    "secrets.yaml",
    "secrets.yml",
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
    "known_hosts",
    "authorized_keys",
];

/// Extensions of key and certificate stores.
const SENSITIVE_EXTENSIONS: &[&str] = &[
    "pem", "key", "p12", "pfx", "jks", "keystore", "asc", "gpg", "kdbx", "ppk",
];

/// Whether a file must never be exposed to a backend workspace.
///
/// Matches dotenv variants (`.env`, `.env.local`, `prod.env`), key-file
/// extensions and well-known credential filenames.
pub fn is_sensitive_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();

    if SENSITIVE_FILENAMES.contains(&lower.as_str()) {
        return true;
    }
    if lower.starts_with(".env.") || lower.ends_with(".env") {
        return true;
    }
    if lower.starts_with("id_rsa") || lower.starts_with("id_ed25519") {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SENSITIVE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use review_coordination::multipass::PassBudgets;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "review.config.yaml";

/// Model used when the config names none.
pub const DEFAULT_MODEL: &str = "gpt-5.2";

/// Review behaviour knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReviewSettings {
    /// `false` short-circuits every review to a SKIPPED result.
    pub enabled: bool,
    pub model: String,
    /// Iterations beyond this are auto-approved without calling a backend.
    pub max_iterations: u32,
    /// Caller-side ceiling per backend attempt.
    pub timeout_seconds: u64,
    pub multi_pass: bool,
    #[schemars(skip)]
    pub budgets: PassBudgets,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model: DEFAULT_MODEL.into(),
            max_iterations: 3,
            timeout_seconds: 300,
            multi_pass: true,
            budgets: PassBudgets::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HounfourSettings {
    /// Model-routing CLI, relative to the project root unless absolute.
    pub command: String,
    pub agent: String,
}

impl Default for HounfourSettings {
    fn default() -> Self {
        Self {
            command: ".claude/scripts/model-invoke".into(),
            agent: "reviewing-code".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CodexSettings {
    /// Command line used to launch the agent CLI; split with shell quoting rules.
    pub command: String,
}

impl Default for CodexSettings {
    fn default() -> Self {
        Self {
            command: "codex".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CurlSettings {
    /// OpenAI-compatible base URL; `/chat/completions` is appended.
    pub base_url: String,
}

impl Default for CurlSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BackendSettings {
    pub hounfour: HounfourSettings,
    pub codex: CodexSettings,
    pub curl: CurlSettings,
}

/// Operator-declared route condition, evaluated once per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSpec {
    /// Variable is set and non-empty.
    EnvSet(String),
    /// Variable equals `value` exactly.
    EnvEquals { var: String, value: String },
    /// Command resolves on `PATH`.
    CommandAvailable(String),
}

impl ConditionSpec {
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<String>) -> bool {
        match self {
            Self::EnvSet(var) => lookup(var).is_some_and(|v| !v.is_empty()),
            Self::EnvEquals { var, value } => lookup(var).as_deref() == Some(value.as_str()),
            Self::CommandAvailable(command) => crate::backends::command_available(command),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReviewConfig {
    pub review: ReviewSettings,
    pub backends: BackendSettings,
    /// Extra conditions routes may name in `when`.
    pub conditions: BTreeMap<String, ConditionSpec>,
    /// Operator route table: `{schema_version: 1, routes: [...]}`.
    ///
    /// Kept as raw YAML so a malformed table degrades to the default cascade
    /// instead of failing the whole config load.
    #[schemars(skip)]
    pub route_table: Option<serde_yaml::Value>,
    /// Capability cache root; defaults to the platform cache directory.
    pub cache_dir: Option<PathBuf>,
}

impl ReviewConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("Failed to parse review config")
    }

    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] when it exists.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !explicit && !path.exists() {
            debug!(path = %path.display(), "No review config found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Route table as JSON for the resolver.
    ///
    /// A table that cannot be represented (non-string keys, say) becomes
    /// `null`, which the resolver rejects and replaces with the defaults.
    pub fn route_table_json(&self) -> Option<serde_json::Value> {
        let raw = self.route_table.as_ref()?;
        match serde_json::to_value(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Route table is not representable as JSON");
                Some(serde_json::Value::Null)
            }
        }
    }

    pub fn capability_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("review-agents")
        })
    }
}

//! Route table resolution from environment and file config.
//!
//! Precedence, highest first:
//! 1. Execution-mode override from the environment.
//! 2. A custom table under CI, only with the explicit opt-in flag.
//! 3. The file config's route table.
//! 4. The hardcoded default cascade.
//!
//! The environment is read once into an [`EnvSnapshot`]; everything after
//! that is a pure function of the snapshot and the file config.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use super::registry::{BackendRegistry, ConditionRegistry};
use super::table::{FailMode, ParseReport, Route, RouteSource, RouteTable};
use crate::shell_safety::{validate_name, NameError};

pub const ENV_EXECUTION_MODE: &str = "REVIEW_EXECUTION_MODE";
pub const ENV_MULTI_PASS: &str = "REVIEW_MULTI_PASS";
pub const ENV_ALLOW_CUSTOM_ROUTES: &str = "REVIEW_ALLOW_CUSTOM_ROUTES";

/// Variables whose presence marks a CI run.
const CI_MARKERS: &[&str] = &["CI", "GITHUB_ACTIONS", "GITLAB_CI", "BUILDKITE", "JENKINS_URL"];

/// `auto`, a single backend, or `primary+fallback`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Auto,
    Only(String),
    WithFallback { primary: String, fallback: String },
}

impl ExecutionMode {
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match raw.split_once('+') {
            Some((primary, fallback)) => {
                let (primary, fallback) = (primary.trim(), fallback.trim());
                validate_name(primary)?;
                validate_name(fallback)?;
                Ok(Self::WithFallback {
                    primary: primary.to_string(),
                    fallback: fallback.to_string(),
                })
            }
            None => {
                validate_name(raw)?;
                Ok(Self::Only(raw.to_string()))
            }
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Only(name) => write!(f, "{name}"),
            Self::WithFallback { primary, fallback } => write!(f, "{primary}+{fallback}"),
        }
    }
}

/// Environment overrides captured once per invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    /// Raw execution-mode value, parsed at resolution time.
    pub execution_mode: Option<String>,
    /// Multi-pass kill switch; `None` defers to file config.
    pub multi_pass: Option<bool>,
    pub in_ci: bool,
    pub allow_custom_routes: bool,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            execution_mode: lookup(ENV_EXECUTION_MODE).filter(|v| !v.trim().is_empty()),
            multi_pass: lookup(ENV_MULTI_PASS).and_then(|v| parse_bool_value(&v)),
            in_ci: CI_MARKERS
                .iter()
                .any(|k| lookup(k).is_some_and(|v| !v.is_empty() && v != "0" && v != "false")),
            allow_custom_routes: lookup(ENV_ALLOW_CUSTOM_ROUTES)
                .and_then(|v| parse_bool_value(&v))
                .unwrap_or(false),
        }
    }

    /// Effective multi-pass setting: environment beats file config.
    pub fn multi_pass_enabled(&self, file_setting: bool) -> bool {
        self.multi_pass.unwrap_or(file_setting)
    }
}

/// Parse a boolean flag.
/// Accepts "1", "true", "yes", "on" and their negatives (case-insensitive).
fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Resolve the route table for one invocation.
pub fn resolve_route_table(
    env: &EnvSnapshot,
    file_routes: Option<&Value>,
    backends: &BackendRegistry,
    conditions: &ConditionRegistry,
) -> ParseReport {
    let base = match file_routes {
        None => ParseReport {
            table: RouteTable::default_cascade(),
            dropped: Vec::new(),
            fallback_reason: None,
        },
        Some(_) if env.in_ci && !env.allow_custom_routes => {
            info!(
                flag = ENV_ALLOW_CUSTOM_ROUTES,
                "Custom route table ignored in CI without opt-in"
            );
            ParseReport {
                table: RouteTable::default_cascade(),
                dropped: Vec::new(),
                fallback_reason: None,
            }
        }
        Some(value) => RouteTable::from_value(value, backends, conditions),
    };

    let mode = match env.execution_mode.as_deref().map(ExecutionMode::parse) {
        None => ExecutionMode::Auto,
        Some(Ok(mode)) => mode,
        Some(Err(e)) => {
            error!(error = %e, "Invalid execution mode override; no route is viable");
            return ParseReport {
                table: RouteTable::empty(),
                ..base
            };
        }
    };

    ParseReport {
        table: apply_execution_mode(&base.table, &mode, backends),
        ..base
    }
}

/// Rewrite a table for a forced execution mode.
///
/// A forced backend runs unconditionally with `hard_fail` so its own exit
/// code surfaces. Its timeout and retries are taken from the first route
/// naming it, when there is one. An unregistered name yields an empty
/// table.
pub fn apply_execution_mode(
    table: &RouteTable,
    mode: &ExecutionMode,
    backends: &BackendRegistry,
) -> RouteTable {
    let forced = |name: &str, fail_mode: FailMode| -> Option<Route> {
        if !backends.contains(name) {
            error!(backend = %name, "Execution mode names an unregistered backend");
            return None;
        }
        let mut route = table
            .routes()
            .iter()
            .find(|r| r.backend == name)
            .cloned()
            .unwrap_or_else(|| Route::new(name, fail_mode));
        route.conditions.clear();
        route.fail_mode = fail_mode;
        Some(route)
    };

    match mode {
        ExecutionMode::Auto => table.clone(),
        ExecutionMode::Only(name) => {
            let routes = forced(name, FailMode::HardFail).into_iter().collect();
            RouteTable::new(routes, RouteSource::Override)
        }
        ExecutionMode::WithFallback { primary, fallback } => {
            match (
                forced(primary, FailMode::Fallthrough),
                forced(fallback, FailMode::HardFail),
            ) {
                (Some(p), Some(f)) => RouteTable::new(vec![p, f], RouteSource::Override),
                _ => RouteTable::empty(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendOutput, InvocationRequest};
    use crate::routes::registry::AvailabilityProbes;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Named(&'static str);

    #[async_trait]
    impl Backend for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn invoke(&self, _request: &InvocationRequest) -> BackendOutput {
            BackendOutput::success("{}")
        }
    }

    fn registries() -> (BackendRegistry, ConditionRegistry) {
        let mut backends = BackendRegistry::new();
        for name in ["hounfour", "codex", "curl"] {
            backends.register(Arc::new(Named(name))).unwrap();
        }
        let conditions =
            ConditionRegistry::with_builtins(AvailabilityProbes::fixed(true, true, true), false, false);
        (backends, conditions)
    }

    fn env(vars: &[(&str, &str)]) -> EnvSnapshot {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvSnapshot::from_lookup(|k| map.get(k).cloned())
    }

    fn custom() -> Value {
        json!({"schema_version": 1, "routes": [{"backend": "curl", "fail_mode": "hard_fail", "timeout": 30}]})
    }

    #[test]
    fn test_env_capture() {
        let e = env(&[
            ("REVIEW_EXECUTION_MODE", "codex"),
            ("REVIEW_MULTI_PASS", "off"),
            ("GITHUB_ACTIONS", "true"),
            ("REVIEW_ALLOW_CUSTOM_ROUTES", "YES"),
        ]);
        assert_eq!(e.execution_mode.as_deref(), Some("codex"));
        assert_eq!(e.multi_pass, Some(false));
        assert!(e.in_ci);
        assert!(e.allow_custom_routes);
        assert!(!e.multi_pass_enabled(true));
        assert!(env(&[]).multi_pass_enabled(true));
        assert!(!env(&[("CI", "false")]).in_ci);
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!(ExecutionMode::parse("auto").unwrap(), ExecutionMode::Auto);
        assert_eq!(ExecutionMode::parse("codex").unwrap(), ExecutionMode::Only("codex".into()));
        assert_eq!(
            ExecutionMode::parse("codex + curl").unwrap(),
            ExecutionMode::WithFallback {
                primary: "codex".into(),
                fallback: "curl".into()
            }
        );
        assert!(ExecutionMode::parse("codex;id").is_err());
    }

    #[test]
    fn test_no_file_config_uses_defaults() {
        let (b, c) = registries();
        let report = resolve_route_table(&env(&[]), None, &b, &c);
        assert_eq!(report.table, RouteTable::default_cascade());
    }

    #[test]
    fn test_file_config_honored_outside_ci() {
        let (b, c) = registries();
        let routes = custom();
        let report = resolve_route_table(&env(&[]), Some(&routes), &b, &c);
        assert_eq!(report.table.source(), RouteSource::Config);
        assert_eq!(report.table.routes()[0].backend, "curl");
    }

    #[test]
    fn test_ci_gate() {
        let (b, c) = registries();
        let routes = custom();
        let gated = resolve_route_table(&env(&[("CI", "1")]), Some(&routes), &b, &c);
        assert_eq!(gated.table, RouteTable::default_cascade());

        let opted_in = resolve_route_table(
            &env(&[("CI", "1"), ("REVIEW_ALLOW_CUSTOM_ROUTES", "true")]),
            Some(&routes),
            &b,
            &c,
        );
        assert_eq!(opted_in.table.source(), RouteSource::Config);
    }

    #[test]
    fn test_only_mode_strips_to_hard_fail() {
        let (b, c) = registries();
        let routes = custom();
        let report = resolve_route_table(
            &env(&[("REVIEW_EXECUTION_MODE", "curl")]),
            Some(&routes),
            &b,
            &c,
        );
        let table = report.table;
        assert_eq!(table.source(), RouteSource::Override);
        assert_eq!(table.len(), 1);
        assert_eq!(table.routes()[0].fail_mode, FailMode::HardFail);
        assert_eq!(table.routes()[0].timeout_seconds, 30);
        assert!(table.routes()[0].conditions.is_empty());
    }

    #[test]
    fn test_fallback_pair() {
        let (b, _) = registries();
        let mode = ExecutionMode::parse("codex+curl").unwrap();
        let table = apply_execution_mode(&RouteTable::default_cascade(), &mode, &b);
        let shape: Vec<_> = table
            .routes()
            .iter()
            .map(|r| (r.backend.as_str(), r.fail_mode))
            .collect();
        assert_eq!(
            shape,
            vec![("codex", FailMode::Fallthrough), ("curl", FailMode::HardFail)]
        );
    }

    #[test]
    fn test_unknown_forced_backend_empties_table() {
        let (b, c) = registries();
        let report = resolve_route_table(&env(&[("REVIEW_EXECUTION_MODE", "gemini")]), None, &b, &c);
        assert!(report.table.is_empty());
        let report = resolve_route_table(&env(&[("REVIEW_EXECUTION_MODE", "a|b")]), None, &b, &c);
        assert!(report.table.is_empty());
    }
}

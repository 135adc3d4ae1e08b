//! Declarative route table: parsing and fail-closed validation.
//!
//! ```yaml
//! schema_version: 1
//! routes:
//!   - backend: codex
//!     when: [codex_available]
//!     fail_mode: fallthrough
//!     timeout: 120
//!     retries: 1
//! ```
//!
//! Rules:
//! - `schema_version` other than 1, a non-list `routes`, or more than
//!   [`MAX_ROUTES`] entries reject the whole table to the default cascade.
//! - A bad entry (unsafe or unknown name, bad `fail_mode`, unknown
//!   capability) is dropped with an error log; the rest survive.
//! - If nothing survives, the default cascade is used.
//! - `timeout` and `retries` are clamped, never rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use super::registry::{BackendRegistry, ConditionRegistry};
use crate::backend::Capability;
use crate::error::exit_code;
use crate::shell_safety::{validate_name, NameError};

pub const SCHEMA_VERSION: u64 = 1;
pub const MAX_ROUTES: usize = 20;
pub const TIMEOUT_RANGE: (i64, i64) = (1, 600);
pub const RETRIES_RANGE: (i64, i64) = (0, 5);
pub const DEFAULT_TIMEOUT_SECS: u32 = 300;
pub const DEFAULT_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    #[default]
    Fallthrough,
    HardFail,
}

impl FailMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fallthrough" => Some(Self::Fallthrough),
            "hard_fail" => Some(Self::HardFail),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fallthrough => write!(f, "fallthrough"),
            Self::HardFail => write!(f, "hard_fail"),
        }
    }
}

/// One cascade entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub backend: String,
    /// AND-ed condition names; empty means always eligible.
    pub conditions: Vec<String>,
    pub capability: Option<Capability>,
    pub fail_mode: FailMode,
    pub timeout_seconds: u32,
    pub retries: u32,
}

impl Route {
    pub fn new(backend: impl Into<String>, fail_mode: FailMode) -> Self {
        Self {
            backend: backend.into(),
            conditions: Vec::new(),
            capability: None,
            fail_mode,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn when(mut self, condition: &str) -> Self {
        self.conditions.push(condition.to_string());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = clamp_int(i64::from(retries), RETRIES_RANGE) as u32;
        self
    }

    pub fn timeout(mut self, seconds: u32) -> Self {
        self.timeout_seconds = clamp_int(i64::from(seconds), TIMEOUT_RANGE) as u32;
        self
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }
}

/// Where a table came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Config,
    Default,
    /// Rewritten by an execution-mode override.
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteConfigError {
    #[error("unsupported schema_version {0} (expected 1)")]
    UnsupportedSchemaVersion(String),
    #[error("route config is not a mapping")]
    NotAMapping,
    #[error("`routes` is missing or not a list")]
    RoutesNotAList,
    #[error("{count} routes exceeds the maximum of 20")]
    TooManyRoutes { count: usize },
    #[error("route config contains no routes")]
    NoRoutes,
    #[error("route config is not valid YAML: {0}")]
    InvalidYaml(String),
    #[error("route {index}: entry is not a mapping")]
    EntryNotAMapping { index: usize },
    #[error("route {index}: missing `backend`")]
    MissingBackend { index: usize },
    #[error("route {index}: {source}")]
    UnsafeName { index: usize, source: NameError },
    #[error("route {index}: unknown backend '{name}'")]
    UnknownBackend { index: usize, name: String },
    #[error("route {index}: unknown condition '{name}'")]
    UnknownCondition { index: usize, name: String },
    #[error("route {index}: invalid fail_mode {value}")]
    InvalidFailMode { index: usize, value: String },
    #[error("route {index}: unknown capability {value}")]
    UnknownCapability { index: usize, value: String },
}

impl RouteConfigError {
    pub fn exit_code(&self) -> i32 {
        exit_code::NO_VIABLE_ROUTE
    }

    /// Whether this rejects the whole table rather than one entry.
    pub fn is_table_level(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedSchemaVersion(_)
                | Self::NotAMapping
                | Self::RoutesNotAList
                | Self::TooManyRoutes { .. }
                | Self::NoRoutes
                | Self::InvalidYaml(_)
        )
    }
}

/// Entries that survived validation, plus the ones that did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntries {
    pub routes: Vec<Route>,
    pub dropped: Vec<RouteConfigError>,
}

/// Outcome of parsing with fallback applied.
#[derive(Debug, Clone)]
pub struct ParseReport {
    pub table: RouteTable,
    pub dropped: Vec<RouteConfigError>,
    /// Set when the config was rejected in favor of the default cascade.
    pub fallback_reason: Option<RouteConfigError>,
}

/// Ordered cascade of routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<Route>,
    source: RouteSource,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>, source: RouteSource) -> Self {
        Self { routes, source }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), RouteSource::Override)
    }

    /// hounfour, then codex, then the HTTP fallback.
    pub fn default_cascade() -> Self {
        Self::new(
            vec![
                Route::new("hounfour", FailMode::Fallthrough)
                    .when("hounfour_available")
                    .retries(0),
                Route::new("codex", FailMode::Fallthrough)
                    .when("codex_available")
                    .retries(1),
                Route::new("curl", FailMode::HardFail)
                    .when("api_key_available")
                    .retries(1),
            ],
            RouteSource::Default,
        )
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn source(&self) -> RouteSource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Parse YAML (or JSON) text, falling back to defaults on rejection.
    pub fn parse_str(
        text: &str,
        backends: &BackendRegistry,
        conditions: &ConditionRegistry,
    ) -> ParseReport {
        match serde_yaml::from_str::<Value>(text) {
            Ok(value) => Self::from_value(&value, backends, conditions),
            Err(e) => Self::fallback(RouteConfigError::InvalidYaml(e.to_string()), Vec::new()),
        }
    }

    /// Validate an already-parsed config, falling back to defaults on rejection.
    pub fn from_value(
        value: &Value,
        backends: &BackendRegistry,
        conditions: &ConditionRegistry,
    ) -> ParseReport {
        match parse_entries(value, backends, conditions) {
            Err(e) => Self::fallback(e, Vec::new()),
            Ok(parsed) if parsed.routes.is_empty() => Self::fallback(RouteConfigError::NoRoutes, parsed.dropped),
            Ok(parsed) => ParseReport {
                table: Self::new(parsed.routes, RouteSource::Config),
                dropped: parsed.dropped,
                fallback_reason: None,
            },
        }
    }

    fn fallback(reason: RouteConfigError, dropped: Vec<RouteConfigError>) -> ParseReport {
        warn!(%reason, "Route config rejected, using default cascade");
        ParseReport {
            table: Self::default_cascade(),
            dropped,
            fallback_reason: Some(reason),
        }
    }
}

/// Validate every entry; table-level problems are returned as `Err`.
pub fn parse_entries(
    value: &Value,
    backends: &BackendRegistry,
    conditions: &ConditionRegistry,
) -> Result<ParsedEntries, RouteConfigError> {
    let obj = value.as_object().ok_or(RouteConfigError::NotAMapping)?;

    match obj.get("schema_version") {
        Some(v) if v.as_u64() == Some(SCHEMA_VERSION) => {}
        Some(v) => return Err(RouteConfigError::UnsupportedSchemaVersion(v.to_string())),
        None => return Err(RouteConfigError::UnsupportedSchemaVersion("<missing>".into())),
    }

    let entries = obj
        .get("routes")
        .and_then(Value::as_array)
        .ok_or(RouteConfigError::RoutesNotAList)?;
    if entries.len() > MAX_ROUTES {
        return Err(RouteConfigError::TooManyRoutes {
            count: entries.len(),
        });
    }

    let mut parsed = ParsedEntries {
        routes: Vec::with_capacity(entries.len()),
        dropped: Vec::new(),
    };
    for (index, entry) in entries.iter().enumerate() {
        match parse_route(index, entry, backends, conditions) {
            Ok(route) => parsed.routes.push(route),
            Err(e) => {
                match &e {
                    RouteConfigError::UnsafeName { source, .. } if source.is_injection_attempt() => {
                        error!(index, error = %e, "Dropping route entry: possible injection attempt")
                    }
                    _ => error!(index, error = %e, "Dropping route entry"),
                }
                parsed.dropped.push(e);
            }
        }
    }
    Ok(parsed)
}

fn parse_route(
    index: usize,
    entry: &Value,
    backends: &BackendRegistry,
    conditions: &ConditionRegistry,
) -> Result<Route, RouteConfigError> {
    let obj = entry
        .as_object()
        .ok_or(RouteConfigError::EntryNotAMapping { index })?;

    let backend = obj
        .get("backend")
        .and_then(Value::as_str)
        .ok_or(RouteConfigError::MissingBackend { index })?;
    checked_name(index, backend)?;
    if !backends.contains(backend) {
        return Err(RouteConfigError::UnknownBackend {
            index,
            name: backend.to_string(),
        });
    }

    let names = condition_tokens(obj.get("when"));
    for name in &names {
        checked_name(index, name)?;
        if !conditions.contains(name) {
            return Err(RouteConfigError::UnknownCondition {
                index,
                name: name.clone(),
            });
        }
    }

    let fail_mode = match obj.get("fail_mode") {
        None => FailMode::default(),
        Some(v) => v
            .as_str()
            .and_then(FailMode::parse)
            .ok_or_else(|| RouteConfigError::InvalidFailMode {
                index,
                value: v.to_string(),
            })?,
    };

    let capability = match obj.get("capability") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_str().and_then(Capability::parse).ok_or_else(|| {
            RouteConfigError::UnknownCapability {
                index,
                value: v.to_string(),
            }
        })?),
    };

    Ok(Route {
        backend: backend.to_string(),
        conditions: names,
        capability,
        fail_mode,
        timeout_seconds: clamp_value(obj.get("timeout"), TIMEOUT_RANGE, i64::from(DEFAULT_TIMEOUT_SECS)) as u32,
        retries: clamp_value(obj.get("retries"), RETRIES_RANGE, i64::from(DEFAULT_RETRIES)) as u32,
    })
}

fn checked_name(index: usize, name: &str) -> Result<(), RouteConfigError> {
    validate_name(name).map_err(|source| RouteConfigError::UnsafeName { index, source })
}

/// `when` as a list or a comma-separated string; tokens trimmed, empties dropped.
///
/// Non-string list items are kept in their JSON form so name validation
/// rejects them.
fn condition_tokens(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect(),
        Some(other) => vec![other.to_string()],
    };
    raw.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Clamp an integer into `range` (inclusive).
pub fn clamp_int(x: i64, range: (i64, i64)) -> i64 {
    x.clamp(range.0, range.1)
}

/// Coerce a config value into `range`.
///
/// A missing field takes `default`. Integers clamp; floats truncate toward
/// zero, then clamp (NaN floors to the minimum); numeric strings are parsed;
/// anything else floors to the minimum.
pub fn clamp_value(value: Option<&Value>, range: (i64, i64), default: i64) -> i64 {
    match value {
        None => clamp_int(default, range),
        Some(v) => coerce(v, range),
    }
}

fn coerce(value: &Value, range: (i64, i64)) -> i64 {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                clamp_int(i, range)
            } else if n.as_u64().is_some() {
                range.1
            } else {
                clamp_float(n.as_f64().unwrap_or(f64::NAN), range)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                clamp_int(i, range)
            } else if let Ok(f) = s.parse::<f64>() {
                clamp_float(f, range)
            } else {
                range.0
            }
        }
        _ => range.0,
    }
}

fn clamp_float(f: f64, range: (i64, i64)) -> i64 {
    if f.is_nan() {
        return range.0;
    }
    // Saturating cast: +inf maps to i64::MAX, -inf to i64::MIN.
    clamp_int(f.trunc() as i64, range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendOutput, InvocationRequest};
    use crate::routes::registry::AvailabilityProbes;
    use async_trait::async_trait;
    use serde_json::json;
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

    fn parse(v: Value) -> ParseReport {
        let (b, c) = registries();
        RouteTable::from_value(&v, &b, &c)
    }

    #[test]
    fn test_valid_table() {
        let report = parse(json!({
            "schema_version": 1,
            "routes": [
                {"backend": "codex", "when": ["codex_available"], "fail_mode": "fallthrough", "timeout": 120, "retries": 2},
                {"backend": "curl", "fail_mode": "hard_fail", "capability": "output_file"},
            ]
        }));
        assert!(report.fallback_reason.is_none());
        let routes = report.table.routes();
        assert_eq!(report.table.source(), RouteSource::Config);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].timeout_seconds, 120);
        assert_eq!(routes[0].retries, 2);
        assert_eq!(routes[1].fail_mode, FailMode::HardFail);
        assert_eq!(routes[1].timeout_seconds, DEFAULT_TIMEOUT_SECS);
        assert_eq!(routes[1].retries, DEFAULT_RETRIES);
        assert_eq!(routes[1].capability, Some(Capability::OutputFile));
        assert!(routes[1].conditions.is_empty());
    }

    #[test]
    fn test_yaml_text() {
        let (b, c) = registries();
        let yaml = "schema_version: 1\nroutes:\n  - backend: hounfour\n    when: 'hounfour_available, , always'\n    retries: 0\n";
        let report = RouteTable::parse_str(yaml, &b, &c);
        assert_eq!(report.table.routes()[0].conditions, vec!["hounfour_available", "always"]);
        assert_eq!(report.table.routes()[0].retries, 0);
    }

    #[test]
    fn test_wrong_schema_version_rejects_table() {
        for v in [json!(2), json!("1"), json!(null)] {
            let report = parse(json!({"schema_version": v, "routes": [{"backend": "codex"}]}));
            assert_eq!(report.table, RouteTable::default_cascade());
            assert!(matches!(
                report.fallback_reason,
                Some(RouteConfigError::UnsupportedSchemaVersion(_))
            ));
        }
    }

    #[test]
    fn test_overflow_rejects_table() {
        let routes: Vec<Value> = (0..21).map(|_| json!({"backend": "codex"})).collect();
        let report = parse(json!({"schema_version": 1, "routes": routes}));
        assert_eq!(report.fallback_reason, Some(RouteConfigError::TooManyRoutes { count: 21 }));
        assert_eq!(report.table.source(), RouteSource::Default);
    }

    #[test]
    fn test_bad_entries_dropped_individually() {
        let report = parse(json!({
            "schema_version": 1,
            "routes": [
                {"backend": "unknown"},
                {"backend": "codex", "when": ["no_such_condition"]},
                {"backend": "codex", "fail_mode": "explode"},
                {"backend": "codex", "capability": "telepathy"},
                "curl",
                {"backend": "curl", "fail_mode": "hard_fail"},
            ]
        }));
        assert!(report.fallback_reason.is_none());
        assert_eq!(report.table.len(), 1);
        assert_eq!(report.table.routes()[0].backend, "curl");
        assert_eq!(report.dropped.len(), 5);
    }

    #[test]
    fn test_injection_name_rejected_with_no_entries() {
        let (b, c) = registries();
        let value = json!({"schema_version": 1, "routes": [{"backend": "curl; rm -rf /"}]});
        let parsed = parse_entries(&value, &b, &c).unwrap();
        assert!(parsed.routes.is_empty());
        assert!(matches!(
            &parsed.dropped[0],
            RouteConfigError::UnsafeName { source, .. } if source.is_injection_attempt()
        ));
        let report = RouteTable::from_value(&value, &b, &c);
        assert_eq!(report.table, RouteTable::default_cascade());
    }

    #[test]
    fn test_duplicate_backends_allowed() {
        let report = parse(json!({
            "schema_version": 1,
            "routes": [
                {"backend": "codex", "when": "ci"},
                {"backend": "codex", "when": "always"},
            ]
        }));
        assert_eq!(report.table.len(), 2);
    }

    #[test]
    fn test_clamp_values() {
        let r = TIMEOUT_RANGE;
        assert_eq!(clamp_value(Some(&json!(0)), r, 300), 1);
        assert_eq!(clamp_value(Some(&json!(-50)), r, 300), 1);
        assert_eq!(clamp_value(Some(&json!(99999)), r, 300), 600);
        assert_eq!(clamp_value(Some(&json!(u64::MAX)), r, 300), 600);
        assert_eq!(clamp_value(Some(&json!(12.9)), r, 300), 12);
        assert_eq!(clamp_value(Some(&json!(-0.5)), r, 300), 1);
        assert_eq!(clamp_value(Some(&json!("45")), r, 300), 45);
        assert_eq!(clamp_value(Some(&json!(" 7.5 ")), r, 300), 7);
        assert_eq!(clamp_value(Some(&json!("1e9")), r, 300), 600);
        assert_eq!(clamp_value(Some(&json!("NaN")), r, 300), 1);
        assert_eq!(clamp_value(Some(&json!("ten")), r, 300), 1);
        assert_eq!(clamp_value(Some(&json!(true)), r, 300), 1);
        assert_eq!(clamp_value(Some(&json!([5])), r, 300), 1);
        assert_eq!(clamp_value(Some(&Value::Null), r, 300), 1);
        assert_eq!(clamp_value(None, r, 300), 300);
        assert_eq!(clamp_value(Some(&json!(9)), RETRIES_RANGE, 1), 5);
    }

    #[test]
    fn test_clamp_is_idempotent_and_in_range() {
        let inputs = [
            json!(-1_000_000),
            json!(0),
            json!(1),
            json!(300),
            json!(600),
            json!(601),
            json!(3.99),
            json!("abc"),
            json!("-7"),
            json!({}),
        ];
        for input in inputs {
            let once = clamp_value(Some(&input), TIMEOUT_RANGE, 300);
            assert!((1..=600).contains(&once), "{input} -> {once}");
            assert_eq!(clamp_value(Some(&json!(once)), TIMEOUT_RANGE, 300), once);
        }
    }

    #[test]
    fn test_default_cascade_shape() {
        let table = RouteTable::default_cascade();
        let names: Vec<_> = table.routes().iter().map(|r| r.backend.as_str()).collect();
        assert_eq!(names, vec!["hounfour", "codex", "curl"]);
        assert_eq!(table.routes()[0].retries, 0);
        assert_eq!(table.routes()[2].fail_mode, FailMode::HardFail);
        assert_eq!(table.routes()[2].conditions, vec!["api_key_available"]);
    }
}

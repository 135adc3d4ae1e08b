//! Closed name registries for conditions and backends.
//!
//! Lookups are exact-name only. Names are validated when registered, and an
//! unknown name is an ordinary `None`/`false`, never an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::shell_safety::{validate_name, NameError};

/// Zero-argument predicate gating route eligibility.
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Names reserved for built-in conditions.
pub const BUILTIN_CONDITIONS: [&str; 6] = [
    "always",
    "hounfour_available",
    "codex_available",
    "api_key_available",
    "ci",
    "multi_pass_enabled",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid registry name: {0}")]
    InvalidName(#[from] NameError),
    #[error("'{0}' is a built-in condition and cannot be replaced")]
    ShadowsBuiltin(String),
    #[error("'{0}' is already registered")]
    Duplicate(String),
}

/// Probes backing the availability built-ins.
#[derive(Clone)]
pub struct AvailabilityProbes {
    pub hounfour: Predicate,
    pub codex: Predicate,
    pub api_key: Predicate,
}

impl AvailabilityProbes {
    /// Constant answers, mostly for tests.
    pub fn fixed(hounfour: bool, codex: bool, api_key: bool) -> Self {
        Self {
            hounfour: Arc::new(move || hounfour),
            codex: Arc::new(move || codex),
            api_key: Arc::new(move || api_key),
        }
    }
}

#[derive(Default)]
pub struct ConditionRegistry {
    predicates: BTreeMap<String, Predicate>,
}

impl ConditionRegistry {
    /// Registry holding only the built-ins.
    pub fn with_builtins(probes: AvailabilityProbes, in_ci: bool, multi_pass: bool) -> Self {
        let mut predicates: BTreeMap<String, Predicate> = BTreeMap::new();
        predicates.insert("always".into(), Arc::new(|| true));
        predicates.insert("hounfour_available".into(), probes.hounfour);
        predicates.insert("codex_available".into(), probes.codex);
        predicates.insert("api_key_available".into(), probes.api_key);
        predicates.insert("ci".into(), Arc::new(move || in_ci));
        predicates.insert("multi_pass_enabled".into(), Arc::new(move || multi_pass));
        Self { predicates }
    }

    /// Add an operator-declared condition.
    pub fn register(&mut self, name: &str, predicate: Predicate) -> Result<(), RegistryError> {
        validate_name(name)?;
        if BUILTIN_CONDITIONS.contains(&name) {
            return Err(RegistryError::ShadowsBuiltin(name.to_string()));
        }
        if self.predicates.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.predicates.insert(name.to_string(), predicate);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    /// Evaluate one condition. Unknown names are false.
    pub fn evaluate(&self, name: &str) -> bool {
        self.predicates.get(name).map(|p| p()).unwrap_or(false)
    }

    /// AND of all conditions; an empty list is unconditionally true.
    pub fn evaluate_all(&self, names: &[String]) -> bool {
        names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .all(|n| self.evaluate(n))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(String::as_str)
    }
}

#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the backend's own name.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Result<(), RegistryError> {
        let name = backend.name().to_string();
        validate_name(&name)?;
        if self.backends.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.backends.insert(name, backend);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

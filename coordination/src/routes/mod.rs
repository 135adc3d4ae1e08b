//! Backend route cascade.
//!
//! ```text
//! EnvSnapshot + file config ─▸ resolve ─▸ RouteTable ─▸ cascade::execute ─▸ (ReviewResult?, exit code)
//!                                              │                │
//!                                    registry lookups     RouteMachine per attempt
//! ```

pub mod cascade;
pub mod registry;
pub mod resolve;
pub mod state;
pub mod table;

pub use cascade::{
    execute, CascadeContext, CascadeOptions, CascadeOutcome, ExecutionAttempt, ReviewRequest,
    MAX_TOTAL_ATTEMPTS,
};
pub use registry::{
    AvailabilityProbes, BackendRegistry, ConditionRegistry, Predicate, RegistryError,
    BUILTIN_CONDITIONS,
};
pub use resolve::{apply_execution_mode, resolve_route_table, EnvSnapshot, ExecutionMode};
pub use state::{AttemptEvent, AttemptState, IllegalTransition, RouteMachine, TransitionRecord};
pub use table::{
    clamp_value, parse_entries, FailMode, ParseReport, Route, RouteConfigError, RouteSource,
    RouteTable, MAX_ROUTES,
};

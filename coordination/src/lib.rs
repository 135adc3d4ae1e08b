//! Review Coordination Library
//!
//! The deterministic core of the automated code-review backend:
//! - `routes`: declarative backend cascade with fail-closed parsing,
//!   registries, an explicit attempt state machine and a global attempt cap
//! - `multipass`: planning → review → verification pipeline under token budgets
//! - `normalize` / `contract`: turning raw backend text into a validated review
//! - `redaction`: secret scrubbing for text and JSON with structure checks
//!
//! Concrete backends implement [`backend::Backend`] and live in the agent crate.

pub mod backend;
pub mod contract;
pub mod error;
pub mod multipass;
pub mod normalize;
pub mod redaction;
pub mod routes;
pub mod shell_safety;

pub use backend::{Backend, BackendOutput, Capability, InvocationRequest};
pub use contract::{ReviewResult, Verdict};
pub use error::{exit_code, ErrorClass};

//! Review Agents
//!
//! Concrete backends (model router CLI, agent CLI, direct HTTP), YAML
//! configuration and the review entry point behind the `review-agents`
//! binary. Routing and multi-pass logic live in `review_coordination`.

pub mod backends;
pub mod config;
pub mod review;

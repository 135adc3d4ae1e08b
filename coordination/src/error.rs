//! Error taxonomy and process exit codes.
//!
//! Exit codes are part of the external contract: callers branch on them to
//! tell a crashed backend from one that produced garbage, or a missing
//! credential from an empty route table.

use serde::{Deserialize, Serialize};

/// Process exit codes shared by the cascade, the backends and the binary.
pub mod exit_code {
    /// Review produced and validated.
    pub const SUCCESS: i32 = 0;
    /// Generic backend or output failure (includes timeouts).
    pub const BACKEND_FAILURE: i32 = 1;
    /// Bad input, or no route was viable.
    pub const NO_VIABLE_ROUTE: i32 = 2;
    /// Required credential missing from the environment.
    pub const MISSING_AUTH: i32 = 4;
    /// Backend ran but its output could not be parsed into the contract.
    pub const UNPARSEABLE_OUTPUT: i32 = 5;
}

/// High-level error class, used for logging and degradation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad schema version, unknown name, route-count overflow.
    Config,
    /// Nonzero backend exit or timeout.
    Backend,
    /// Unparseable or contract-violating output.
    Output,
    /// Missing credential.
    Auth,
    /// Content exceeds the token budget even after truncation.
    Budget,
}

impl ErrorClass {
    /// Classify a backend exit code.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            exit_code::SUCCESS => None,
            exit_code::MISSING_AUTH => Some(Self::Auth),
            exit_code::UNPARSEABLE_OUTPUT => Some(Self::Output),
            exit_code::NO_VIABLE_ROUTE => Some(Self::Config),
            _ => Some(Self::Backend),
        }
    }

    /// Whether a failure of this class may be retried on the same route.
    ///
    /// Retrying cannot produce a missing credential or shrink content that
    /// overflowed its budget.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Backend | Self::Output)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config => write!(f, "config_error"),
            Self::Backend => write!(f, "backend_error"),
            Self::Output => write!(f, "output_error"),
            Self::Auth => write!(f, "auth_error"),
            Self::Budget => write!(f, "budget_error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exit_codes() {
        assert_eq!(ErrorClass::from_exit_code(0), None);
        assert_eq!(ErrorClass::from_exit_code(1), Some(ErrorClass::Backend));
        assert_eq!(ErrorClass::from_exit_code(4), Some(ErrorClass::Auth));
        assert_eq!(ErrorClass::from_exit_code(5), Some(ErrorClass::Output));
        assert_eq!(ErrorClass::from_exit_code(137), Some(ErrorClass::Backend));
    }

    #[test]
    fn test_retryable_classes() {
        assert!(!ErrorClass::Auth.is_retryable());
        assert!(!ErrorClass::Budget.is_retryable());
        assert!(!ErrorClass::Config.is_retryable());
        assert!(ErrorClass::Backend.is_retryable());
        assert!(ErrorClass::Output.is_retryable());
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason a test case failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    Timeout,
    RuntimeError,
    AssertionFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Timeout => "timeout",
            FailureReason::RuntimeError => "runtime-error",
            FailureReason::AssertionFailed => "assertion-failed",
        };
        write!(f, "{}", s)
    }
}

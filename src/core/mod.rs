//! Shared data types for execution requests and their results

pub mod context;
pub mod utils;
pub mod verdict;

pub use context::{CorrelationId, DisplayMode, Editor, ExecutionContext, ResumeContext};
pub use verdict::FailureReason;

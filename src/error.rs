//! Error taxonomy for the execution coordinator
//!
//! Runtime errors raised by student code and input exhaustion are not errors
//! here: they are reported as run outcomes. These types cover protocol,
//! channel and lifecycle failures only.

use thiserror::Error;

use crate::engine::coordinator::Phase;

/// A message from the sandbox that could not be understood
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message from sandbox: {0}")]
    Malformed(String),

    #[error("unknown message kind from sandbox: {0}")]
    UnknownKind(String),

    #[error("invalid payload for '{kind}' message: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("rejected file export '{file_name}': {reason}")]
    InvalidFileExport { file_name: String, reason: String },
}

/// Failure of the message channel to the sandbox process
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("failed to encode request: {0}")]
    Encode(String),
}

/// Lifecycle failure reported to callers of the coordinator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinatorError {
    #[error("sandbox is not ready (phase: {phase})")]
    NotReady { phase: Phase },

    #[error("sandbox is busy (phase: {phase})")]
    Busy { phase: Phase },

    #[error("no pending input to provide")]
    NoPendingInput,

    #[error("sandbox failed to load: {0}")]
    SandboxLoad(String),

    #[error("sandbox was reset")]
    Reset,

    #[error("timed out waiting for the sandbox")]
    Timeout,

    #[error("invalid execution context: {0}")]
    InvalidContext(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The sandbox answered a request with a message that could not be decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

//! Sandbox execution engine: wire codec, message channel, process launcher
//! and the coordinator state machine

pub mod channel;
pub mod coordinator;
pub mod launcher;
pub mod protocol;

pub use coordinator::{Coordinator, CoordinatorEvent};
pub use launcher::ProcessLauncher;

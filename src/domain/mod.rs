//! Domain types for shelldeck.
//!
//! This module contains the core data structures:
//! - Action: configured shell templates, arguments and limits
//! - ExecutionRequest: one attempt to run an action
//! - InternalLogEntry: the record of that attempt

pub mod action;
pub mod log_entry;
pub mod request;

// Re-export commonly used types
pub use action::{Action, ActionArgument, ActionBinding, ArgumentChoice, RateSpec, SaveLogs};
pub use log_entry::{InternalLogEntry, EXIT_CODE_NOT_EXECUTED, UNRESOLVED_ACTION_TITLE};
pub use request::{AuthenticatedUser, ExecutionRequest};

//! Core execution logic.
//!
//! This module contains:
//! - Arguments: Placeholder templating and argument type checks
//! - Admission: Concurrency and rate limits
//! - LogStore: Global and per-action execution logs
//! - Listener: Fan-out of execution events
//! - Executor: The request pipeline

pub mod access;
pub mod admission;
pub mod arguments;
pub mod entity;
pub mod executor;
pub mod listener;
pub mod log_store;
pub mod persist;
pub mod steps;

// Re-export commonly used types
pub use access::{AccessPolicy, AllowAll, ConfigAccessPolicy};
pub use admission::{parse_duration, AdmissionViolation};
pub use arguments::{parse_action_arguments, type_safety_check, ArgumentError};
pub use entity::{entity_prefix, EntityVariables};
pub use executor::{ExecutionHandle, Executor};
pub use listener::{ExecutionEvent, ExecutionListener, ListenerHub};
pub use log_store::{LogStore, SharedLogEntry};
pub use persist::{load_log_results, save_log, LogDirectories};
pub use steps::{ExecutionContext, ExecutionStep};

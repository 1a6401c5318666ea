//! shelldeck - Run configured shell actions safely
//!
//! Operators describe a fixed catalog of shell actions in YAML. Each
//! execution request passes through an ordered chain of steps: the action
//! is resolved, admission limits and permissions are checked, caller
//! arguments are type-checked and substituted into the command, and the
//! command runs under a timeout with its output streamed to listeners.
//!
//! # Modules
//!
//! - `adapters`: Process runner (shell wrapper, streaming, timeout, kill)
//! - `core`: Execution pipeline (Executor, admission, templating, logs)
//! - `domain`: Data structures (Action, ExecutionRequest, InternalLogEntry)
//! - `config`: YAML configuration
//! - `watch`: Debounced config file watcher
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run an action
//! shelldeck exec "Ping host" -a host=web1
//!
//! # List configured actions
//! shelldeck actions
//!
//! # Serve JSON requests from stdin
//! shelldeck serve
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod watch;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use core::{ExecutionHandle, ExecutionListener, Executor};
pub use domain::{Action, AuthenticatedUser, ExecutionRequest, InternalLogEntry};

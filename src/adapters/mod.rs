//! Process runner interfaces.
//!
//! The executor only needs two things from the operating system: run a
//! command while streaming its output, and run a short command while
//! capturing stdout and stderr separately. `ShellRunner` does both through
//! the platform shell.

pub mod shell;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// Re-export the shell runner
pub use shell::{argument_env, ShellRunner, LAUNCHED_BY_ENV};

/// Exit code recorded when a process was terminated by a signal
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// Runner failures. These never abort the executor; their text is
/// prepended to the execution's output.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Failed to kill command: {0}")]
    Kill(#[source] std::io::Error),

    #[error("Failed to read command output: {0}")]
    Read(#[source] std::io::Error),
}

/// A fully resolved command ready to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Shell command line
    pub command: String,

    /// Extra environment variables
    pub env: HashMap<String, String>,

    /// Wall-clock limit
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            env: HashMap::new(),
            timeout,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

/// Receives process events while a streaming run is in progress
pub trait ProcessObserver: Send + Sync {
    /// Called once the process is spawned
    fn on_spawn(&self, _pid: Option<u32>) {}

    /// Called for every chunk of stdout or stderr, in arrival order
    fn on_output(&self, chunk: &[u8]);
}

/// Result of a streaming run
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Exit code reported by the OS; `None` when no process ran or it
    /// could not be reaped
    pub exit_code: Option<i32>,

    /// The deadline expired and the process was killed
    pub timed_out: bool,

    /// An operator kill was delivered
    pub killed: bool,

    pub pid: Option<u32>,

    pub errors: Vec<RunnerError>,
}

impl RunOutcome {
    /// Runner error text, one per line
    pub fn error_text(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }

        Some(
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Result of a captured run
#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub error: Option<RunnerError>,
}

/// Runs resolved commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    /// Run a command, forwarding output to the observer as it arrives.
    ///
    /// The process is killed when the deadline expires or when a message
    /// arrives on `kill_rx`. Dropping every sender of `kill_rx` does not
    /// kill the process.
    async fn run_streaming(
        &self,
        spec: &ProcessSpec,
        observer: &dyn ProcessObserver,
        kill_rx: mpsc::UnboundedReceiver<()>,
    ) -> RunOutcome;

    /// Run a command to completion and capture stdout and stderr separately
    async fn run_captured(&self, spec: &ProcessSpec) -> CapturedOutput;
}

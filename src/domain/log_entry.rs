//! Log entries for execution attempts.
//!
//! An `InternalLogEntry` is created for every request at admission time and
//! mutated in place as the request moves through the pipeline. Action title,
//! icon and ID are copied in so entries stay meaningful after the action is
//! changed or removed from configuration.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code of an entry whose command never ran
pub const EXIT_CODE_NOT_EXECUTED: i32 = -1337;

/// Title recorded until the requested action has been resolved
pub const UNRESOLVED_ACTION_TITLE: &str = "notfound";

/// The durable record of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalLogEntry {
    pub datetime_started: DateTime<Utc>,
    pub datetime_finished: Option<DateTime<Utc>>,
    pub output: String,
    pub timed_out: bool,
    pub blocked: bool,
    pub exit_code: i32,
    pub tags: Vec<String>,
    pub execution_started: bool,
    pub execution_finished: bool,
    pub execution_tracking_id: String,

    /// OS process id while the command is live; only used for display,
    /// termination goes through the executor
    #[serde(skip)]
    pub process_id: Option<u32>,

    pub username: String,
    pub action_title: String,
    pub action_icon: String,
    pub action_id: String,
}

impl InternalLogEntry {
    /// Create an entry for a freshly admitted request
    pub fn new(tracking_id: impl Into<String>) -> Self {
        Self {
            datetime_started: Utc::now(),
            datetime_finished: None,
            output: String::new(),
            timed_out: false,
            blocked: false,
            exit_code: EXIT_CODE_NOT_EXECUTED,
            tags: Vec::new(),
            execution_started: false,
            execution_finished: false,
            execution_tracking_id: tracking_id.into(),
            process_id: None,
            username: String::new(),
            action_title: UNRESOLVED_ACTION_TITLE.to_string(),
            action_icon: String::new(),
            action_id: String::new(),
        }
    }

    /// Record a pre-spawn failure: the message becomes the output
    pub fn mark_blocked(&mut self, message: impl Into<String>) {
        self.output = message.into();
        self.blocked = true;
    }

    /// Prepend runner error text so it reads apart from command output
    pub fn prepend_error(&mut self, error: &str) {
        self.output = format!("{}\n\n{}", error, self.output);
    }

    /// Mark the entry finished. The flag is never cleared afterwards.
    pub fn finish(&mut self) {
        self.execution_finished = true;
        if self.datetime_finished.is_none() {
            self.datetime_finished = Some(Utc::now());
        }
    }

    /// Whether a process was actually spawned and returned an exit code
    pub fn was_executed(&self) -> bool {
        self.exit_code != EXIT_CODE_NOT_EXECUTED
    }

    /// Base filename used for persisted snapshots:
    /// `<actionTitle>.<startUnixTimestamp>.<trackingID>`
    pub fn file_stem(&self) -> String {
        format!(
            "{}.{}.{}",
            self.action_title,
            self.datetime_started.timestamp(),
            self.execution_tracking_id
        )
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize log entry")
    }

    /// Parse a YAML snapshot
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse log entry YAML")
    }
}

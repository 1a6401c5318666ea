//! Action definitions.
//!
//! Actions are owned by configuration and never mutated by the execution
//! core. They describe a shell template, its typed arguments, and the
//! limits that gate its execution.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A configured shell action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Stable identifier (derived from the title when not configured)
    #[serde(default)]
    pub id: String,

    /// Human-readable title (also used to look the action up)
    pub title: String,

    /// Icon shown next to the action
    #[serde(default)]
    pub icon: String,

    /// Shell template with `{{ name }}` placeholders
    pub shell: String,

    /// Optional template run after the primary command completes.
    /// Only `output` and `exitCode` are available as placeholders.
    #[serde(default)]
    pub shell_after_completed: String,

    /// Wall-clock timeout in seconds (default: 3)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum number of concurrent executions (default: 1)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Sliding-window rate limits, evaluated in order
    #[serde(default)]
    pub max_rate: Vec<RateSpec>,

    /// Typed arguments accepted by the shell template
    #[serde(default)]
    pub arguments: Vec<ActionArgument>,

    /// Title of an action to submit once this one completes
    #[serde(default)]
    pub trigger: String,

    /// Entity type this action is bound to (one binding per instance)
    #[serde(default)]
    pub entity: String,

    /// Per-action log directories (override the global ones)
    #[serde(default)]
    pub save_logs: SaveLogs,

    /// Access control list names that apply to this action
    #[serde(default)]
    pub acls: Vec<String>,
}

fn default_timeout() -> u64 {
    3
}

fn default_max_concurrent() -> usize {
    1
}

impl Action {
    /// Create an action with defaults for everything but title and shell
    pub fn new(title: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            icon: String::new(),
            shell: shell.into(),
            shell_after_completed: String::new(),
            timeout: default_timeout(),
            max_concurrent: default_max_concurrent(),
            max_rate: Vec::new(),
            arguments: Vec::new(),
            trigger: String::new(),
            entity: String::new(),
            save_logs: SaveLogs::default(),
            acls: Vec::new(),
        }
    }

    /// Find a declared argument by name
    pub fn find_arg(&self, name: &str) -> Option<&ActionArgument> {
        self.arguments.iter().find(|a| a.name == name)
    }

    /// Effective timeout as a duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// A typed argument of an action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionArgument {
    /// Placeholder name used in the shell template
    pub name: String,

    /// Human-readable title
    #[serde(default)]
    pub title: String,

    /// Declared type (`int`, `ascii`, `ascii_identifier`, ...)
    #[serde(default, rename = "type")]
    pub arg_type: String,

    /// Enumerated values; when non-empty, the value must match one exactly
    #[serde(default)]
    pub choices: Vec<ArgumentChoice>,

    /// Default value offered to front ends
    #[serde(default)]
    pub default: String,
}

impl ActionArgument {
    /// Create an argument with a declared type
    pub fn typed(name: impl Into<String>, arg_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg_type: arg_type.into(),
            ..Default::default()
        }
    }

    /// Create an argument restricted to a list of choices
    pub fn with_choices<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            choices: values
                .into_iter()
                .map(|v| {
                    let value = v.into();
                    ArgumentChoice {
                        title: value.clone(),
                        value,
                    }
                })
                .collect(),
            ..Default::default()
        }
    }
}

/// One allowed value of an enumerated argument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentChoice {
    #[serde(default)]
    pub title: String,
    pub value: String,
}

/// A `{limit, duration}` rate rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSpec {
    /// Maximum executions allowed inside the window
    pub limit: i64,

    /// Window size, e.g. `30s`, `5m`, `1h30m`
    pub duration: String,
}

impl RateSpec {
    pub fn new(limit: i64, duration: impl Into<String>) -> Self {
        Self {
            limit,
            duration: duration.into(),
        }
    }
}

/// Directories where finished log entries are written
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveLogs {
    /// YAML snapshot of each log entry
    #[serde(default)]
    pub results_directory: String,

    /// Plain-text output of each execution
    #[serde(default)]
    pub output_directory: String,
}

/// A resolved action together with the entity context it was discovered under
#[derive(Debug, Clone)]
pub struct ActionBinding {
    /// Binding identifier (the action ID, suffixed for entity instances)
    pub id: String,

    /// The bound action
    pub action: Arc<Action>,

    /// Entity prefix (`<entity>.<index>`), empty for plain actions
    pub entity_prefix: String,

    /// Position in configuration order
    pub config_order: usize,
}

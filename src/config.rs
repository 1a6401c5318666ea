//! Configuration for shelldeck.
//!
//! Configuration sources (highest priority first):
//! 1. Explicit path (`--config` or the SHELLDECK_CONFIG environment variable)
//! 2. `config.yaml` in the current directory
//! 3. `<user config dir>/shelldeck/config.yaml`
//!
//! The file lists the action catalog plus global log directories,
//! permissions and entity instances.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::arguments::{is_known_type, placeholder_names};
use crate::domain::{Action, AuthenticatedUser, SaveLogs};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SHELLDECK_CONFIG";

/// Icon given to actions that don't set one
pub const DEFAULT_ICON: &str = "&#x1f600;";

/// Root configuration (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Global log directories, used when an action sets none
    #[serde(default)]
    pub save_logs: SaveLogs,

    #[serde(default)]
    pub default_permissions: Permissions,

    #[serde(default)]
    pub access_control_lists: Vec<AccessControlList>,

    /// Entity instances by entity type
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<BTreeMap<String, serde_yaml::Value>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default = "default_exec")]
    pub exec: bool,
}

fn default_exec() -> bool {
    true
}

impl Default for Permissions {
    fn default() -> Self {
        Self { exec: default_exec() }
    }
}

/// A named list of users and the permissions it grants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessControlList {
    pub name: String,

    #[serde(default)]
    pub match_usernames: Vec<String>,

    #[serde(default)]
    pub match_usergroups: Vec<String>,

    #[serde(default)]
    pub permissions: Permissions,
}

impl AccessControlList {
    pub fn matches(&self, user: &AuthenticatedUser) -> bool {
        self.match_usernames.contains(&user.username)
            || (!user.usergroup.is_empty() && self.match_usergroups.contains(&user.usergroup))
    }
}

impl Config {
    /// Parse configuration from YAML content and fill in defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(content).context("Failed to parse config YAML")?;
        config.sanitize();
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    /// Fill in defaults: derived IDs, icons and argument titles
    pub fn sanitize(&mut self) {
        for action in &mut self.actions {
            if action.id.is_empty() {
                action.id = action_id_from_title(&action.title);
            }

            if action.icon.is_empty() {
                action.icon = DEFAULT_ICON.to_string();
            }

            for arg in &mut action.arguments {
                if arg.title.is_empty() {
                    arg.title = arg.name.clone();
                }
            }
        }
    }

    /// Report configuration problems. None of these stop execution; a bad
    /// definition degrades to blocked requests at runtime.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen_ids = HashSet::new();

        for action in &self.actions {
            if !seen_ids.insert(action.id.as_str()) {
                problems.push(format!("Duplicate action id '{}' ({})", action.id, action.title));
            }

            if action.shell.trim().is_empty() {
                problems.push(format!("Action '{}' has an empty shell command", action.title));
            }

            for arg in &action.arguments {
                if arg.choices.is_empty() && !is_known_type(&arg.arg_type) {
                    problems.push(format!(
                        "Action '{}' argument '{}' has unknown type '{}'",
                        action.title, arg.name, arg.arg_type
                    ));
                }
            }

            for name in placeholder_names(&action.shell) {
                if action.find_arg(&name).is_none() {
                    problems.push(format!(
                        "Action '{}' uses placeholder '{}' with no declared argument",
                        action.title, name
                    ));
                }
            }

            if !action.trigger.is_empty() && self.find_action(&action.trigger).is_none() {
                problems.push(format!(
                    "Action '{}' triggers unknown action '{}'",
                    action.title, action.trigger
                ));
            }

            if !action.entity.is_empty() && !self.entities.contains_key(&action.entity) {
                problems.push(format!(
                    "Action '{}' is bound to unknown entity '{}'",
                    action.title, action.entity
                ));
            }
        }

        problems
    }

    /// Find an action by title
    pub fn find_action(&self, title: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.title == title)
    }

    /// Find an action by ID
    pub fn find_action_by_id(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Entity instances flattened to string properties
    pub fn entity_instances(&self, entity: &str) -> Vec<HashMap<String, String>> {
        self.entities
            .get(entity)
            .map(|instances| {
                instances
                    .iter()
                    .map(|props| {
                        props
                            .iter()
                            .map(|(k, v)| (k.clone(), yaml_value_to_string(v)))
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn yaml_value_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Derive a stable action ID (first 16 hex chars of SHA256 of the title)
pub fn action_id_from_title(title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Find the config file to load
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let local = PathBuf::from("config.yaml");
    if local.exists() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|dir| dir.join("shelldeck").join("config.yaml"))
        .filter(|path| path.exists())
}

/// Resolve and load the configuration
pub fn load_config(explicit: Option<&Path>) -> Result<(Config, PathBuf)> {
    let path = find_config_file(explicit).with_context(|| {
        format!(
            "No config file found. Pass --config, set {}, or create ./config.yaml",
            CONFIG_ENV
        )
    })?;

    let config = Config::from_file(&path)?;
    Ok((config, path))
}

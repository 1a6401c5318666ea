//! Argument templating and type validation.
//!
//! Shell templates contain `{{ name }}` placeholders. Every value is checked
//! against the argument's declared choices or type before it is substituted,
//! which is the only thing standing between caller input and the shell.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{Action, ActionArgument};

use super::entity::EntityVariables;

/// Layout accepted by the `datetime` type
pub const DATETIME_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";

/// Argument type that skips validation entirely
pub const RAW_STRING_TYPE: &str = "very_dangerous_raw_string";

/// Argument validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("Required arg not provided: {0}")]
    NotProvided(String),

    #[error("Action arg not defined: {0}")]
    NotDefined(String),

    #[error("argument value is not one of the predefined choices: {name}")]
    NotAChoice { name: String },

    #[error("invalid argument {name}, doesn't match {arg_type}")]
    TypeMismatch { name: String, arg_type: String },

    #[error("argument type not implemented {0}")]
    TypeNotImplemented(String),

    #[error("invalid argument {name}, not a valid URL: {reason}")]
    InvalidUrl { name: String, reason: String },

    #[error("invalid argument {name}, expected datetime as YYYY-MM-DDTHH:MM:SS")]
    InvalidDatetime { name: String },
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{ *([a-zA-Z0-9_]+) *\}\}").expect("Invalid placeholder regex")
    })
}

/// Regex for the character-class types, `None` for types without one
fn type_regex(arg_type: &str) -> Option<&'static Regex> {
    static INT: OnceLock<Regex> = OnceLock::new();
    static ASCII: OnceLock<Regex> = OnceLock::new();
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    static SENTENCE: OnceLock<Regex> = OnceLock::new();

    let (cell, pattern) = match arg_type {
        "int" => (&INT, r"^[0-9]+$"),
        "ascii" => (&ASCII, r"^[a-zA-Z0-9]+$"),
        "ascii_identifier" => (&IDENTIFIER, r"^[a-zA-Z0-9\-\._]+$"),
        "ascii_sentence" => (&SENTENCE, r"^[a-zA-Z0-9 ,\.]+$"),
        _ => return None,
    };

    Some(cell.get_or_init(|| Regex::new(pattern).expect("Invalid argument type regex")))
}

/// Zero-padded `YYYY-MM-DDTHH:MM:SS`, checked before the calendar is
fn datetime_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{2}$")
            .expect("Invalid datetime regex")
    })
}

/// Names of all placeholders in a template, in order of first appearance
pub fn placeholder_names(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder_regex().captures_iter(template) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Whether a declared type string is one the validator knows
pub fn is_known_type(arg_type: &str) -> bool {
    matches!(arg_type, RAW_STRING_TYPE | "url" | "datetime") || type_regex(arg_type).is_some()
}

/// Substitute caller values into a shell template.
///
/// Each placeholder needs a caller value and a declared argument on the
/// action; the value must pass the argument's choices or type check. After
/// all placeholders are resolved, entity variables are rewritten using the
/// entity prefix.
pub fn parse_action_arguments(
    template: &str,
    values: &HashMap<String, String>,
    action: &Action,
    entity_prefix: &str,
    entities: &EntityVariables,
) -> Result<String, ArgumentError> {
    info!(action_title = %action.title, cmd = %template, "Action parse args - Before");

    let mut command = template.to_string();

    for caps in placeholder_regex().captures_iter(template) {
        let placeholder = &caps[0];
        let name = &caps[1];

        let Some(value) = values.get(name) else {
            return Err(ArgumentError::NotProvided(name.to_string()));
        };

        typecheck_action_argument(name, value, action)?;

        debug!(name, value = %value, "Arg assigned");

        command = command.replace(placeholder, value);
    }

    let command = entities.replace_entity_vars(entity_prefix, &command);

    info!(action_title = %action.title, cmd = %command, "Action parse args - After");

    Ok(command)
}

/// Check one value against the action's declaration for that argument
pub fn typecheck_action_argument(
    name: &str,
    value: &str,
    action: &Action,
) -> Result<(), ArgumentError> {
    let arg = action
        .find_arg(name)
        .ok_or_else(|| ArgumentError::NotDefined(name.to_string()))?;

    if !arg.choices.is_empty() {
        return typecheck_choice(value, arg);
    }

    type_safety_check(name, value, &arg.arg_type)
}

fn typecheck_choice(value: &str, arg: &ActionArgument) -> Result<(), ArgumentError> {
    if arg.choices.iter().any(|c| c.value == value) {
        Ok(())
    } else {
        Err(ArgumentError::NotAChoice {
            name: arg.name.clone(),
        })
    }
}

/// Check that a value matches a declared argument type
pub fn type_safety_check(name: &str, value: &str, arg_type: &str) -> Result<(), ArgumentError> {
    match arg_type {
        RAW_STRING_TYPE => Ok(()),
        "url" => type_safety_check_url(name, value),
        "datetime" => type_safety_check_datetime(name, value),
        _ => type_safety_check_regex(name, value, arg_type),
    }
}

fn type_safety_check_regex(name: &str, value: &str, arg_type: &str) -> Result<(), ArgumentError> {
    let pattern =
        type_regex(arg_type).ok_or_else(|| ArgumentError::TypeNotImplemented(arg_type.to_string()))?;

    if pattern.is_match(value) {
        return Ok(());
    }

    warn!(name, value, arg_type, "Arg type check safety failure");

    Err(ArgumentError::TypeMismatch {
        name: name.to_string(),
        arg_type: arg_type.to_string(),
    })
}

fn type_safety_check_datetime(name: &str, value: &str) -> Result<(), ArgumentError> {
    let invalid = || ArgumentError::InvalidDatetime {
        name: name.to_string(),
    };

    if !datetime_regex().is_match(value) {
        warn!(name, value, "Arg type check safety failure");
        return Err(invalid());
    }

    NaiveDateTime::parse_from_str(value, DATETIME_LAYOUT)
        .map(|_| ())
        .map_err(|_| invalid())
}

/// Accepts an absolute URI, or an absolute path as sent in a request line
fn type_safety_check_url(name: &str, value: &str) -> Result<(), ArgumentError> {
    let invalid = |reason: String| ArgumentError::InvalidUrl {
        name: name.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("empty url".to_string()));
    }

    // The URL parser strips tabs and newlines, so they are rejected up front
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        warn!(name, value, "Arg type check safety failure");
        return Err(invalid("url contains whitespace or control characters".to_string()));
    }

    if value.starts_with('/') {
        return Ok(());
    }

    Url::parse(value).map(|_| ()).map_err(|e| invalid(e.to_string()))
}

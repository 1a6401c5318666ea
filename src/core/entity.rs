//! Entity variable substitution.
//!
//! Actions bound to an entity type are expanded into one binding per entity
//! instance. Each binding carries a prefix `<entity>.<index>`, and templates
//! reference the instance's properties as `{{ <entity>.<key> }}`.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::{Captures, Regex};

fn entity_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{ *([a-zA-Z0-9_]+)\.([a-zA-Z0-9_\.]+) *\}\}")
            .expect("Invalid entity variable regex")
    })
}

/// Build the prefix naming one entity instance
pub fn entity_prefix(entity: &str, index: usize) -> String {
    format!("{}.{}", entity, index)
}

/// Store of entity properties, keyed by `<entity>.<index>.<key>`
#[derive(Debug, Default)]
pub struct EntityVariables {
    values: RwLock<HashMap<String, String>>,
}

impl EntityVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every variable with the given set
    pub fn replace_all(&self, values: HashMap<String, String>) {
        let mut guard = self.values.write().unwrap_or_else(|e| e.into_inner());
        *guard = values;
    }

    /// Set a single property of an entity instance
    pub fn set(&self, prefix: &str, key: &str, value: impl Into<String>) {
        let mut guard = self.values.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(format!("{}.{}", prefix, key), value.into());
    }

    /// Look up a property of an entity instance
    pub fn get(&self, prefix: &str, key: &str) -> Option<String> {
        let guard = self.values.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&format!("{}.{}", prefix, key)).cloned()
    }

    /// Rewrite `{{ <entity>.<key> }}` references using the instance the
    /// prefix names. References to other entity types, unknown keys, and
    /// any reference when the prefix is empty are left verbatim.
    pub fn replace_entity_vars(&self, prefix: &str, text: &str) -> String {
        let Some((entity, _)) = prefix.split_once('.') else {
            return text.to_string();
        };

        let guard = self.values.read().unwrap_or_else(|e| e.into_inner());

        entity_var_regex()
            .replace_all(text, |caps: &Captures| {
                if &caps[1] != entity {
                    return caps[0].to_string();
                }

                guard
                    .get(&format!("{}.{}", prefix, &caps[2]))
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

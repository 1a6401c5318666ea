//! Execution requests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The identity a request was made under
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub username: String,

    #[serde(default)]
    pub usergroup: String,
}

impl AuthenticatedUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            usergroup: String::new(),
        }
    }

    /// The identity used when no front end authenticated the caller
    pub fn guest() -> Self {
        Self::new("guest")
    }
}

/// A single-use request to execute an action.
///
/// Either `binding_id` (a resolved entry of the action map) or
/// `action_title` identifies the action; the binding wins when both are set.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub action_title: String,
    pub binding_id: Option<String>,
    pub arguments: HashMap<String, String>,

    /// Caller-assigned tracking ID; regenerated when empty or already live
    pub tracking_id: String,
    pub tags: Vec<String>,
    pub authenticated_user: AuthenticatedUser,
}

impl ExecutionRequest {
    /// Request an action by title
    pub fn for_title(title: impl Into<String>) -> Self {
        Self {
            action_title: title.into(),
            authenticated_user: AuthenticatedUser::guest(),
            ..Default::default()
        }
    }

    /// Request an entry of the action map by binding ID
    pub fn for_binding(binding_id: impl Into<String>) -> Self {
        Self {
            binding_id: Some(binding_id.into()),
            authenticated_user: AuthenticatedUser::guest(),
            ..Default::default()
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = tracking_id.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_user(mut self, user: AuthenticatedUser) -> Self {
        self.authenticated_user = user;
        self
    }
}

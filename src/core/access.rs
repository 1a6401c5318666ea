//! Authorization oracle.
//!
//! The execution core only asks one yes/no question. `ConfigAccessPolicy`
//! answers it from the `default_permissions` and `access_control_lists`
//! sections of the configuration.

use crate::config::Config;
use crate::domain::{Action, AuthenticatedUser};

/// Decides whether a user may execute an action
pub trait AccessPolicy: Send + Sync {
    fn is_allowed_exec(&self, config: &Config, user: &AuthenticatedUser, action: &Action) -> bool;
}

/// Allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_allowed_exec(&self, _config: &Config, _user: &AuthenticatedUser, _action: &Action) -> bool {
        true
    }
}

/// Evaluates ACLs attached to the action, falling back to the default
/// permissions when none of them match the user
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigAccessPolicy;

impl AccessPolicy for ConfigAccessPolicy {
    fn is_allowed_exec(&self, config: &Config, user: &AuthenticatedUser, action: &Action) -> bool {
        for acl in config
            .access_control_lists
            .iter()
            .filter(|acl| action.acls.contains(&acl.name))
        {
            if acl.matches(user) {
                return acl.permissions.exec;
            }
        }

        config.default_permissions.exec
    }
}

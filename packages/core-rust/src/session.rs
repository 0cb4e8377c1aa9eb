//! Session variable names and the ordered writes a context turns into.
//!
//! The variable names are the contract with the storage-side row policies:
//! a policy reading `current_setting('app.current_org_id')` only works if
//! the binder writes exactly that name. Names are configurable so a
//! deployment can follow its own policy definitions.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::context::ValidatedContext;

/// Custom-setting form `<namespace>.<name>` accepted by engines with
/// namespaced session settings.
static VARIABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_]*\.[a-z_][a-z0-9_]*$")
        .expect("variable name pattern is a valid regex")
});

/// Value written to the bypass variable for service contexts.
pub const BYPASS_ON: &str = "on";
/// Value written to the bypass variable for tenant contexts.
pub const BYPASS_OFF: &str = "off";

/// Errors from building a [`SessionVariables`] set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionVariablesError {
    #[error("session variable name {name:?} must have the form <namespace>.<name>")]
    InvalidName { name: String },
    #[error("session variable name {name:?} is used for more than one field")]
    Duplicate { name: String },
}

/// Names of the engine session variables the row policies read.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionVariables {
    pub org_id: String,
    pub user_id: String,
    pub role: String,
    pub bypass: String,
    pub audit_reason: String,
}

impl Default for SessionVariables {
    fn default() -> Self {
        Self {
            org_id: "app.current_org_id".to_string(),
            user_id: "app.current_user_id".to_string(),
            role: "app.current_role".to_string(),
            bypass: "app.bypass_rls".to_string(),
            audit_reason: "app.audit_reason".to_string(),
        }
    }
}

impl SessionVariables {
    /// Builds a checked set of names.
    ///
    /// # Errors
    ///
    /// Returns [`SessionVariablesError`] if a name is malformed or reused.
    pub fn new(
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        role: impl Into<String>,
        bypass: impl Into<String>,
        audit_reason: impl Into<String>,
    ) -> Result<Self, SessionVariablesError> {
        let vars = Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
            role: role.into(),
            bypass: bypass.into(),
            audit_reason: audit_reason.into(),
        };
        vars.check()?;
        Ok(vars)
    }

    /// Verifies every name is well-formed and distinct. Deserialized sets
    /// should be checked before use.
    ///
    /// # Errors
    ///
    /// Returns [`SessionVariablesError`] if a name is malformed or reused.
    pub fn check(&self) -> Result<(), SessionVariablesError> {
        let mut seen = HashSet::new();
        for name in self.names() {
            if !VARIABLE_NAME.is_match(name) {
                return Err(SessionVariablesError::InvalidName {
                    name: name.to_string(),
                });
            }
            if !seen.insert(name) {
                return Err(SessionVariablesError::Duplicate {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn names(&self) -> [&str; 5] {
        [
            &self.org_id,
            &self.user_id,
            &self.role,
            &self.bypass,
            &self.audit_reason,
        ]
    }
}

/// One transaction-local session write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAssignment<'a> {
    pub name: &'a str,
    pub value: String,
}

/// Ordered session writes for `ctx`.
///
/// Tenant contexts write org, user, role, then clear the bypass flag.
/// Service contexts set the bypass flag, then the audit reason.
#[must_use]
pub fn session_assignments<'a>(
    ctx: &ValidatedContext,
    vars: &'a SessionVariables,
) -> Vec<SessionAssignment<'a>> {
    let assign = |name: &'a str, value: String| SessionAssignment { name, value };
    match ctx {
        ValidatedContext::Tenant {
            org_id,
            user_id,
            role,
        } => vec![
            assign(vars.org_id.as_str(), org_id.hyphenated().to_string()),
            assign(vars.user_id.as_str(), user_id.hyphenated().to_string()),
            assign(vars.role.as_str(), role.as_str().to_string()),
            assign(vars.bypass.as_str(), BYPASS_OFF.to_string()),
        ],
        ValidatedContext::Service { reason } => vec![
            assign(vars.bypass.as_str(), BYPASS_ON.to_string()),
            assign(vars.audit_reason.as_str(), reason.clone()),
        ],
    }
}

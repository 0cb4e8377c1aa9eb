//! Context descriptors: the identity every storage transaction is bound to.
//!
//! A [`ContextDescriptor`] is what callers build from an authenticated request
//! or a background-job identity. It carries raw strings exactly as received and
//! is only usable by the store after [`validate`](crate::validate::validate)
//! turns it into a [`ValidatedContext`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validate::ValidationError;

/// Closed set of tenant roles understood by the row policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Owner-level privilege within an organization.
    Owner,
    /// Member-level privilege within an organization.
    Member,
}

impl Role {
    /// Every role, in privilege order.
    pub const ALL: [Role; 2] = [Role::Owner, Role::Member];

    /// Wire form written into session state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "OWNER",
            Role::Member => "MEMBER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidRole {
                value: s.to_string(),
            })
    }
}

/// Tenant-bound identity as received from the identity subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    /// Organization (tenant) identifier. Must be a lowercase hyphenated UUID.
    pub org_id: String,
    /// Principal identifier. Must be a lowercase hyphenated UUID.
    pub user_id: String,
    /// Role name. Must be one of [`Role::ALL`].
    pub role: String,
}

/// Privileged, non-tenant-bound identity for trusted system-internal work.
///
/// Row isolation is bypassed for the whole transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContext {
    /// Audit justification, typically the job or migration name.
    pub reason: String,
}

/// Identity a single scoped invocation runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextDescriptor {
    Tenant(TenantContext),
    Service(ServiceContext),
}

impl ContextDescriptor {
    /// Builds a tenant descriptor from raw identity fields.
    pub fn tenant(
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self::Tenant(TenantContext {
            org_id: org_id.into(),
            user_id: user_id.into(),
            role: role.into(),
        })
    }

    /// Builds a service descriptor carrying an audit reason.
    pub fn service(reason: impl Into<String>) -> Self {
        Self::Service(ServiceContext {
            reason: reason.into(),
        })
    }
}

/// A descriptor that passed validation. Only [`validate`](crate::validate::validate)
/// constructs one, so holding this type proves the fields are well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedContext {
    Tenant {
        org_id: Uuid,
        user_id: Uuid,
        role: Role,
    },
    Service {
        reason: String,
    },
}

impl ValidatedContext {
    /// Short label used in log fields and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ValidatedContext::Tenant { .. } => "tenant",
            ValidatedContext::Service { .. } => "service",
        }
    }

    /// Whether this context disables row isolation.
    #[must_use]
    pub fn bypasses_isolation(&self) -> bool {
        matches!(self, ValidatedContext::Service { .. })
    }

    /// Organization the context is bound to, if tenant-scoped.
    #[must_use]
    pub fn org_id(&self) -> Option<Uuid> {
        match self {
            ValidatedContext::Tenant { org_id, .. } => Some(*org_id),
            ValidatedContext::Service { .. } => None,
        }
    }
}

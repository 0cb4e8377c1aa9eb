//! Pure validation of context descriptors.
//!
//! Runs before any connection is touched. Nothing here performs I/O, so a
//! rejected descriptor can never reach the storage engine.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::context::{ContextDescriptor, Role, ValidatedContext};

/// Canonical hyphenated lowercase UUID, the form [`Uuid`] renders back. Any
/// accepted identifier is bound byte-for-byte as received. Uppercase, braced,
/// URN and simple forms are rejected.
static IDENTIFIER_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("identifier pattern is a valid regex")
});

/// Identifier field that failed the format check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierField {
    OrgId,
    UserId,
}

impl IdentifierField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierField::OrgId => "org_id",
            IdentifierField::UserId => "user_id",
        }
    }
}

impl fmt::Display for IdentifierField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a descriptor is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("a context descriptor is required for every storage operation")]
    ContextRequired,
    #[error("{field} is not a valid identifier")]
    InvalidIdentifierFormat { field: IdentifierField },
    #[error("role {value:?} is not a recognized role")]
    InvalidRole { value: String },
    #[error("service context requires a non-empty audit reason")]
    MissingAuditReason,
}

/// Validates a descriptor, returning the typed form the store binds.
///
/// Tenant fields are checked in the order org, user, role; the first failure
/// is reported.
///
/// # Errors
///
/// - [`ValidationError::ContextRequired`] if `descriptor` is `None`
/// - [`ValidationError::InvalidIdentifierFormat`] naming the offending field
/// - [`ValidationError::InvalidRole`] for roles outside [`Role::ALL`]
/// - [`ValidationError::MissingAuditReason`] for blank service reasons
pub fn validate(
    descriptor: Option<&ContextDescriptor>,
) -> Result<ValidatedContext, ValidationError> {
    match descriptor.ok_or(ValidationError::ContextRequired)? {
        ContextDescriptor::Tenant(tenant) => {
            let org_id = parse_identifier(&tenant.org_id, IdentifierField::OrgId)?;
            let user_id = parse_identifier(&tenant.user_id, IdentifierField::UserId)?;
            let role = tenant.role.parse::<Role>()?;
            Ok(ValidatedContext::Tenant {
                org_id,
                user_id,
                role,
            })
        }
        ContextDescriptor::Service(service) => {
            if service.reason.trim().is_empty() {
                return Err(ValidationError::MissingAuditReason);
            }
            Ok(ValidatedContext::Service {
                reason: service.reason.clone(),
            })
        }
    }
}

/// Checks `raw` against the identifier format and parses it.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidIdentifierFormat`] naming `field`.
pub fn parse_identifier(raw: &str, field: IdentifierField) -> Result<Uuid, ValidationError> {
    if !IDENTIFIER_FORMAT.is_match(raw) {
        return Err(ValidationError::InvalidIdentifierFormat { field });
    }
    Uuid::try_parse(raw).map_err(|_| ValidationError::InvalidIdentifierFormat { field })
}

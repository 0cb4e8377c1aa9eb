//! Tenant Scope Core — context descriptors, validation, and session variable plans.
//!
//! Everything in this crate is pure: no connections, no clocks, no globals.
//! The store crate consumes these types to bind a transaction to an identity.

pub mod context;
pub mod session;
pub mod validate;

pub use context::{ContextDescriptor, Role, ServiceContext, TenantContext, ValidatedContext};
pub use session::{
    session_assignments, SessionAssignment, SessionVariables, SessionVariablesError, BYPASS_OFF,
    BYPASS_ON,
};
pub use validate::{parse_identifier, validate, IdentifierField, ValidationError};

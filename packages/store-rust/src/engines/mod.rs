//! Storage backends implementing the [`Connection`](crate::connection::Connection) boundary.
//!
//! [`memory`] enforces row isolation in-process and backs tests and local
//! runs. [`postgres`] (feature `postgres`) drives a real database whose row
//! policies read the bound session variables.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryConnection, MemoryEngine, MemoryManager, RowPolicy};
#[cfg(feature = "postgres")]
pub use postgres::PgManager;

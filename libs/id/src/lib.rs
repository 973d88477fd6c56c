//! # corral-id
//!
//! Typed identifiers used across the cluster manager.
//!
//! Two families exist:
//!
//! - IDs the master mints (`FrameworkId`, `SlaveId`, `OfferId`). They use the
//!   `{prefix}_{ulid}` format, e.g. `fw_01HV4Z2WQXKJNM8GPQY6VBKC3D`, so they
//!   sort by creation time and cannot be confused with each other.
//! - IDs a framework chooses (`TaskId`, `ExecutorId`). These are free-form
//!   names scoped to the framework that picked them; only emptiness and
//!   control characters are rejected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

//! # corral-protocol
//!
//! Payloads of the logical messages exchanged between the master, framework
//! schedulers and slaves. Transport is not covered here: every type is plain
//! serde data so a transport can pick its own encoding.
//!
//! ## Task lifecycle
//!
//! ```text
//! STAGING -> STARTING -> RUNNING -> { FINISHED | FAILED | KILLED | LOST }
//! ```
//!
//! Terminal states are reported once per task as far as resource accounting
//! is concerned; duplicates are still delivered so they can be acknowledged.

mod types;

pub use types::*;

/// Opaque payload bytes (task data, framework messages).
pub use bytes::Bytes;

//! Durable storage for framework metadata.
//!
//! The frameworks store only ever reaches its backing storage through the
//! [`FrameworksStorage`] trait, and every call may fail. Two backends exist:
//!
//! - [`MemoryStorage`]: process-local map, for development and tests
//! - [`SqliteStorage`]: a single SQLite table, survives master restarts

mod memory;
mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use corral_id::FrameworkId;
use corral_protocol::FrameworkInfo;
use thiserror::Error;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Errors from storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record for {framework_id}: {reason}")]
    Corrupt {
        framework_id: String,
        reason: String,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Contract of the durable framework store.
#[async_trait]
pub trait FrameworksStorage: Send + Sync + 'static {
    /// Every persisted framework.
    async fn list(&self) -> Result<HashMap<FrameworkId, FrameworkInfo>, StorageError>;

    /// Insert or overwrite one framework.
    async fn persist_add(&self, id: FrameworkId, info: &FrameworkInfo) -> Result<(), StorageError>;

    /// Delete one framework. Deleting an absent framework succeeds.
    async fn persist_remove(&self, id: FrameworkId) -> Result<(), StorageError>;
}

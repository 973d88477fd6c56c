//! SQLite-backed framework storage.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use corral_id::FrameworkId;
use corral_protocol::FrameworkInfo;
use rusqlite::{params, Connection};
use tracing::debug;

use super::{FrameworksStorage, StorageError};

/// One-table SQLite store. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS frameworks (
                framework_id TEXT PRIMARY KEY,
                info TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        debug!("Frameworks schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::Unavailable("connection lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("storage task failed: {e}")))?
    }
}

#[async_trait]
impl FrameworksStorage for SqliteStorage {
    async fn list(&self) -> Result<HashMap<FrameworkId, FrameworkInfo>, StorageError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT framework_id, info FROM frameworks")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, info)| {
                    let framework_id: FrameworkId = id.parse().map_err(|e| StorageError::Corrupt {
                        framework_id: id.clone(),
                        reason: format!("{e}"),
                    })?;
                    let info: FrameworkInfo = serde_json::from_str(&info).map_err(|e| StorageError::Corrupt {
                        framework_id: id.clone(),
                        reason: e.to_string(),
                    })?;
                    Ok((framework_id, info))
                })
                .collect()
        })
        .await
    }

    async fn persist_add(&self, id: FrameworkId, info: &FrameworkInfo) -> Result<(), StorageError> {
        let json = serde_json::to_string(info).map_err(|e| StorageError::Corrupt {
            framework_id: id.to_string(),
            reason: e.to_string(),
        })?;
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO frameworks (framework_id, info, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(framework_id) DO UPDATE SET
                    info = excluded.info,
                    updated_at = excluded.updated_at
                "#,
                params![id.to_string(), json, chrono::Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn persist_remove(&self, id: FrameworkId) -> Result<(), StorageError> {
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM frameworks WHERE framework_id = ?1",
                params![id.to_string()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sqlite_storage_roundtrip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let id = FrameworkId::new();
        let info = FrameworkInfo::new("batch", "alice")
            .with_role("analytics")
            .with_failover_timeout(Duration::from_secs(30));

        storage.persist_add(id, &info).await.unwrap();
        let listed = storage.list().await.unwrap();
        assert_eq!(listed.get(&id), Some(&info));

        let renamed = FrameworkInfo::new("batch-v2", "alice");
        storage.persist_add(id, &renamed).await.unwrap();
        assert_eq!(storage.list().await.unwrap().get(&id), Some(&renamed));

        storage.persist_remove(id).await.unwrap();
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frameworks.db");
        let id = FrameworkId::new();

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage
                .persist_add(id, &FrameworkInfo::new("web", "svc"))
                .await
                .unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert!(storage.list().await.unwrap().contains_key(&id));
    }

    #[tokio::test]
    async fn test_sqlite_storage_reports_corrupt_rows() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .run(|conn| {
                conn.execute(
                    "INSERT INTO frameworks (framework_id, info, updated_at) VALUES ('fw_bad', '{}', 0)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            storage.list().await,
            Err(StorageError::Corrupt { .. })
        ));
    }
}

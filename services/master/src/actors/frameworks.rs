//! Frameworks store actor - cached registry of framework metadata.
//!
//! Keeps an in-memory cache in front of a [`FrameworksStorage`] and supports
//! delayed removal that a later `resurrect` can cancel.
//!
//! - `add` writes through and never needs a valid cache
//! - `remove` and `list` load the cache first when it is not valid, and fail
//!   with [`FrameworksError::Caching`] when that load fails
//! - delayed removal is an `Expire` message this actor schedules to itself,
//!   so a removal timer and a `resurrect` are always processed one after
//!   the other and never race
//!
//! Each `remove` arms a fresh token. When its timer fires, the removal only
//! happens if the entry still carries that token; otherwise the call resolves
//! to `false`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_id::FrameworkId;
use corral_protocol::FrameworkInfo;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle};
use crate::storage::{FrameworksStorage, StorageError};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum FrameworksError {
    /// The cache could not be loaded from storage.
    #[error("Error caching framework infos")]
    Caching(#[source] StorageError),

    #[error("unknown framework {0}")]
    UnknownFramework(FrameworkId),

    /// A durable write or delete failed.
    #[error("framework storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("frameworks store stopped")]
    StoreStopped,
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug)]
pub enum FrameworksMessage {
    Add {
        framework_id: FrameworkId,
        info: FrameworkInfo,
        reply_to: oneshot::Sender<Result<(), FrameworksError>>,
    },

    Remove {
        framework_id: FrameworkId,
        delay: Duration,
        reply_to: oneshot::Sender<Result<bool, FrameworksError>>,
    },

    Resurrect {
        framework_id: FrameworkId,
        reply_to: oneshot::Sender<bool>,
    },

    Exists {
        framework_id: FrameworkId,
        reply_to: oneshot::Sender<bool>,
    },

    List {
        reply_to: oneshot::Sender<Result<HashMap<FrameworkId, FrameworkInfo>, FrameworksError>>,
    },

    /// A delayed removal came due.
    Expire { framework_id: FrameworkId, token: u64 },
}

// =============================================================================
// Actor State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// Never loaded.
    Unloaded,
    Valid,
    /// A load or durable write failed; reload before trusting the cache.
    Invalid,
}

#[derive(Debug)]
struct Entry {
    info: FrameworkInfo,
    /// Token of the removal that currently governs this entry.
    pending_removal: Option<u64>,
}

type RemoveReply = oneshot::Sender<Result<bool, FrameworksError>>;

pub struct FrameworksStore {
    storage: Arc<dyn FrameworksStorage>,
    entries: HashMap<FrameworkId, Entry>,
    cache: CacheState,
    waiters: HashMap<u64, RemoveReply>,
    next_token: u64,
}

impl FrameworksStore {
    pub fn new(storage: Arc<dyn FrameworksStorage>) -> Self {
        Self {
            storage,
            entries: HashMap::new(),
            cache: CacheState::Unloaded,
            waiters: HashMap::new(),
            next_token: 0,
        }
    }

    /// Load the cache from storage unless it is already valid.
    async fn ensure_cache(&mut self) -> Result<(), FrameworksError> {
        if self.cache == CacheState::Valid {
            return Ok(());
        }

        match self.storage.list().await {
            Ok(loaded) => {
                let mut fresh = HashMap::with_capacity(loaded.len());
                for (id, info) in loaded {
                    let pending_removal = self.entries.get(&id).and_then(|e| e.pending_removal);
                    fresh.insert(
                        id,
                        Entry {
                            info,
                            pending_removal,
                        },
                    );
                }
                self.entries = fresh;
                self.cache = CacheState::Valid;
                debug!(count = self.entries.len(), "Framework cache loaded");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to load framework cache");
                self.cache = CacheState::Invalid;
                Err(FrameworksError::Caching(e))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Message Handlers
    // -------------------------------------------------------------------------

    async fn handle_add(
        &mut self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
    ) -> Result<(), FrameworksError> {
        if let Err(e) = self.storage.persist_add(framework_id, &info).await {
            warn!(framework_id = %framework_id, error = %e, "Failed to persist framework");
            self.cache = CacheState::Invalid;
            return Err(e.into());
        }

        self.entries.insert(
            framework_id,
            Entry {
                info,
                pending_removal: None,
            },
        );
        debug!(framework_id = %framework_id, "Framework added");
        Ok(())
    }

    async fn handle_remove(
        &mut self,
        framework_id: FrameworkId,
        delay: Duration,
        reply_to: RemoveReply,
        ctx: &mut ActorContext<FrameworksMessage>,
    ) {
        if let Err(e) = self.ensure_cache().await {
            let _ = reply_to.send(Err(e));
            return;
        }

        let Some(entry) = self.entries.get_mut(&framework_id) else {
            let _ = reply_to.send(Err(FrameworksError::UnknownFramework(framework_id)));
            return;
        };

        let token = self.next_token;
        self.next_token += 1;
        entry.pending_removal = Some(token);
        self.waiters.insert(token, reply_to);

        if delay.is_zero() {
            self.handle_expire(framework_id, token).await;
        } else {
            debug!(
                framework_id = %framework_id,
                delay_ms = delay.as_millis() as u64,
                "Framework removal scheduled"
            );
            ctx.schedule(delay, FrameworksMessage::Expire { framework_id, token });
        }
    }

    async fn handle_expire(&mut self, framework_id: FrameworkId, token: u64) {
        let Some(reply_to) = self.waiters.remove(&token) else {
            return;
        };

        let armed = self
            .entries
            .get(&framework_id)
            .is_some_and(|e| e.pending_removal == Some(token));
        if !armed {
            debug!(framework_id = %framework_id, "Framework removal superseded");
            let _ = reply_to.send(Ok(false));
            return;
        }

        let result = match self.storage.persist_remove(framework_id).await {
            Ok(()) => {
                self.entries.remove(&framework_id);
                info!(framework_id = %framework_id, "Framework removed");
                Ok(true)
            }
            Err(e) => {
                warn!(framework_id = %framework_id, error = %e, "Failed to remove framework");
                if let Some(entry) = self.entries.get_mut(&framework_id) {
                    entry.pending_removal = None;
                }
                self.cache = CacheState::Invalid;
                Err(FrameworksError::Storage(e))
            }
        };
        let _ = reply_to.send(result);
    }

    fn handle_resurrect(&mut self, framework_id: FrameworkId) -> bool {
        match self.entries.get_mut(&framework_id) {
            Some(entry) => {
                if entry.pending_removal.take().is_some() {
                    info!(framework_id = %framework_id, "Framework resurrected");
                }
                true
            }
            None => false,
        }
    }

    async fn handle_list(&mut self) -> Result<HashMap<FrameworkId, FrameworkInfo>, FrameworksError> {
        self.ensure_cache().await?;
        Ok(self
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.info.clone()))
            .collect())
    }
}

#[async_trait]
impl Actor for FrameworksStore {
    type Message = FrameworksMessage;

    fn name(&self) -> &str {
        "frameworks_store"
    }

    async fn handle(
        &mut self,
        msg: FrameworksMessage,
        ctx: &mut ActorContext<FrameworksMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            FrameworksMessage::Add {
                framework_id,
                info,
                reply_to,
            } => {
                let result = self.handle_add(framework_id, info).await;
                let _ = reply_to.send(result);
            }
            FrameworksMessage::Remove {
                framework_id,
                delay,
                reply_to,
            } => {
                self.handle_remove(framework_id, delay, reply_to, ctx).await;
            }
            FrameworksMessage::Resurrect {
                framework_id,
                reply_to,
            } => {
                let _ = reply_to.send(self.handle_resurrect(framework_id));
            }
            FrameworksMessage::Exists {
                framework_id,
                reply_to,
            } => {
                let _ = reply_to.send(self.entries.contains_key(&framework_id));
            }
            FrameworksMessage::List { reply_to } => {
                let _ = reply_to.send(self.handle_list().await);
            }
            FrameworksMessage::Expire {
                framework_id,
                token,
            } => {
                self.handle_expire(framework_id, token).await;
            }
        }
        Ok(true)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Typed client for the frameworks store.
///
/// Every method enqueues its request before returning, so requests issued
/// one after another are applied in that order even if their futures are
/// awaited later or not at all.
#[derive(Debug, Clone)]
pub struct FrameworksStoreHandle {
    handle: ActorHandle<FrameworksMessage>,
}

impl FrameworksStoreHandle {
    pub fn new(handle: ActorHandle<FrameworksMessage>) -> Self {
        Self { handle }
    }

    fn request<T, F>(&self, build: F) -> impl Future<Output = Result<T, FrameworksError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(oneshot::Sender<T>) -> FrameworksMessage,
    {
        let (tx, rx) = oneshot::channel();
        let sent = self.handle.send(build(tx));
        async move {
            sent.map_err(|_| FrameworksError::StoreStopped)?;
            rx.await.map_err(|_| FrameworksError::StoreStopped)
        }
    }

    pub fn add(
        &self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
    ) -> impl Future<Output = Result<(), FrameworksError>> + Send + 'static {
        let reply = self.request(move |reply_to| FrameworksMessage::Add {
            framework_id,
            info,
            reply_to,
        });
        async move { reply.await? }
    }

    /// Resolves once the removal happened (`true`) or was cancelled or
    /// superseded (`false`).
    pub fn remove(
        &self,
        framework_id: FrameworkId,
        delay: Duration,
    ) -> impl Future<Output = Result<bool, FrameworksError>> + Send + 'static {
        let reply = self.request(move |reply_to| FrameworksMessage::Remove {
            framework_id,
            delay,
            reply_to,
        });
        async move { reply.await? }
    }

    pub fn resurrect(
        &self,
        framework_id: FrameworkId,
    ) -> impl Future<Output = Result<bool, FrameworksError>> + Send + 'static {
        self.request(move |reply_to| FrameworksMessage::Resurrect {
            framework_id,
            reply_to,
        })
    }

    pub fn exists(
        &self,
        framework_id: FrameworkId,
    ) -> impl Future<Output = Result<bool, FrameworksError>> + Send + 'static {
        self.request(move |reply_to| FrameworksMessage::Exists {
            framework_id,
            reply_to,
        })
    }

    pub fn list(
        &self,
    ) -> impl Future<Output = Result<HashMap<FrameworkId, FrameworkInfo>, FrameworksError>> + Send + 'static
    {
        let reply = self.request(|reply_to| FrameworksMessage::List { reply_to });
        async move { reply.await? }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::Supervisor;
    use crate::storage::MemoryStorage;
    use tokio::sync::watch;

    fn spawn_store() -> (Supervisor, FrameworksStoreHandle, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(rx);
        let handle = supervisor.spawn(FrameworksStore::new(Arc::new(MemoryStorage::new())));
        (supervisor, FrameworksStoreHandle::new(handle), tx)
    }

    #[tokio::test]
    async fn test_add_then_exists_and_list() {
        let (_sup, store, _tx) = spawn_store();
        let id = FrameworkId::new();
        let info = FrameworkInfo::new("web", "svc");

        assert!(store.list().await.unwrap().is_empty());
        store.add(id, info.clone()).await.unwrap();
        assert!(store.exists(id).await.unwrap());
        assert_eq!(store.list().await.unwrap().get(&id), Some(&info));
    }

    #[tokio::test]
    async fn test_requests_outlive_their_arguments() {
        let (_sup, store, _tx) = spawn_store();
        let id = FrameworkId::new();

        let (added, resurrected, exists) = {
            let framework_id = id;
            let info = FrameworkInfo::new("web", "svc");
            (
                tokio::spawn(store.add(framework_id, info)),
                tokio::spawn(store.resurrect(framework_id)),
                tokio::spawn(store.exists(framework_id)),
            )
        };
        added.await.unwrap().unwrap();
        assert!(resurrected.await.unwrap().unwrap());
        assert!(exists.await.unwrap().unwrap());

        let delay = Duration::ZERO;
        let removed = tokio::spawn(store.remove(id, delay));
        assert!(removed.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_remove_unknown_framework_fails() {
        let (_sup, store, _tx) = spawn_store();
        let id = FrameworkId::new();
        let err = store.remove(id, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, FrameworksError::UnknownFramework(unknown) if unknown == id));
    }

    #[tokio::test]
    async fn test_remove_without_delay_is_immediate() {
        let (_sup, store, _tx) = spawn_store();
        let id = FrameworkId::new();
        store.add(id, FrameworkInfo::new("web", "svc")).await.unwrap();

        assert!(store.remove(id, Duration::ZERO).await.unwrap());
        assert!(!store.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_resurrect_unknown_is_false() {
        let (_sup, store, _tx) = spawn_store();
        assert!(!store.resurrect(FrameworkId::new()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resurrect_cancels_pending_removal() {
        let (_sup, store, _tx) = spawn_store();
        let id = FrameworkId::new();
        store.add(id, FrameworkInfo::new("web", "svc")).await.unwrap();

        let removal = store.remove(id, Duration::from_secs(2));
        assert!(store.resurrect(id).await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!removal.await.unwrap());
        assert!(store.exists(id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_clears_pending_removal() {
        let (_sup, store, _tx) = spawn_store();
        let id = FrameworkId::new();
        store.add(id, FrameworkInfo::new("web", "svc")).await.unwrap();

        let removal = store.remove(id, Duration::from_secs(1));
        store.add(id, FrameworkInfo::new("web-2", "svc")).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!removal.await.unwrap());
        assert_eq!(store.list().await.unwrap()[&id].name, "web-2");
    }

    #[tokio::test]
    async fn test_store_stopped() {
        let (mut sup, store, _tx) = spawn_store();
        sup.stop_all().await;
        assert!(matches!(
            store.exists(FrameworkId::new()).await,
            Err(FrameworksError::StoreStopped)
        ));
    }
}

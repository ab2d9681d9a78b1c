//! Session pool: the bounded registry binding conversations to live engines.
//!
//! The pool is the only place that creates, evicts, or deletes sessions, so a
//! conversation never has more than one engine. Callers work through a
//! [`SessionLease`]; a leased session is in use and is never evicted.
//!
//! Per-conversation transit gates keep creation, eviction, and deletion of
//! one id from interleaving: a conversation being evicted is fully persisted
//! before it can be restored again.

pub mod sweeper;

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::engine::{EngineError, EngineFactory};
use crate::model::ModelDescriptor;
use crate::session::{
    ActorConfig, EngineSeed, RestoredFrom, SessionActor, SessionHandle, SessionInfo,
};
use crate::store::{InitCacheStore, SessionStateStore};
use crate::sync::KeyedGates;

pub use sweeper::spawn_sweeper;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PoolError {
    /// The engine for a new session could not be constructed.
    #[error("engine unavailable for conversation {conversation}: {source}")]
    EngineUnavailable {
        conversation: String,
        #[source]
        source: EngineError,
    },

    /// Every pooled session is in use.
    #[error("all {size} pool slots are in use")]
    Exhausted { size: usize },
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one `cleanup` pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Conversations that were evicted.
    pub evicted: Vec<String>,
    /// Evicted conversations whose state was written to the store.
    pub persisted: usize,
    /// Evicted conversations whose state could not be persisted.
    pub failed: usize,
}

/// Outcome of `store_all`.
#[derive(Debug, Default)]
pub struct StoreReport {
    pub stored: usize,
    /// Errors encountered (conversation id, error message).
    pub errors: Vec<(String, String)>,
}

// ============================================================================
// Entries and leases
// ============================================================================

struct PoolEntry {
    handle: SessionHandle,
    last_access: Instant,
    /// Cloned into every lease; a strong count above one means "in use".
    lease: Arc<()>,
}

impl PoolEntry {
    fn is_leased(&self) -> bool {
        Arc::strong_count(&self.lease) > 1
    }

    fn is_evictable(&self, max_idle: Duration, now: Instant) -> bool {
        !self.is_leased() && now.duration_since(self.last_access) > max_idle
    }
}

/// A session checked out of the pool.
///
/// While any lease for a conversation is alive the pool will not evict it.
#[derive(Debug, Clone)]
pub struct SessionLease {
    handle: SessionHandle,
    _lease: Arc<()>,
}

impl Deref for SessionLease {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Maximum concurrent engine calls for `list()` and `store_all()`.
const FANOUT_CONCURRENCY: usize = 8;

// ============================================================================
// Session Pool
// ============================================================================

/// Bounded registry of engine-backed sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    size: usize,
    persistence: bool,
    factory: Arc<dyn EngineFactory>,
    states: Arc<dyn SessionStateStore>,
    init_caches: Option<Arc<dyn InitCacheStore>>,
    entries: Arc<DashMap<String, PoolEntry>>,
    /// Held while a conversation is being created, evicted, or deleted.
    transit: KeyedGates,
    /// Serializes capacity decisions.
    admission: Arc<Mutex<()>>,
    /// Actor task handles for graceful shutdown.
    task_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionPool {
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn new(
        config: &PoolConfig,
        factory: Arc<dyn EngineFactory>,
        states: Arc<dyn SessionStateStore>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            size: config.size.max(1),
            persistence: config.persistence,
            factory,
            states,
            init_caches: None,
            entries: Arc::new(DashMap::new()),
            transit: KeyedGates::new(),
            admission: Arc::new(Mutex::new(())),
            task_handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Restore new sessions from init caches in `store`.
    pub fn with_init_caches(mut self, store: Arc<dyn InitCacheStore>) -> Self {
        self.init_caches = Some(store);
        self
    }

    /// Persist every session (if persistence is enabled) and stop all actors.
    pub async fn shutdown(&self) {
        info!(sessions = self.entries.len(), "Shutting down session pool");

        if self.persistence {
            let report = self.store_all().await;
            for (id, error) in &report.errors {
                warn!(conversation = %id, error = %error, "Failed to persist session on shutdown");
            }
        }

        if self.shutdown_tx.send(true).is_err() {
            warn!("Failed to send shutdown signal");
        }

        let task_handles = {
            let mut handles = self.task_handles.lock().await;
            std::mem::take(&mut *handles)
        };
        for task_handle in task_handles {
            if let Err(e) = task_handle.await {
                warn!(error = ?e, "Session actor panicked during shutdown");
            }
        }
        self.entries.clear();

        info!("Session pool shutdown complete");
    }

    // ------------------------------------------------------------------------
    // Core API
    // ------------------------------------------------------------------------

    /// Look up a live session, resetting its idle clock.
    pub fn get(&self, id: &str) -> Option<SessionLease> {
        let mut entry = self.entries.get_mut(id)?;
        entry.last_access = Instant::now();
        Some(SessionLease {
            handle: entry.handle.clone(),
            _lease: entry.lease.clone(),
        })
    }

    /// Look up a session, creating or restoring it if it is not live.
    pub async fn get_or_create(
        &self,
        id: &str,
        model: Arc<ModelDescriptor>,
        instruct_mode: bool,
    ) -> Result<SessionLease, PoolError> {
        if let Some(lease) = self.get(id) {
            return Ok(lease);
        }
        self.create_or_restore(id, model, instruct_mode).await
    }

    /// Bring a session for `id` to life.
    ///
    /// The starting context is, in order of preference: the state persisted
    /// for this conversation (when persistence is enabled), the model's init
    /// cache, or an empty context. Unusable blobs are logged and skipped.
    /// Returns the existing session if another task created it first.
    pub async fn create_or_restore(
        &self,
        id: &str,
        model: Arc<ModelDescriptor>,
        instruct_mode: bool,
    ) -> Result<SessionLease, PoolError> {
        let _transit = self.transit.enter(id).await;
        if let Some(lease) = self.get(id) {
            return Ok(lease);
        }

        let _admission = self.admission.lock().await;
        self.make_room().await?;

        let seed = EngineSeed {
            factory: self.factory.clone(),
            model: model.clone(),
            instruct_mode,
            init_caches: self.init_caches.clone(),
        };
        let mut engine =
            seed.create_engine()
                .await
                .map_err(|source| PoolError::EngineUnavailable {
                    conversation: id.to_string(),
                    source,
                })?;

        let mut restored_from = RestoredFrom::Empty;
        if self.persistence {
            match self.states.load(id).await {
                Ok(Some(state)) => match engine.deserialize(&state).await {
                    Ok(()) => restored_from = RestoredFrom::Persisted,
                    Err(e) => {
                        warn!(conversation = %id, error = %e, "Corrupt persisted state, falling back to init cache");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(conversation = %id, error = %e, "Failed to read persisted state");
                }
            }
        }
        if restored_from == RestoredFrom::Empty && seed.restore_init_cache(engine.as_mut()).await {
            restored_from = RestoredFrom::InitCache;
        }

        let (tx, task_handle) = SessionActor::spawn(
            ActorConfig {
                id: id.to_string(),
                seed,
                engine,
                restored_from,
            },
            self.shutdown_rx.clone(),
        );
        let handle = SessionHandle::new(tx, id.to_string(), model.clone(), instruct_mode);
        let lease = Arc::new(());
        let session = SessionLease {
            handle: handle.clone(),
            _lease: lease.clone(),
        };
        self.entries.insert(
            id.to_string(),
            PoolEntry {
                handle,
                last_access: Instant::now(),
                lease,
            },
        );

        {
            let mut guard = self.task_handles.lock().await;
            guard.retain(|h| !h.is_finished());
            guard.push(task_handle);
        }

        info!(
            conversation = %id,
            model = %model.name,
            instruct_mode = instruct_mode,
            restored_from = ?restored_from,
            live = self.entries.len(),
            "Session created"
        );
        Ok(session)
    }

    /// Drop a conversation's session and any persisted state for it.
    ///
    /// The engine is released without persisting. Returns true if a live
    /// session existed.
    pub async fn delete(&self, id: &str) -> bool {
        let _transit = self.transit.enter(id).await;

        let removed = self.entries.remove(id);
        if let Some((_, entry)) = &removed {
            entry.handle.close().await;
        }
        if let Err(e) = self.states.delete(id).await {
            warn!(conversation = %id, error = %e, "Failed to delete persisted state");
        }

        info!(conversation = %id, live = removed.is_some(), "Session deleted");
        removed.is_some()
    }

    /// Evict every unleased session idle for longer than `max_age`.
    ///
    /// Sessions are persisted first when persistence is enabled. Idleness is
    /// re-checked at removal time, so a session touched after the pass began
    /// stays live.
    pub async fn cleanup(&self, max_age: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Instant::now();

        // Collect ids first to avoid holding DashMap refs across await
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_evictable(max_age, now))
            .map(|entry| entry.key().clone())
            .collect();

        for id in candidates {
            // Skip conversations another task is creating or deleting
            let Some(_transit) = self.transit.try_enter(&id) else {
                continue;
            };
            let Some((_, entry)) = self
                .entries
                .remove_if(&id, |_, entry| entry.is_evictable(max_age, Instant::now()))
            else {
                continue;
            };

            match self.release(&id, entry.handle).await {
                Some(true) => report.persisted += 1,
                Some(false) => report.failed += 1,
                None => {}
            }
            report.evicted.push(id);
        }
        self.transit.cleanup_stale(max_age);

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                persisted = report.persisted,
                failed = report.failed,
                live = self.entries.len(),
                "Session sweep complete"
            );
        }
        report
    }

    /// Persist the engine state of every live session.
    pub async fn store_all(&self) -> StoreReport {
        let handles: Vec<SessionHandle> = self
            .entries
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();

        let results: Vec<(String, Result<(), String>)> = stream::iter(handles)
            .map(|handle| async move {
                let result = self.persist(&handle).await;
                (handle.id().to_string(), result)
            })
            .buffer_unordered(FANOUT_CONCURRENCY)
            .collect()
            .await;

        let mut report = StoreReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.stored += 1,
                Err(e) => report.errors.push((id, e)),
            }
        }
        debug!(stored = report.stored, failed = report.errors.len(), "Stored all sessions");
        report
    }

    /// Snapshots of every live session, ordered by conversation id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = self
            .entries
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();

        let mut infos: Vec<SessionInfo> = stream::iter(handles)
            .map(|handle| async move { handle.info().await })
            .buffer_unordered(FANOUT_CONCURRENCY)
            .filter_map(|result| async move { result.ok() })
            .collect()
            .await;
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Evict the least recently used unleased session if the pool is full.
    ///
    /// Callers hold the admission lock.
    async fn make_room(&self) -> Result<(), PoolError> {
        while self.entries.len() >= self.size {
            let mut candidates: Vec<(String, Instant)> = self
                .entries
                .iter()
                .filter(|entry| !entry.is_leased())
                .map(|entry| (entry.key().clone(), entry.last_access))
                .collect();
            candidates.sort_by_key(|(_, last_access)| *last_access);

            let mut evicted = false;
            for (id, _) in candidates {
                let Some(_transit) = self.transit.try_enter(&id) else {
                    continue;
                };
                let Some((_, entry)) = self.entries.remove_if(&id, |_, entry| !entry.is_leased())
                else {
                    continue;
                };
                info!(conversation = %id, "Evicting least recently used session");
                self.release(&id, entry.handle).await;
                evicted = true;
                break;
            }

            if !evicted {
                warn!(size = self.size, "Session pool exhausted");
                return Err(PoolError::Exhausted { size: self.size });
            }
        }
        Ok(())
    }

    /// Persist (if enabled) and close an evicted session.
    ///
    /// Returns `None` when persistence is disabled, otherwise whether the
    /// state was stored.
    async fn release(&self, id: &str, handle: SessionHandle) -> Option<bool> {
        let persisted = if self.persistence {
            match self.persist(&handle).await {
                Ok(()) => Some(true),
                Err(e) => {
                    warn!(conversation = %id, error = %e, "Failed to persist evicted session");
                    Some(false)
                }
            }
        } else {
            None
        };
        handle.close().await;
        debug!(conversation = %id, "Session released");
        persisted
    }

    async fn persist(&self, handle: &SessionHandle) -> Result<(), String> {
        let state = handle.serialize().await.map_err(|e| e.to_string())?;
        self.states
            .save(handle.id(), &state)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::engine::testing::ScriptedFactory;
    use crate::model::test_support::descriptor;
    use crate::store::file::{FileInitCacheStore, FileSessionStateStore};
    use crate::store::{InitCacheKey, StorageResult};

    fn pool_config(size: usize, persistence: bool) -> PoolConfig {
        PoolConfig {
            size,
            persistence,
            ..PoolConfig::default()
        }
    }

    fn create_pool(
        dir: &TempDir,
        factory: &ScriptedFactory,
        size: usize,
        persistence: bool,
    ) -> SessionPool {
        SessionPool::new(
            &pool_config(size, persistence),
            Arc::new(factory.clone()),
            Arc::new(FileSessionStateStore::new(dir.path().join("sessions"))),
        )
    }

    async fn append(lease: &SessionLease, text: &str) {
        let (progress, _rx) = tokio::sync::mpsc::unbounded_channel();
        lease
            .append(
                text.to_string(),
                false,
                progress,
                tokio_util::sync::CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    fn model() -> Arc<ModelDescriptor> {
        Arc::new(descriptor("vicuna"))
    }

    /// File store whose saves take `delay`.
    struct SlowStates {
        inner: FileSessionStateStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl SessionStateStore for SlowStates {
        async fn load(&self, conversation_id: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.load(conversation_id).await
        }

        async fn save(&self, conversation_id: &str, state: &[u8]) -> StorageResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.save(conversation_id, state).await
        }

        async fn delete(&self, conversation_id: &str) -> StorageResult<()> {
            self.inner.delete(conversation_id).await
        }

        async fn list(&self) -> StorageResult<Vec<String>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn get_returns_same_session_until_delete() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = create_pool(&dir, &factory, 2, false);

        assert!(pool.get("c1").is_none());
        let created = pool.get_or_create("c1", model(), false).await.unwrap();
        let a = pool.get("c1").unwrap();
        let b = pool.get_or_create("c1", model(), false).await.unwrap();
        assert!(a.same_session(&created));
        assert!(b.same_session(&created));
        assert_eq!(factory.created(), 1);

        drop((a, b, created));
        assert!(pool.delete("c1").await);
        assert!(pool.get("c1").is_none());
        assert_eq!(factory.live(), 0);
        assert!(!pool.delete("c1").await);
    }

    #[tokio::test]
    async fn engine_failure_surfaces_as_unavailable() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        factory.fail_creates(true);
        let pool = create_pool(&dir, &factory, 2, false);

        let err = pool.create_or_restore("c1", model(), false).await.unwrap_err();
        assert!(matches!(err, PoolError::EngineUnavailable { .. }));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn full_pool_evicts_least_recently_used_idle_session() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = create_pool(&dir, &factory, 2, true);

        let first = pool.get_or_create("old", model(), false).await.unwrap();
        append(&first, "old text\n").await;
        drop(first);
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(pool.get_or_create("recent", model(), false).await.unwrap());

        let _third = pool.get_or_create("new", model(), false).await.unwrap();

        assert!(!pool.contains("old"));
        assert!(pool.contains("recent"));
        assert!(pool.contains("new"));
        assert_eq!(factory.live(), 2);
        // Evicted with persistence on
        assert!(dir.path().join("sessions/old.state").exists());
    }

    #[tokio::test]
    async fn full_pool_of_leased_sessions_is_exhausted() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = create_pool(&dir, &factory, 1, false);

        let _held = pool.get_or_create("busy", model(), false).await.unwrap();
        let err = pool.get_or_create("other", model(), false).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { size: 1 }));
        assert!(pool.contains("busy"));
    }

    #[tokio::test]
    async fn cleanup_evicts_only_idle_unleased_sessions() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = create_pool(&dir, &factory, 4, true);

        drop(pool.get_or_create("idle", model(), false).await.unwrap());
        let _leased = pool.get_or_create("leased", model(), false).await.unwrap();
        drop(pool.get_or_create("touched", model(), false).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(pool.get("touched"));

        let report = pool.cleanup(Duration::from_millis(40)).await;

        assert_eq!(report.evicted, vec!["idle".to_string()]);
        assert_eq!(report.persisted, 1);
        assert!(pool.contains("leased"));
        assert!(pool.contains("touched"));
        assert!(dir.path().join("sessions/idle.state").exists());
    }

    #[tokio::test]
    async fn session_touched_while_sweep_persists_another_survives() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = SessionPool::new(
            &pool_config(4, true),
            Arc::new(factory.clone()),
            Arc::new(SlowStates {
                inner: FileSessionStateStore::new(dir.path().join("sessions")),
                delay: Duration::from_millis(60),
            }),
        );
        drop(pool.get_or_create("c1", model(), false).await.unwrap());
        drop(pool.get_or_create("c2", model(), false).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let sweep = tokio::spawn({
            let pool = pool.clone();
            async move { pool.cleanup(Duration::from_millis(120)).await }
        });

        // The first candidate is out of the map and being persisted
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiting: Vec<&str> = ["c1", "c2"]
            .into_iter()
            .filter(|id| pool.contains(id))
            .collect();
        assert_eq!(waiting.len(), 1);
        let touched = waiting[0];
        drop(pool.get(touched).unwrap());

        let report = sweep.await.unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert_ne!(report.evicted[0], touched);
        assert_eq!(report.persisted, 1);
        assert!(pool.contains(touched));
        assert_eq!(factory.live(), 1);
    }

    #[tokio::test]
    async fn cleanup_without_persistence_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = create_pool(&dir, &factory, 2, false);

        drop(pool.get_or_create("c1", model(), false).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = pool.cleanup(Duration::from_millis(5)).await;

        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.persisted, 0);
        assert!(!dir.path().join("sessions/c1.state").exists());
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test]
    async fn evicted_session_is_restored_with_its_context() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = create_pool(&dir, &factory, 2, true);

        let lease = pool.get_or_create("c1", model(), false).await.unwrap();
        append(&lease, "remember me\n").await;
        drop(lease);
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.cleanup(Duration::ZERO).await;
        assert!(!pool.contains("c1"));

        let restored = pool.get_or_create("c1", model(), false).await.unwrap();
        let info = restored.info().await.unwrap();
        assert_eq!(info.context_fill, "remember me\n".len());
    }

    #[tokio::test]
    async fn new_session_restores_init_cache() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let caches = Arc::new(FileInitCacheStore::new(dir.path().join("cache")));
        caches
            .save(&InitCacheKey::new("vicuna", true), b"SCRIPTED1\npreamble\n")
            .await
            .unwrap();
        let pool = create_pool(&dir, &factory, 2, false).with_init_caches(caches);

        let instruct = pool.get_or_create("a", model(), true).await.unwrap();
        assert_eq!(instruct.info().await.unwrap().context_fill, 9);

        // No freeform cache: empty context, not an error
        let freeform = pool.get_or_create("b", model(), false).await.unwrap();
        assert_eq!(freeform.info().await.unwrap().context_fill, 0);
    }

    #[tokio::test]
    async fn corrupt_persisted_state_falls_back_to_empty_context() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let states = FileSessionStateStore::new(dir.path().join("sessions"));
        states.save("c1", b"not an engine state").await.unwrap();
        let pool = create_pool(&dir, &factory, 2, true);

        let lease = pool.get_or_create("c1", model(), false).await.unwrap();
        assert_eq!(lease.info().await.unwrap().context_fill, 0);
    }

    #[tokio::test]
    async fn shutdown_stores_every_session() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = create_pool(&dir, &factory, 3, true);

        for id in ["a", "b", "c"] {
            let lease = pool.get_or_create(id, model(), false).await.unwrap();
            append(&lease, id).await;
        }
        pool.shutdown().await;

        assert!(pool.is_empty());
        assert_eq!(factory.live(), 0);
        for id in ["a", "b", "c"] {
            assert!(dir.path().join(format!("sessions/{id}.state")).exists());
        }
    }

    #[tokio::test]
    async fn delete_removes_persisted_state() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = create_pool(&dir, &factory, 2, true);

        drop(pool.get_or_create("c1", model(), false).await.unwrap());
        pool.store_all().await;
        assert!(dir.path().join("sessions/c1.state").exists());

        pool.delete("c1").await;
        assert!(!dir.path().join("sessions/c1.state").exists());
    }
}

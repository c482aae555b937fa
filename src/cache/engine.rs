//! Refresh engine: runs policy-driven refreshes against a helpdesk source.
//!
//! Concurrency rules:
//! - Single-flight per [`RefreshKind`]: a caller that finds a refresh of the
//!   same kind already running awaits that run's result instead of starting
//!   another one. The run is a spawned task that frees its slot when it
//!   ends, even if every caller stopped waiting.
//! - Every mutation (full, incremental, thread upsert, disk load) holds one
//!   async write lock, so a full and an incremental refresh never interleave.
//! - The persisted mirror is read at most once per engine, before the first
//!   mutation, so nothing written in memory is later saved over disk state it
//!   never saw.
//! - Fetches complete before the store is touched. A failed or timed out
//!   refresh leaves the cache exactly as it was.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use super::persist::PersistenceStore;
use super::policy::{self, RefreshAction};
use super::store::CacheStore;
use super::{decode_records, ActivityCounts, CacheCounts, CacheStatus, EntityBatch, EntityKind};
use crate::config::MirrorConfig;
use crate::error::{SyncError, SyncResult};
use crate::helpdesk::HelpdeskSource;
use crate::threads::ConversationThread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshKind {
    Full,
    Incremental,
}

/// Engine knobs, usually derived from [`MirrorConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub page_size: u32,
    pub incremental_max_pages: usize,
    pub max_cache_age: chrono::Duration,
    pub refresh_timeout: Duration,
    pub incremental_upsert: bool,
}

impl EngineSettings {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            page_size: config.page_size,
            incremental_max_pages: config.incremental_max_pages,
            max_cache_age: config.max_cache_age(),
            refresh_timeout: config.refresh_timeout(),
            incremental_upsert: config.incremental_upsert,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&MirrorConfig::default())
    }
}

/// What a refresh call ended up doing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub action: RefreshAction,
    pub counts: CacheCounts,
    /// New records per kind (incremental only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<CacheCounts>,
    /// The incremental refresh failed and a full refresh ran instead.
    pub fell_back_to_full: bool,
    /// False when the disk write failed (or nothing needed writing).
    pub persisted: bool,
    pub completed_at: DateTime<Utc>,
}

type SharedRefresh = Shared<BoxFuture<'static, SyncResult<RefreshOutcome>>>;

struct InFlight {
    generation: u64,
    future: SharedRefresh,
}

struct EngineInner {
    source: Arc<dyn HelpdeskSource>,
    store: Arc<CacheStore>,
    persistence: PersistenceStore,
    settings: EngineSettings,
    write_lock: tokio::sync::Mutex<()>,
    inflight: Mutex<HashMap<RefreshKind, InFlight>>,
    next_generation: AtomicU64,
    loaded: AtomicBool,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn HelpdeskSource>,
        store: Arc<CacheStore>,
        persistence: PersistenceStore,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                source,
                store,
                persistence,
                settings,
                write_lock: tokio::sync::Mutex::new(()),
                inflight: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                loaded: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn source(&self) -> &Arc<dyn HelpdeskSource> {
        &self.inner.source
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn is_refreshing(&self) -> bool {
        !self.inner.inflight.lock().is_empty()
    }

    pub fn status(&self) -> CacheStatus {
        let mut status = self.inner.store.get_status();
        status.refresh_in_progress = self.is_refreshing();
        status
    }

    /// Populate the store from disk on first use. Returns true if anything was loaded.
    ///
    /// Unreadable files are logged and treated as a cold start.
    pub async fn load_from_disk(&self) -> bool {
        if self.inner.loaded.load(Ordering::Acquire) {
            return false;
        }
        let _guard = self.inner.write_lock.lock().await;
        self.load_locked()
    }

    /// Caller holds the write lock.
    fn load_locked(&self) -> bool {
        if self.inner.loaded.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.inner.persistence.load() {
            Ok(Some((snapshot, metadata))) => {
                self.inner.store.restore(snapshot, metadata);
                true
            }
            Ok(None) => {
                log::info!("Sync engine: no persisted mirror, starting cold");
                false
            }
            Err(e) => {
                log::warn!("Sync engine: failed to load persisted mirror, starting cold: {}", e);
                false
            }
        }
    }

    /// Bring the cache up to date according to the refresh policy.
    pub async fn ensure_fresh(&self) -> SyncResult<RefreshOutcome> {
        self.load_from_disk().await;

        let metadata = self.inner.store.metadata();
        let decision = policy::decide(
            self.inner.source.as_ref(),
            &metadata,
            Utc::now(),
            self.inner.settings.max_cache_age,
        )
        .await;
        log::debug!("Sync engine: policy decided {:?}", decision);

        match decision.action {
            RefreshAction::None => Ok(RefreshOutcome {
                action: RefreshAction::None,
                counts: self.inner.store.get().counts(),
                added: None,
                fell_back_to_full: false,
                persisted: false,
                completed_at: Utc::now(),
            }),
            RefreshAction::Incremental => self.run(RefreshKind::Incremental, decision.observed).await,
            RefreshAction::Full => self.run(RefreshKind::Full, None).await,
        }
    }

    pub async fn force_full_refresh(&self) -> SyncResult<RefreshOutcome> {
        self.run(RefreshKind::Full, None).await
    }

    pub async fn refresh_incremental(&self) -> SyncResult<RefreshOutcome> {
        self.run(RefreshKind::Incremental, None).await
    }

    /// Store built threads and write `threads.json`. Returns how many were stored.
    pub async fn store_threads(&self, threads: Vec<ConversationThread>) -> usize {
        if threads.is_empty() {
            return 0;
        }
        let _guard = self.inner.write_lock.lock().await;
        self.load_locked();
        let stored = self.inner.store.upsert_threads(threads);
        if let Err(e) = self
            .inner
            .persistence
            .save_threads(&self.inner.store.get().threads)
        {
            log::warn!("Sync engine: failed to persist threads: {}", e);
        }
        stored
    }

    /// Join the in-flight refresh of `kind`, or start one.
    async fn run(
        &self,
        kind: RefreshKind,
        observed: Option<ActivityCounts>,
    ) -> SyncResult<RefreshOutcome> {
        let future = {
            let mut inflight = self.inner.inflight.lock();
            match inflight.get(&kind) {
                Some(existing) => {
                    log::debug!("Sync engine: joining in-flight {:?} refresh", kind);
                    existing.future.clone()
                }
                None => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let engine = self.clone();
                    let task = tokio::spawn(async move {
                        let result = engine.execute(kind, observed).await;
                        engine.release(kind, generation);
                        result
                    });
                    let engine = self.clone();
                    let future = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => {
                                engine.release(kind, generation);
                                Err(SyncError::Transport(format!(
                                    "{:?} refresh task aborted: {}",
                                    kind, e
                                )))
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    inflight.insert(
                        kind,
                        InFlight {
                            generation,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    /// Free the slot of `kind` if it still belongs to run `generation`.
    fn release(&self, kind: RefreshKind, generation: u64) {
        let mut inflight = self.inner.inflight.lock();
        if inflight
            .get(&kind)
            .is_some_and(|slot| slot.generation == generation)
        {
            inflight.remove(&kind);
        }
    }

    async fn execute(
        &self,
        kind: RefreshKind,
        observed: Option<ActivityCounts>,
    ) -> SyncResult<RefreshOutcome> {
        let _guard = self.inner.write_lock.lock().await;
        self.load_locked();
        let limit = self.inner.settings.refresh_timeout;

        let work = async {
            match kind {
                RefreshKind::Full => self.full_refresh().await,
                RefreshKind::Incremental => match self.incremental_refresh(observed).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        log::warn!(
                            "Sync engine: incremental refresh failed, falling back to full: {}",
                            e
                        );
                        let mut outcome = self.full_refresh().await?;
                        outcome.fell_back_to_full = true;
                        Ok(outcome)
                    }
                },
            }
        };

        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "Sync engine: {:?} refresh exceeded {:?}, cache left untouched",
                    kind,
                    limit
                );
                Err(SyncError::Timeout(limit.as_secs()))
            }
        }
    }

    async fn fetch_batch(&self, max_pages: Option<usize>) -> SyncResult<EntityBatch> {
        let (contacts, companies, admins, conversations) = tokio::try_join!(
            self.fetch_kind(EntityKind::Contacts, max_pages),
            self.fetch_kind(EntityKind::Companies, max_pages),
            self.fetch_kind(EntityKind::Admins, max_pages),
            self.fetch_kind(EntityKind::Conversations, max_pages),
        )?;

        Ok(EntityBatch {
            contacts: decode_records(EntityKind::Contacts, contacts),
            companies: decode_records(EntityKind::Companies, companies),
            admins: decode_records(EntityKind::Admins, admins),
            conversations: decode_records(EntityKind::Conversations, conversations),
        })
    }

    async fn fetch_kind(&self, kind: EntityKind, max_pages: Option<usize>) -> SyncResult<Vec<Value>> {
        let path = kind.list_path(self.inner.settings.page_size);
        let records = self
            .inner
            .source
            .fetch_pages(&path, kind.array_keys(), max_pages)
            .await?;
        log::debug!("Sync engine: fetched {} {}", records.len(), kind);
        Ok(records)
    }

    async fn full_refresh(&self) -> SyncResult<RefreshOutcome> {
        log::info!("Sync engine: starting full refresh");
        let batch = self.fetch_batch(None).await?;

        let now = Utc::now();
        let counts = self.inner.store.apply_full_refresh(batch, now);
        let persisted = self.persist();
        log::info!(
            "Sync engine: full refresh complete ({} contacts, {} companies, {} admins, {} conversations)",
            counts.contacts,
            counts.companies,
            counts.admins,
            counts.conversations
        );

        Ok(RefreshOutcome {
            action: RefreshAction::Full,
            counts,
            added: None,
            fell_back_to_full: false,
            persisted,
            completed_at: now,
        })
    }

    async fn incremental_refresh(
        &self,
        observed: Option<ActivityCounts>,
    ) -> SyncResult<RefreshOutcome> {
        log::info!("Sync engine: starting incremental refresh");
        let batch = self
            .fetch_batch(Some(self.inner.settings.incremental_max_pages))
            .await?;

        let now = Utc::now();
        let report = self.inner.store.apply_incremental_merge(
            batch,
            observed,
            self.inner.settings.incremental_upsert,
            now,
        );
        let persisted = self.persist();
        log::info!(
            "Sync engine: incremental refresh added {} records, updated {}",
            report.added.total(),
            report.updated
        );

        Ok(RefreshOutcome {
            action: RefreshAction::Incremental,
            counts: self.inner.store.get().counts(),
            added: Some(report.added),
            fell_back_to_full: false,
            persisted,
            completed_at: now,
        })
    }

    /// Write the current state to disk. Failures are logged, never raised.
    fn persist(&self) -> bool {
        let snapshot = self.inner.store.get();
        let metadata = self.inner.store.metadata();
        match self.inner.persistence.save(&snapshot, &metadata) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Sync engine: refresh applied in memory but not persisted: {}", e);
                false
            }
        }
    }
}

//! In-memory cache store.
//!
//! Readers get an `Arc<CacheSnapshot>` cloned under a short read lock and
//! never wait on a refresh. Writers build a new snapshot and swap it in.
//! Callers are expected to serialize writers (the engine's write lock does).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::{
    ActivityCounts, CacheCounts, CacheMetadata, CacheSnapshot, CacheStatus, Entity, EntityBatch,
};
use crate::threads::ConversationThread;

/// What an incremental merge changed, per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub added: CacheCounts,
    /// Existing records replaced in upsert mode (always 0 in append-only mode).
    pub updated: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    snapshot: Arc<CacheSnapshot>,
    metadata: CacheMetadata,
}

#[derive(Debug)]
pub struct CacheStore {
    state: RwLock<StoreState>,
    stale_after: chrono::Duration,
}

impl CacheStore {
    pub fn new(stale_after: chrono::Duration) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            stale_after,
        }
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn get(&self) -> Arc<CacheSnapshot> {
        self.state.read().snapshot.clone()
    }

    pub fn metadata(&self) -> CacheMetadata {
        self.state.read().metadata.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().snapshot.is_empty()
    }

    pub fn get_status(&self) -> CacheStatus {
        self.status_at(Utc::now())
    }

    /// Status as seen at `now`. `isStale` is presentation only: the refresh
    /// policy uses its own, longer ceiling.
    pub fn status_at(&self, now: DateTime<Utc>) -> CacheStatus {
        let state = self.state.read();
        let last_refreshed = state.snapshot.last_refreshed;
        let age = last_refreshed.map(|at| now - at);
        CacheStatus {
            last_refreshed,
            counts: state.snapshot.counts(),
            metadata: state.metadata.clone(),
            age_minutes: age.map(|a| a.num_minutes()),
            is_stale: age.map_or(true, |a| a > self.stale_after),
            thread_count: state.snapshot.threads.len(),
            refresh_in_progress: false,
        }
    }

    /// Replace every collection with a freshly fetched generation.
    ///
    /// The only operation that sets `lastFullRefresh` and the only one that
    /// may shrink a collection. Materialized threads are kept.
    pub fn apply_full_refresh(&self, batch: EntityBatch, now: DateTime<Utc>) -> CacheCounts {
        let mut state = self.state.write();

        let snapshot = CacheSnapshot {
            contacts: dedup_by_id(batch.contacts),
            companies: dedup_by_id(batch.companies),
            admins: dedup_by_id(batch.admins),
            conversations: dedup_by_id(batch.conversations),
            last_refreshed: Some(now),
            threads: state.snapshot.threads.clone(),
        };
        let counts = snapshot.counts();

        state.metadata.last_full_refresh = Some(now);
        state.metadata.last_activity = ActivityCounts {
            contacts: counts.contacts as u64,
            companies: counts.companies as u64,
            conversations: counts.conversations as u64,
        };
        state.metadata.cache_counts = counts;
        state.snapshot = Arc::new(snapshot);

        counts
    }

    /// Merge a page-limited sample into the existing collections.
    ///
    /// Unseen ids are appended. Ids already cached keep the cached record
    /// unless `upsert` is set. Collections never shrink.
    /// `observed` is the probe result, when one succeeded.
    pub fn apply_incremental_merge(
        &self,
        batch: EntityBatch,
        observed: Option<ActivityCounts>,
        upsert: bool,
        now: DateTime<Utc>,
    ) -> MergeReport {
        let mut state = self.state.write();
        let current = state.snapshot.clone();

        let (contacts, added_contacts, updated_contacts) =
            merge_by_id(&current.contacts, batch.contacts, upsert);
        let (companies, added_companies, updated_companies) =
            merge_by_id(&current.companies, batch.companies, upsert);
        let (admins, added_admins, updated_admins) =
            merge_by_id(&current.admins, batch.admins, upsert);
        let (conversations, added_conversations, updated_conversations) =
            merge_by_id(&current.conversations, batch.conversations, upsert);

        let snapshot = CacheSnapshot {
            contacts,
            companies,
            admins,
            conversations,
            last_refreshed: Some(now),
            threads: current.threads.clone(),
        };
        let counts = snapshot.counts();

        let merged_activity = ActivityCounts {
            contacts: counts.contacts as u64,
            companies: counts.companies as u64,
            conversations: counts.conversations as u64,
        };
        let seen = observed.unwrap_or(merged_activity);
        state.metadata.last_activity = state.metadata.last_activity.max(&seen);
        state.metadata.cache_counts = counts;
        state.snapshot = Arc::new(snapshot);

        MergeReport {
            added: CacheCounts {
                contacts: added_contacts,
                companies: added_companies,
                admins: added_admins,
                conversations: added_conversations,
            },
            updated: updated_contacts + updated_companies + updated_admins + updated_conversations,
        }
    }

    /// Insert or replace materialized threads, keyed by conversation id.
    pub fn upsert_threads(&self, threads: Vec<ConversationThread>) -> usize {
        if threads.is_empty() {
            return 0;
        }
        let mut state = self.state.write();
        let mut snapshot = (*state.snapshot).clone();
        let count = threads.len();
        for thread in threads {
            snapshot
                .threads
                .insert(thread.conversation_id.clone(), thread);
        }
        state.snapshot = Arc::new(snapshot);
        count
    }

    /// Replace the whole state with a persisted copy.
    pub fn restore(&self, snapshot: CacheSnapshot, metadata: CacheMetadata) {
        let mut state = self.state.write();
        state.snapshot = Arc::new(snapshot);
        state.metadata = metadata;
    }
}

/// Keep the first record for each id.
fn dedup_by_id<T: Entity>(records: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.id().to_string()))
        .collect()
}

/// Returns (merged, added, updated).
fn merge_by_id<T: Entity + Clone>(
    existing: &[T],
    incoming: Vec<T>,
    upsert: bool,
) -> (Vec<T>, usize, usize) {
    let mut merged: Vec<T> = existing.to_vec();
    let mut index: std::collections::HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id().to_string(), i))
        .collect();

    let mut added = 0;
    let mut updated = 0;
    for record in incoming {
        match index.get(record.id()) {
            Some(&pos) => {
                if upsert {
                    merged[pos] = record;
                    updated += 1;
                }
            }
            None => {
                index.insert(record.id().to_string(), merged.len());
                merged.push(record);
                added += 1;
            }
        }
    }
    (merged, added, updated)
}

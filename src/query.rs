//! Consumer-facing facade over the mirror.
//!
//! Reads go through the refresh policy first. When a refresh fails but the
//! cache already holds data, the stale data is served with a warning; only
//! an empty cache surfaces the error.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::engine::{EngineSettings, RefreshOutcome, SyncEngine};
use crate::cache::persist::PersistenceStore;
use crate::cache::store::CacheStore;
use crate::cache::{CacheSnapshot, CacheStatus, EntityKind};
use crate::config::MirrorConfig;
use crate::error::SyncResult;
use crate::helpdesk::client::HelpdeskClient;
use crate::helpdesk::ratelimit::TokenBucketLimiter;
use crate::helpdesk::HelpdeskSource;
use crate::threads::builder::{BatchReport, ThreadBuilder};
use crate::threads::ConversationThread;

/// One `field=value` search condition.
///
/// `field` may be a dotted path into nested objects (`location.city`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub field: String,
    pub value: String,
}

impl SearchFilter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl FromStr for SearchFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((field, value)) if !field.trim().is_empty() => {
                Ok(SearchFilter::new(field.trim(), value.trim()))
            }
            _ => Err(format!("Expected field=value, got '{}'", s)),
        }
    }
}

pub struct MirrorService {
    engine: SyncEngine,
    threads: ThreadBuilder,
    thread_batch_size: usize,
    thread_batch_delay: Duration,
}

impl MirrorService {
    pub fn new(
        engine: SyncEngine,
        threads: ThreadBuilder,
        thread_batch_size: usize,
        thread_batch_delay: Duration,
    ) -> Self {
        Self {
            engine,
            threads,
            thread_batch_size,
            thread_batch_delay,
        }
    }

    /// Wire the production stack: rate-limited HTTP client, store, disk.
    pub fn from_config(config: &MirrorConfig) -> SyncResult<Self> {
        config.validate()?;
        let limiter = Arc::new(TokenBucketLimiter::new(
            config.requests_per_second,
            config.burst,
        ));
        let client: Arc<dyn HelpdeskSource> =
            Arc::new(HelpdeskClient::from_config(config, limiter)?);
        Ok(Self::with_source(client, config))
    }

    /// Same wiring around any source.
    pub fn with_source(source: Arc<dyn HelpdeskSource>, config: &MirrorConfig) -> Self {
        let engine = SyncEngine::new(
            source.clone(),
            Arc::new(CacheStore::new(config.stale_after())),
            PersistenceStore::new(&config.data_dir),
            EngineSettings::from_config(config),
        );
        let threads = ThreadBuilder::new(source, config.reviewers.clone());
        Self::new(
            engine,
            threads,
            config.thread_batch_size,
            config.thread_batch_delay(),
        )
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn get_snapshot(&self) -> Arc<CacheSnapshot> {
        self.engine.store().get()
    }

    pub fn get_status(&self) -> CacheStatus {
        self.engine.status()
    }

    pub async fn ensure_fresh(&self) -> SyncResult<RefreshOutcome> {
        self.engine.ensure_fresh().await
    }

    pub async fn force_full_refresh(&self) -> SyncResult<RefreshOutcome> {
        self.engine.force_full_refresh().await
    }

    /// Records of `kind` matching every filter.
    ///
    /// `live` skips the cache and walks the remote list directly.
    pub async fn search(
        &self,
        kind: EntityKind,
        filters: &[SearchFilter],
        live: bool,
    ) -> SyncResult<Vec<Value>> {
        let records = if live {
            let path = kind.list_path(self.engine.settings().page_size);
            self.engine
                .source()
                .fetch_all(&path, kind.array_keys())
                .await?
        } else {
            if let Err(e) = self.engine.ensure_fresh().await {
                if self.engine.store().is_empty() {
                    return Err(e);
                }
                log::warn!("Search: refresh failed, serving cached {}: {}", kind, e);
            }
            self.get_snapshot().records_as_values(kind)
        };

        Ok(records
            .into_iter()
            .filter(|record| matches_filters(record, filters))
            .collect())
    }

    /// Cached thread, if one was built before.
    pub fn get_thread(&self, conversation_id: &str) -> Option<ConversationThread> {
        self.get_snapshot().threads.get(conversation_id).cloned()
    }

    /// Build one thread and keep it in the mirror.
    pub async fn build_thread(&self, conversation_id: &str) -> SyncResult<ConversationThread> {
        let thread = self.threads.build_thread(conversation_id).await?;
        self.engine.store_threads(vec![thread.clone()]).await;
        Ok(thread)
    }

    /// Build many threads; failures are reported per conversation.
    pub async fn build_threads_batch(&self, conversation_ids: &[String]) -> BatchReport {
        let report = self
            .threads
            .build_threads(
                conversation_ids,
                self.thread_batch_size,
                self.thread_batch_delay,
            )
            .await;
        self.engine.store_threads(report.threads.clone()).await;
        report
    }

    /// Ids of cached conversations without a materialized thread.
    pub fn conversations_missing_threads(&self) -> Vec<String> {
        let snapshot = self.get_snapshot();
        snapshot
            .conversations
            .iter()
            .filter(|c| !snapshot.threads.contains_key(&c.id))
            .map(|c| c.id.clone())
            .collect()
    }
}

/// True when every filter matches (an empty filter list matches everything).
pub fn matches_filters(record: &Value, filters: &[SearchFilter]) -> bool {
    filters.iter().all(|filter| {
        let needle = filter.value.to_lowercase();
        lookup_path(record, &filter.field).is_some_and(|value| value_contains(value, &needle))
    })
}

fn lookup_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.get(segment))
}

/// Case-insensitive substring match; arrays match if any element does.
fn value_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Number(n) => n.to_string().contains(needle),
        Value::Bool(b) => b.to_string().contains(needle),
        Value::Array(items) => items.iter().any(|item| value_contains(item, needle)),
        Value::Null | Value::Object(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::engine::tests::FakeSource;
    use crate::error::SyncError;
    use serde_json::json;

    fn service(source: Arc<FakeSource>, dir: &std::path::Path) -> MirrorService {
        let config = MirrorConfig {
            data_dir: dir.to_path_buf(),
            thread_batch_delay_ms: 0,
            ..MirrorConfig::default()
        };
        MirrorService::with_source(source, &config)
    }

    #[test]
    fn test_filter_parse() {
        let f: SearchFilter = "email = acme.com".parse().unwrap();
        assert_eq!(f, SearchFilter::new("email", "acme.com"));
        assert!("no-equals".parse::<SearchFilter>().is_err());
        assert!("=value".parse::<SearchFilter>().is_err());
    }

    #[test]
    fn test_matches_filters() {
        let record = json!({
            "id": 7,
            "email": "Ada@Acme.com",
            "location": {"city": "Lisbon"},
            "tags": ["vip", "beta"],
            "unsubscribed": false
        });
        assert!(matches_filters(&record, &[]));
        assert!(matches_filters(&record, &[SearchFilter::new("email", "acme")]));
        assert!(matches_filters(&record, &[SearchFilter::new("location.city", "lis")]));
        assert!(matches_filters(&record, &[SearchFilter::new("tags", "VIP")]));
        assert!(matches_filters(&record, &[SearchFilter::new("id", "7")]));
        assert!(matches_filters(&record, &[SearchFilter::new("unsubscribed", "false")]));
        assert!(!matches_filters(&record, &[SearchFilter::new("name", "ada")]));
        assert!(!matches_filters(
            &record,
            &[
                SearchFilter::new("email", "acme"),
                SearchFilter::new("location.city", "porto")
            ]
        ));
    }

    #[tokio::test]
    async fn test_search_refreshes_then_filters() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let service = service(source, dir.path());

        let hits = service
            .search(EntityKind::Contacts, &[SearchFilter::new("email", "ACME")], false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "c1");
        assert!(service.get_status().last_refreshed.is_some());
    }

    #[tokio::test]
    async fn test_search_serves_stale_when_refresh_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let service = service(source.clone(), dir.path());
        service.force_full_refresh().await.unwrap();

        *source.totals.lock() = None;
        source.failing_kinds.lock().insert(EntityKind::Contacts);
        let hits = service
            .search(EntityKind::Contacts, &[], false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_search_empty_cache_propagates_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        source.failing_kinds.lock().insert(EntityKind::Admins);
        let service = service(source, dir.path());

        let err = service
            .search(EntityKind::Contacts, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn test_live_search_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let service = service(source.clone(), dir.path());

        let hits = service
            .search(EntityKind::Companies, &[SearchFilter::new("name", "acme")], true)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(service.get_snapshot().is_empty());
        assert_eq!(source.calls_for(EntityKind::Contacts), 0);
    }

    #[tokio::test]
    async fn test_build_threads_batch_stores_threads() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let service = service(source, dir.path());
        service.force_full_refresh().await.unwrap();
        assert_eq!(service.conversations_missing_threads(), vec!["v1".to_string()]);

        let report = service
            .build_threads_batch(&["v1".to_string(), "v2".to_string()])
            .await;
        assert_eq!(report.succeeded(), 2);
        assert!(service.get_thread("v1").is_some());
        assert!(service.conversations_missing_threads().is_empty());
        assert_eq!(service.get_status().thread_count, 2);
    }

    #[tokio::test]
    async fn test_build_thread_stores_single() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let service = service(source, dir.path());
        let thread = service.build_thread("v9").await.unwrap();
        assert_eq!(thread.conversation_id, "v9");
        assert_eq!(service.get_thread("v9"), Some(thread));
    }
}

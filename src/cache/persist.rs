//! Durable copy of the mirror under the data directory.
//!
//! Three files, each written atomically (temp file + rename):
//! - `mirror_cache.json`: the four collections and `lastRefreshed`
//! - `mirror_metadata.json`: `CacheMetadata`
//! - `threads.json`: materialized conversation threads
//!
//! A missing file is not an error. Files written under a different schema
//! version are ignored so the next refresh starts cold.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    Admin, CacheMetadata, CacheSnapshot, Company, Contact, ConversationSummary, SCHEMA_VERSION,
};
use crate::error::{SyncError, SyncResult};
use crate::threads::ConversationThread;

pub const CACHE_FILE: &str = "mirror_cache.json";
pub const METADATA_FILE: &str = "mirror_metadata.json";
pub const THREADS_FILE: &str = "threads.json";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheFileOut<'a> {
    schema_version: &'a str,
    contacts: &'a [Contact],
    companies: &'a [Company],
    admins: &'a [Admin],
    conversations: &'a [ConversationSummary],
    last_refreshed: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFileIn {
    #[serde(default)]
    schema_version: Option<String>,
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    companies: Vec<Company>,
    #[serde(default)]
    admins: Vec<Admin>,
    #[serde(default)]
    conversations: Vec<ConversationSummary>,
    #[serde(default)]
    last_refreshed: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreadsFileOut<'a> {
    schema_version: &'a str,
    threads: &'a BTreeMap<String, ConversationThread>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadsFileIn {
    #[serde(default)]
    schema_version: Option<String>,
    #[serde(default)]
    threads: BTreeMap<String, ConversationThread>,
}

#[derive(Debug, Clone)]
pub struct PersistenceStore {
    dir: PathBuf,
}

impl PersistenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write collections, metadata and threads.
    pub fn save(&self, snapshot: &CacheSnapshot, metadata: &CacheMetadata) -> SyncResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            SyncError::Persistence(format!(
                "Failed to create data dir {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        write_json_atomic(
            &self.dir.join(CACHE_FILE),
            &CacheFileOut {
                schema_version: SCHEMA_VERSION,
                contacts: &snapshot.contacts,
                companies: &snapshot.companies,
                admins: &snapshot.admins,
                conversations: &snapshot.conversations,
                last_refreshed: snapshot.last_refreshed,
            },
        )?;
        write_json_atomic(&self.dir.join(METADATA_FILE), metadata)?;
        self.save_threads(&snapshot.threads)
    }

    pub fn save_threads(&self, threads: &BTreeMap<String, ConversationThread>) -> SyncResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            SyncError::Persistence(format!(
                "Failed to create data dir {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        write_json_atomic(
            &self.dir.join(THREADS_FILE),
            &ThreadsFileOut {
                schema_version: SCHEMA_VERSION,
                threads,
            },
        )
    }

    /// Load the persisted mirror.
    ///
    /// `Ok(None)` when nothing usable is on disk (no files yet, or a schema
    /// version mismatch). Threads built before the first refresh load with
    /// empty collections. Unreadable or corrupt files are errors.
    pub fn load(&self) -> SyncResult<Option<(CacheSnapshot, CacheMetadata)>> {
        let Some(cache) = read_json::<CacheFileIn>(&self.dir.join(CACHE_FILE))? else {
            let threads = self.load_threads();
            if threads.is_empty() {
                return Ok(None);
            }
            log::info!("Persistence: loaded {} threads without collections", threads.len());
            let snapshot = CacheSnapshot {
                threads,
                ..CacheSnapshot::default()
            };
            return Ok(Some((snapshot, CacheMetadata::default())));
        };
        let Some(metadata) = read_json::<CacheMetadata>(&self.dir.join(METADATA_FILE))? else {
            log::warn!("Persistence: cache file present without metadata, ignoring");
            return Ok(None);
        };

        let cache_version = cache.schema_version.as_deref().unwrap_or("");
        if cache_version != SCHEMA_VERSION || metadata.schema_version != SCHEMA_VERSION {
            log::warn!(
                "Persistence: schema version mismatch (cache {:?}, metadata {:?}, expected {}), starting cold",
                cache_version,
                metadata.schema_version,
                SCHEMA_VERSION
            );
            return Ok(None);
        }

        let threads = self.load_threads();

        let snapshot = CacheSnapshot {
            contacts: cache.contacts,
            companies: cache.companies,
            admins: cache.admins,
            conversations: cache.conversations,
            last_refreshed: cache.last_refreshed,
            threads,
        };
        log::info!(
            "Persistence: loaded {} records and {} threads from {}",
            snapshot.counts().total(),
            snapshot.threads.len(),
            self.dir.display()
        );
        Ok(Some((snapshot, metadata)))
    }

    fn load_threads(&self) -> BTreeMap<String, ConversationThread> {
        match read_json::<ThreadsFileIn>(&self.dir.join(THREADS_FILE)) {
            Ok(Some(file)) if file.schema_version.as_deref() == Some(SCHEMA_VERSION) => {
                file.threads
            }
            Ok(Some(_)) => {
                log::warn!("Persistence: threads file has a different schema version, dropping");
                BTreeMap::new()
            }
            Ok(None) => BTreeMap::new(),
            // Corrupt threads file still loads the collections
            Err(e) => {
                log::warn!("Persistence: {}", e);
                BTreeMap::new()
            }
        }
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> SyncResult<()> {
    let temp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(value).map_err(|e| {
        SyncError::Persistence(format!(
            "Failed to serialize JSON for {}: {}",
            path.display(),
            e
        ))
    })?;
    fs::write(&temp_path, payload).map_err(|e| {
        SyncError::Persistence(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;
    fs::rename(&temp_path, path).map_err(|e| {
        SyncError::Persistence(format!("Failed to replace {}: {}", path.display(), e))
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> SyncResult<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SyncError::Persistence(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    serde_json::from_str(&content).map(Some).map_err(|e| {
        SyncError::Persistence(format!("Failed to parse {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ActivityCounts, CacheCounts};
    use crate::config::ReviewerConfig;
    use crate::threads::builder::tests::detail_for;
    use crate::threads::cleaner::HtmlTextCleaner;
    use crate::threads::materialize::materialize;
    use serde_json::{json, Map};

    fn snapshot() -> (CacheSnapshot, CacheMetadata) {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut extra = Map::new();
        extra.insert("custom_attributes".into(), json!({"tier": "gold"}));
        let mut threads = BTreeMap::new();
        let thread = materialize(
            "v1",
            detail_for("v1"),
            &ReviewerConfig::default(),
            &HtmlTextCleaner::default(),
            now,
        )
        .unwrap();
        threads.insert(thread.conversation_id.clone(), thread);
        let snapshot = CacheSnapshot {
            contacts: vec![Contact {
                id: "c1".into(),
                email: Some("a@x.io".into()),
                name: Some("Ada".into()),
                role: None,
                external_id: None,
                extra,
            }],
            companies: vec![Company {
                id: "co1".into(),
                name: Some("Acme".into()),
                company_id: Some("acme-1".into()),
                extra: Map::new(),
            }],
            admins: vec![Admin {
                id: "42".into(),
                name: Some("Riley".into()),
                email: None,
                extra: Map::new(),
            }],
            conversations: vec![ConversationSummary {
                id: "v1".into(),
                state: Some("closed".into()),
                title: Some("Login broken".into()),
                created_at: Some(now),
                updated_at: None,
                extra: Map::new(),
            }],
            last_refreshed: Some(now),
            threads,
        };
        let metadata = CacheMetadata {
            last_full_refresh: Some(now),
            last_activity: ActivityCounts {
                contacts: 1,
                companies: 1,
                conversations: 1,
            },
            cache_counts: CacheCounts {
                contacts: 1,
                companies: 1,
                admins: 1,
                conversations: 1,
            },
            schema_version: SCHEMA_VERSION.to_string(),
        };
        (snapshot, metadata)
    }

    #[test]
    fn test_load_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("nope"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let (snap, meta) = snapshot();
        store.save(&snap, &meta).unwrap();

        let (loaded, loaded_meta) = store.load().unwrap().unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(loaded_meta, meta);
        assert_eq!(loaded.counts().total(), 4);
        assert!(loaded.threads.contains_key("v1"));
        assert!(dir.path().join(CACHE_FILE).exists());
        assert!(dir.path().join(METADATA_FILE).exists());
        assert!(dir.path().join(THREADS_FILE).exists());
        assert!(!dir.path().join("mirror_cache.json.tmp").exists());
    }

    #[test]
    fn test_schema_mismatch_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let (snap, mut meta) = snapshot();
        meta.schema_version = "1".into();
        store.save(&snap, &meta).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_cache_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CACHE_FILE), "{not json").unwrap();
        let err = PersistenceStore::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, SyncError::Persistence(_)));
    }

    #[test]
    fn test_corrupt_threads_file_keeps_collections() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let (snap, meta) = snapshot();
        store.save(&snap, &meta).unwrap();
        fs::write(dir.path().join(THREADS_FILE), "{oops").unwrap();

        let (loaded, _) = store.load().unwrap().unwrap();
        assert_eq!(loaded.contacts.len(), 1);
        assert!(loaded.threads.is_empty());
    }

    #[test]
    fn test_threads_without_collections_still_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let (snap, _) = snapshot();
        store.save_threads(&snap.threads).unwrap();

        let (loaded, meta) = store.load().unwrap().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.threads, snap.threads);
        assert!(meta.last_full_refresh.is_none());
    }

    #[test]
    fn test_cache_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let (snap, meta) = snapshot();
        store.save(&snap, &meta).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(CACHE_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["schemaVersion"], SCHEMA_VERSION);
        assert_eq!(raw["contacts"][0]["custom_attributes"]["tier"], "gold");
        assert!(raw["lastRefreshed"].is_string());
    }
}

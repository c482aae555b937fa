//! Local mirror of helpdesk entities.
//!
//! - `store`: in-memory snapshot + metadata, the source of truth for reads
//! - `persist`: JSON files that let the mirror survive restarts
//! - `policy`: full vs incremental vs no-op decision
//! - `engine`: runs refreshes with single-flight and write serialization

pub mod engine;
pub mod persist;
pub mod policy;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::threads::ConversationThread;
use crate::util::{de_opt_string, de_opt_timestamp, de_string_id};

/// Bumped whenever the on-disk layout changes. Files written under another
/// version are ignored and trigger a cold start.
pub const SCHEMA_VERSION: &str = "2";

/// The four mirrored collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Contacts,
    Companies,
    Admins,
    Conversations,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Contacts,
        EntityKind::Companies,
        EntityKind::Admins,
        EntityKind::Conversations,
    ];

    /// Kinds with a total-count signal used by the activity probe.
    pub const PROBED: [EntityKind; 3] = [
        EntityKind::Contacts,
        EntityKind::Companies,
        EntityKind::Conversations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Contacts => "contacts",
            EntityKind::Companies => "companies",
            EntityKind::Admins => "admins",
            EntityKind::Conversations => "conversations",
        }
    }

    /// Keys the list endpoint may put its records under, most likely first.
    pub fn array_keys(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Contacts => &["data", "contacts"],
            EntityKind::Companies => &["data", "companies"],
            EntityKind::Admins => &["admins", "data"],
            EntityKind::Conversations => &["conversations", "data"],
        }
    }

    pub fn list_path(&self, page_size: u32) -> String {
        format!("/{}?per_page={}", self.as_str(), page_size)
    }

    pub fn probe_path(&self) -> String {
        self.list_path(1)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contacts" | "contact" => Ok(EntityKind::Contacts),
            "companies" | "company" => Ok(EntityKind::Companies),
            "admins" | "admin" => Ok(EntityKind::Admins),
            "conversations" | "conversation" => Ok(EntityKind::Conversations),
            other => Err(format!("Unknown entity kind: {}", other)),
        }
    }
}

/// Records that carry a stable id.
pub trait Entity {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(deserialize_with = "de_string_id")]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub email: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub role: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    #[serde(deserialize_with = "de_string_id")]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub company_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admin {
    #[serde(deserialize_with = "de_string_id")]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(deserialize_with = "de_string_id")]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub state: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "de_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! impl_entity {
    ($($ty:ty),*) => {
        $(impl Entity for $ty {
            fn id(&self) -> &str {
                &self.id
            }
        })*
    };
}

impl_entity!(Contact, Company, Admin, ConversationSummary);

/// Decode raw records, skipping (and logging) any without a usable id.
pub fn decode_records<T: serde::de::DeserializeOwned>(kind: EntityKind, raw: Vec<Value>) -> Vec<T> {
    let total = raw.len();
    let decoded: Vec<T> = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("Skipping {} record: {}", kind, e);
                None
            }
        })
        .collect();
    if decoded.len() < total {
        log::warn!(
            "Skipped {} of {} {} records without a usable id",
            total - decoded.len(),
            total,
            kind
        );
    }
    decoded
}

/// One fetched generation of every entity kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityBatch {
    pub contacts: Vec<Contact>,
    pub companies: Vec<Company>,
    pub admins: Vec<Admin>,
    pub conversations: Vec<ConversationSummary>,
}

/// Last-seen totals per probed kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    #[serde(default)]
    pub contacts: u64,
    #[serde(default)]
    pub companies: u64,
    #[serde(default)]
    pub conversations: u64,
}

impl ActivityCounts {
    pub fn get(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::Contacts => self.contacts,
            EntityKind::Companies => self.companies,
            EntityKind::Conversations => self.conversations,
            EntityKind::Admins => 0,
        }
    }

    pub fn set(&mut self, kind: EntityKind, value: u64) {
        match kind {
            EntityKind::Contacts => self.contacts = value,
            EntityKind::Companies => self.companies = value,
            EntityKind::Conversations => self.conversations = value,
            EntityKind::Admins => {}
        }
    }

    /// True if any kind grew compared to `previous`.
    pub fn exceeds(&self, previous: &ActivityCounts) -> bool {
        EntityKind::PROBED
            .iter()
            .any(|kind| self.get(*kind) > previous.get(*kind))
    }

    /// Per-kind maximum, so recorded activity never moves backwards.
    pub fn max(&self, other: &ActivityCounts) -> ActivityCounts {
        ActivityCounts {
            contacts: self.contacts.max(other.contacts),
            companies: self.companies.max(other.companies),
            conversations: self.conversations.max(other.conversations),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounts {
    #[serde(default)]
    pub contacts: usize,
    #[serde(default)]
    pub companies: usize,
    #[serde(default)]
    pub admins: usize,
    #[serde(default)]
    pub conversations: usize,
}

impl CacheCounts {
    pub fn get(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Contacts => self.contacts,
            EntityKind::Companies => self.companies,
            EntityKind::Admins => self.admins,
            EntityKind::Conversations => self.conversations,
        }
    }

    pub fn total(&self) -> usize {
        self.contacts + self.companies + self.admins + self.conversations
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    #[serde(default)]
    pub last_full_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity: ActivityCounts,
    #[serde(default)]
    pub cache_counts: CacheCounts,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

impl Default for CacheMetadata {
    fn default() -> Self {
        Self {
            last_full_refresh: None,
            last_activity: ActivityCounts::default(),
            cache_counts: CacheCounts::default(),
            schema_version: default_schema_version(),
        }
    }
}

/// Immutable view of the mirror handed to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub contacts: Vec<Contact>,
    pub companies: Vec<Company>,
    pub admins: Vec<Admin>,
    pub conversations: Vec<ConversationSummary>,
    pub last_refreshed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub threads: BTreeMap<String, ConversationThread>,
}

impl CacheSnapshot {
    pub fn counts(&self) -> CacheCounts {
        CacheCounts {
            contacts: self.contacts.len(),
            companies: self.companies.len(),
            admins: self.admins.len(),
            conversations: self.conversations.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts().total() == 0
    }

    /// Records of one kind as JSON values, for generic filtering.
    pub fn records_as_values(&self, kind: EntityKind) -> Vec<Value> {
        fn to_values<T: Serialize>(records: &[T]) -> Vec<Value> {
            records
                .iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect()
        }
        match kind {
            EntityKind::Contacts => to_values(&self.contacts),
            EntityKind::Companies => to_values(&self.companies),
            EntityKind::Admins => to_values(&self.admins),
            EntityKind::Conversations => to_values(&self.conversations),
        }
    }
}

/// Read-side status summary for consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub last_refreshed: Option<DateTime<Utc>>,
    pub counts: CacheCounts,
    pub metadata: CacheMetadata,
    pub age_minutes: Option<i64>,
    pub is_stale: bool,
    pub thread_count: usize,
    pub refresh_in_progress: bool,
}

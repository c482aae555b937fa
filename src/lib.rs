//! DeskMirror: a local, refreshable mirror of a helpdesk workspace.
//!
//! `query::MirrorService` is the entry point for consumers. It owns the
//! refresh engine (`cache::engine`), the in-memory store, the on-disk copy and
//! the conversation thread builder.

pub mod cache;
pub mod config;
pub mod error;
pub mod helpdesk;
pub mod poller;
pub mod query;
pub mod threads;
pub mod util;

pub use cache::engine::{RefreshOutcome, SyncEngine};
pub use cache::{CacheSnapshot, CacheStatus, EntityKind};
pub use config::MirrorConfig;
pub use error::{SyncError, SyncResult};
pub use query::{MirrorService, SearchFilter};

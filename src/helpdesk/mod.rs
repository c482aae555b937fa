//! Helpdesk REST integration.
//!
//! The cache engine and the thread builder only see [`HelpdeskSource`];
//! [`client::HelpdeskClient`] is the reqwest implementation used in
//! production, tests plug in in-memory sources.

pub mod client;
pub mod pagination;
pub mod ratelimit;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncResult;

#[async_trait]
pub trait HelpdeskSource: Send + Sync {
    /// Walk pagination from `path` and return every record, stopping early
    /// after `max_pages` pages when set.
    async fn fetch_pages(
        &self,
        path: &str,
        preferred_keys: &[&str],
        max_pages: Option<usize>,
    ) -> SyncResult<Vec<Value>>;

    /// Cheap single-page request returning the advertised total count.
    async fn probe_total(&self, path: &str) -> SyncResult<u64>;

    /// `GET /{kind}/{id}` for one resource.
    async fn fetch_detail(&self, kind: &str, id: &str) -> SyncResult<Value>;

    /// Walk pagination until exhausted.
    async fn fetch_all(&self, path: &str, preferred_keys: &[&str]) -> SyncResult<Vec<Value>> {
        self.fetch_pages(path, preferred_keys, None).await
    }
}

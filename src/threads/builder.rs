//! Fetch-and-materialize for one conversation or a batch of them.
//!
//! Batches run `batch_size` detail fetches concurrently, pause for the
//! inter-batch delay, then continue. The helpdesk client's rate limiter still
//! gates every individual request. A failed conversation is logged and
//! skipped; it never fails the batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;

use super::cleaner::{HtmlTextCleaner, TextCleaner};
use super::materialize::materialize;
use super::ConversationThread;
use crate::config::ReviewerConfig;
use crate::error::{SyncError, SyncResult};
use crate::helpdesk::HelpdeskSource;

const CONVERSATIONS_RESOURCE: &str = "conversations";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedThread {
    pub conversation_id: String,
    pub reason: String,
}

/// Result of a batch run: the threads that were built and the ones skipped.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub threads: Vec<ConversationThread>,
    pub skipped: Vec<SkippedThread>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.threads.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

pub struct ThreadBuilder {
    source: Arc<dyn HelpdeskSource>,
    reviewers: ReviewerConfig,
    cleaner: Arc<dyn TextCleaner>,
}

impl ThreadBuilder {
    pub fn new(source: Arc<dyn HelpdeskSource>, reviewers: ReviewerConfig) -> Self {
        Self {
            source,
            reviewers,
            cleaner: Arc::new(HtmlTextCleaner::default()),
        }
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn TextCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// Fetch the full conversation and materialize it.
    pub async fn build_thread(&self, conversation_id: &str) -> SyncResult<ConversationThread> {
        let detail = self
            .source
            .fetch_detail(CONVERSATIONS_RESOURCE, conversation_id)
            .await
            .map_err(|e| SyncError::ThreadBuild {
                conversation_id: conversation_id.to_string(),
                message: e.to_string(),
            })?;

        materialize(
            conversation_id,
            detail,
            &self.reviewers,
            self.cleaner.as_ref(),
            Utc::now(),
        )
    }

    /// Build many threads in bounded-concurrency batches.
    pub async fn build_threads(
        &self,
        conversation_ids: &[String],
        batch_size: usize,
        inter_batch_delay: Duration,
    ) -> BatchReport {
        let batch_size = batch_size.max(1);
        let batch_count = conversation_ids.len().div_ceil(batch_size);
        let mut report = BatchReport::default();

        for (index, batch) in conversation_ids.chunks(batch_size).enumerate() {
            let results = join_all(batch.iter().map(|id| self.build_thread(id))).await;

            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(thread) => report.threads.push(thread),
                    Err(e) => {
                        log::warn!("Thread builder: skipping conversation {}: {}", id, e);
                        report.skipped.push(SkippedThread {
                            conversation_id: id.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if index + 1 < batch_count && !inter_batch_delay.is_zero() {
                tokio::time::sleep(inter_batch_delay).await;
            }
        }

        log::info!(
            "Thread builder: built {} threads, skipped {}",
            report.succeeded(),
            report.skipped_count()
        );
        report
    }
}

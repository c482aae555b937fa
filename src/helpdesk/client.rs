//! REST client for the helpdesk API.
//!
//! Uses reqwest with Bearer token auth and a pinned API version header.
//! Pages are fetched strictly in sequence: a page's cursor is only known
//! once the previous page has arrived.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::pagination::{self, NextPage};
use super::ratelimit::{NoopLimiter, RateLimiter};
use super::HelpdeskSource;
use crate::config::MirrorConfig;
use crate::error::{SyncError, SyncResult};

const API_VERSION_HEADER: &str = "Intercom-Version";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    Duration::from_millis(base)
}

pub struct HelpdeskClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    api_version: String,
    limiter: Arc<dyn RateLimiter>,
    retry: RetryPolicy,
}

impl HelpdeskClient {
    pub fn new(base_url: &str, access_token: &str, api_version: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            api_version: api_version.to_string(),
            limiter: Arc::new(NoopLimiter),
            retry: RetryPolicy::default(),
        }
    }

    /// Build a client from config, sharing `limiter` with other callers.
    pub fn from_config(config: &MirrorConfig, limiter: Arc<dyn RateLimiter>) -> SyncResult<Self> {
        let token = config.require_access_token()?;
        Ok(Self::new(&config.api_base_url, token, &config.api_version)
            .with_limiter(limiter)
            .with_retry(RetryPolicy {
                max_attempts: config.request_max_attempts.max(1),
                ..RetryPolicy::default()
            }))
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Absolute URLs pass through; paths are joined onto the base URL.
    fn resolve_url(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else if target.starts_with('/') {
            format!("{}{}", self.base_url, target)
        } else {
            format!("{}/{}", self.base_url, target)
        }
    }

    async fn send(&self, url: &str) -> SyncResult<reqwest::Response> {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            self.limiter.acquire().await;

            let result = self
                .client
                .get(url)
                .bearer_auth(&self.access_token)
                .header(API_VERSION_HEADER, &self.api_version)
                .header("Accept", "application/json")
                .header("Content-Type", "application/json")
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    let retryable = !status.is_success()
                        && SyncError::Api {
                            status: status.as_u16(),
                            message: String::new(),
                        }
                        .is_retryable();
                    if retryable && attempt < attempts {
                        let delay = retry_delay(
                            attempt,
                            &self.retry,
                            response.headers().get(reqwest::header::RETRY_AFTER),
                        );
                        log::warn!(
                            "helpdesk retry {}/{} after status {} (sleep {:?})",
                            attempt,
                            attempts,
                            status,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    let err = SyncError::from(err);
                    if err.is_retryable() && attempt < attempts {
                        let delay = retry_delay(attempt, &self.retry, None);
                        log::warn!(
                            "helpdesk retry {}/{} after transport error: {} (sleep {:?})",
                            attempt,
                            attempts,
                            err,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(SyncError::Transport(format!(
            "GET {}: request exhausted retries",
            url
        )))
    }

    async fn get_json(&self, target: &str) -> SyncResult<Value> {
        let url = self.resolve_url(target);
        let resp = self.send(&url).await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| SyncError::Transport(format!("GET {}: {}", url, e)))?;
        serde_json::from_str(&text)
            .map_err(|e| SyncError::MalformedResponse(format!("GET {}: {}", url, e)))
    }
}

#[async_trait]
impl HelpdeskSource for HelpdeskClient {
    async fn fetch_pages(
        &self,
        path: &str,
        preferred_keys: &[&str],
        max_pages: Option<usize>,
    ) -> SyncResult<Vec<Value>> {
        let mut target = path.to_string();
        let mut items = Vec::new();
        let mut pages = 0usize;

        loop {
            let body = self.get_json(&target).await?;
            pages += 1;

            match pagination::extract_items(&body, preferred_keys) {
                Some(page) => items.extend(page),
                None => {
                    let err = SyncError::MalformedResponse(format!(
                        "no record array in page {} of {}",
                        pages, path
                    ));
                    log::warn!("{}; treating as empty page", err);
                    break;
                }
            }

            if max_pages.is_some_and(|max| pages >= max) {
                break;
            }

            let next = match pagination::next_page(&body, path) {
                Some(NextPage::Url(url)) => url,
                Some(NextPage::Rebuilt(rebuilt)) => rebuilt,
                None => break,
            };
            if next == target {
                log::warn!("Pagination cursor for {} did not advance; stopping", path);
                break;
            }
            target = next;
        }

        log::debug!("Fetched {} records from {} in {} pages", items.len(), path, pages);
        Ok(items)
    }

    async fn probe_total(&self, path: &str) -> SyncResult<u64> {
        let body = self.get_json(path).await?;
        pagination::total_count(&body)
            .ok_or_else(|| SyncError::MalformedResponse(format!("no total_count in {}", path)))
    }

    async fn fetch_detail(&self, kind: &str, id: &str) -> SyncResult<Value> {
        let encoded: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
        self.get_json(&format!("/{}/{}", kind, encoded)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;

    fn client_for(server: &MockServer) -> HelpdeskClient {
        HelpdeskClient::new(&server.base_url(), "test-token", "2.11")
    }

    #[test]
    fn test_resolve_url() {
        let client = HelpdeskClient::new("https://api.example.com/", "t", "2.11");
        assert_eq!(
            client.resolve_url("/contacts"),
            "https://api.example.com/contacts"
        );
        assert_eq!(
            client.resolve_url("contacts?page=2"),
            "https://api.example.com/contacts?page=2"
        );
        assert_eq!(
            client.resolve_url("https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_retry_delay_honors_retry_after() {
        let value = reqwest::header::HeaderValue::from_static("3");
        let delay = retry_delay(1, &RetryPolicy::default(), Some(&value));
        assert_eq!(delay, Duration::from_secs(3));
        let backoff = retry_delay(3, &RetryPolicy::default(), None);
        assert_eq!(backoff, Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_fetch_all_follows_string_cursor() {
        let server = MockServer::start_async().await;
        let page2_url = server.url("/contacts?page=2");

        let page1 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/contacts")
                    .query_param("per_page", "150")
                    .header("authorization", "Bearer test-token")
                    .header("intercom-version", "2.11");
                then.status(200).json_body(json!({
                    "type": "list",
                    "data": [{"id": "c1"}, {"id": "c2"}],
                    "pages": {"next": page2_url}
                }));
            })
            .await;
        let page2 = server
            .mock_async(|when, then| {
                when.method(GET).path("/contacts").query_param("page", "2");
                then.status(200).json_body(json!({
                    "type": "list",
                    "data": [{"id": "c3"}],
                    "pages": {"next": null}
                }));
            })
            .await;

        let items = client_for(&server)
            .fetch_all("/contacts?per_page=150", &["data", "contacts"])
            .await
            .unwrap();

        page1.assert_hits_async(1).await;
        page2.assert_hits_async(1).await;
        let ids: Vec<&str> = items.iter().filter_map(|v| v["id"].as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_fetch_all_rebuilds_object_cursor() {
        let server = MockServer::start_async().await;

        let page1 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/conversations")
                    .query_param("per_page", "150");
                then.status(200).json_body(json!({
                    "type": "conversation.list",
                    "conversations": [{"id": "1"}],
                    "pages": {"next": {"page": 2, "starting_after": "abc"}}
                }));
            })
            .await;
        let page2 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/conversations")
                    .query_param("page", "2")
                    .query_param("starting_after", "abc");
                then.status(200).json_body(json!({
                    "type": "conversation.list",
                    "conversations": [{"id": "2"}],
                    "pages": {"next": {"page": 3, "starting_after": "def"}}
                }));
            })
            .await;
        let page3 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/conversations")
                    .query_param("starting_after", "def");
                then.status(200).json_body(json!({
                    "type": "conversation.list",
                    "conversations": [{"id": "3"}],
                    "pages": {}
                }));
            })
            .await;

        let items = client_for(&server)
            .fetch_all("/conversations?per_page=150", &["conversations", "data"])
            .await
            .unwrap();

        page1.assert_hits_async(1).await;
        page2.assert_hits_async(1).await;
        page3.assert_hits_async(1).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[2]["id"], "3");
    }

    #[tokio::test]
    async fn test_fetch_pages_respects_max_pages() {
        let server = MockServer::start_async().await;
        let page2_url = server.url("/companies?page=2");

        let page1 = server
            .mock_async(|when, then| {
                when.method(GET).path("/companies").query_param("per_page", "150");
                then.status(200).json_body(json!({
                    "data": [{"id": "co1"}],
                    "pages": {"next": page2_url}
                }));
            })
            .await;

        let items = client_for(&server)
            .fetch_pages("/companies?per_page=150", &["data"], Some(1))
            .await
            .unwrap();

        page1.assert_hits_async(1).await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_page_terminates_with_collected_items() {
        let server = MockServer::start_async().await;
        let page2_url = server.url("/admins?page=2");

        server
            .mock_async(|when, then| {
                when.method(GET).path("/admins").query_param("per_page", "150");
                then.status(200).json_body(json!({
                    "admins": [{"id": "a1"}],
                    "pages": {"next": page2_url}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/admins").query_param("page", "2");
                then.status(200).json_body(json!({"type": "admin.list"}));
            })
            .await;

        let items = client_for(&server)
            .fetch_all("/admins?per_page=150", &["admins"])
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_non_success_status_is_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/contacts");
                then.status(401).body("unauthorized");
            })
            .await;

        let err = client_for(&server)
            .fetch_all("/contacts", &["data"])
            .await
            .unwrap_err();
        match err {
            SyncError::Api { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("unauthorized"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_retries_server_errors_up_to_max_attempts() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/contacts");
                then.status(503).body("unavailable");
            })
            .await;

        let err = client_for(&server)
            .with_retry(fast_retry(3))
            .fetch_all("/contacts", &["data"])
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Api { status: 503, .. }));
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/contacts");
                then.status(404).body("missing");
            })
            .await;

        let err = client_for(&server)
            .with_retry(fast_retry(3))
            .fetch_all("/contacts", &["data"])
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Api { status: 404, .. }));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        // Nothing listens on port 9 of localhost
        let client = HelpdeskClient::new("http://127.0.0.1:9", "t", "2.11").with_retry(fast_retry(2));
        let err = client.fetch_all("/contacts", &["data"]).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_probe_total_reads_total_count() {
        let server = MockServer::start_async().await;
        let probe = server
            .mock_async(|when, then| {
                when.method(GET).path("/contacts").query_param("per_page", "1");
                then.status(200).json_body(json!({
                    "data": [{"id": "c1"}],
                    "total_count": 1234
                }));
            })
            .await;

        let total = client_for(&server)
            .probe_total("/contacts?per_page=1")
            .await
            .unwrap();
        probe.assert_hits_async(1).await;
        assert_eq!(total, 1234);
    }

    #[tokio::test]
    async fn test_fetch_detail_hits_resource_path() {
        let server = MockServer::start_async().await;
        let detail = server
            .mock_async(|when, then| {
                when.method(GET).path("/conversations/555");
                then.status(200).json_body(json!({"id": "555", "state": "open"}));
            })
            .await;

        let body = client_for(&server)
            .fetch_detail("conversations", "555")
            .await
            .unwrap();
        detail.assert_hits_async(1).await;
        assert_eq!(body["state"], "open");
    }
}

//! Error types for helpdesk sync
//!
//! Errors are classified by how the caller should react:
//! - Retryable: transport failures, timeouts, rate limits, upstream 5xx
//! - Fatal: configuration errors, non-retryable API responses

use thiserror::Error;

/// Errors raised by the fetch client, the cache engine and the thread builder.
///
/// Payloads are plain strings so the error is `Clone`: a single in-flight
/// refresh hands the same result to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Helpdesk API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Failed to build thread for conversation {conversation_id}: {message}")]
    ThreadBuild {
        conversation_id: String,
        message: String,
    },

    #[error("Refresh timed out after {0} seconds")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SyncError {
    /// Returns true if repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Timeout(_) => true,
            SyncError::Api { status, .. } => *status == 429 || *status == 408 || *status >= 500,
            _ => false,
        }
    }

    /// Get a user-facing recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            SyncError::Transport(_) => "Check your internet connection and try again.",
            SyncError::Api { status: 401, .. } | SyncError::Api { status: 403, .. } => {
                "Check the helpdesk access token in ~/.deskmirror/config.json"
            }
            SyncError::Api { status: 429, .. } => "Wait a few minutes and try again.",
            SyncError::Api { .. } => "The helpdesk rejected the request. Check the logs.",
            SyncError::MalformedResponse(_) => "The helpdesk returned an unexpected payload.",
            SyncError::Persistence(_) => "Check permissions and free space in the data directory.",
            SyncError::ThreadBuild { .. } => "Retry the conversation later.",
            SyncError::Timeout(_) => "The refresh took too long. Try again.",
            SyncError::Configuration(_) => "Check your configuration in ~/.deskmirror/config.json",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SyncError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => SyncError::Transport(err.to_string()),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(SyncError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(SyncError::Api {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Api {
            status: 404,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Persistence("disk full".into()).is_retryable());
    }

    #[test]
    fn test_status_free_reqwest_error_is_transport() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        let err = SyncError::from(err);
        assert!(matches!(err, SyncError::Transport(_)));
    }
}

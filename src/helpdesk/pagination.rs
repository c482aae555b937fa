//! Page decoding for helpdesk list endpoints.
//!
//! List responses put their records under a varying key (`data`, `contacts`,
//! `conversations`, ...) and advertise the next page at `pages.next`, either
//! as a ready URL string or as an object of query parameters.

use serde_json::{Map, Value};

/// Where the next page lives, as advertised by the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPage {
    /// Absolute (or base-relative) URL, requested verbatim.
    Url(String),
    /// Path rebuilt from the original request path plus these encoded params.
    Rebuilt(String),
}

/// Pull the record array out of a list response.
///
/// Resolution order: each preferred key, then the first array-valued
/// top-level key, then `data`, then the body itself if it is an array.
/// Returns `None` when no array can be found.
pub fn extract_items(body: &Value, preferred_keys: &[&str]) -> Option<Vec<Value>> {
    if let Some(items) = body.as_array() {
        return Some(items.clone());
    }

    let obj = body.as_object()?;

    for key in preferred_keys {
        if let Some(Value::Array(items)) = obj.get(*key) {
            return Some(items.clone());
        }
    }

    if let Some(items) = obj.values().find_map(|v| v.as_array()) {
        return Some(items.clone());
    }

    obj.get("data").and_then(|v| v.as_array()).cloned()
}

/// Work out the next request target from a page body.
///
/// `original_path` is the path of the very first request; structured cursors
/// are appended to it after stripping its query string.
pub fn next_page(body: &Value, original_path: &str) -> Option<NextPage> {
    let next = body.get("pages")?.get("next")?;
    match next {
        Value::String(url) if !url.trim().is_empty() => Some(NextPage::Url(url.clone())),
        Value::Object(params) => {
            let query = encode_params(params);
            if query.is_empty() {
                return None;
            }
            Some(NextPage::Rebuilt(format!(
                "{}?{}",
                strip_query(original_path),
                query
            )))
        }
        _ => None,
    }
}

/// Total record count advertised by a list response, if any.
pub fn total_count(body: &Value) -> Option<u64> {
    body.get("total_count")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            body.get("pages")
                .and_then(|p| p.get("total_count"))
                .and_then(|v| v.as_u64())
        })
}

/// Drop everything from the first `?`.
pub fn strip_query(path: &str) -> &str {
    match path.find('?') {
        Some(idx) => &path[..idx],
        None => path,
    }
}

fn encode_params(params: &Map<String, Value>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            // Nested objects/arrays are passed through as their JSON text
            other => other.to_string(),
        };
        serializer.append_pair(key, &text);
    }
    serializer.finish()
}

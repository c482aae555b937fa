//! Conversation detail payload → [`ConversationThread`].
//!
//! Pure transformation: no I/O. The builder fetches the detail and hands the
//! raw JSON here together with the reviewer config and a text cleaner.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::cleaner::TextCleaner;
use super::{
    ClassifiedPart, ConversationState, ConversationThread, InitialMessage, PartAuthor,
    ThreadPart, ThreadTotals, ThreadUser,
};
use crate::config::ReviewerConfig;
use crate::error::{SyncError, SyncResult};
use crate::util::{de_opt_string, de_opt_timestamp, de_string_id};

const PART_NOTE: &str = "note";
const PART_COMMENT: &str = "comment";
const AUTHOR_ADMIN: &str = "admin";
const AUTHOR_USER: &str = "user";

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConversationDetail {
    #[serde(deserialize_with = "de_string_id")]
    id: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    state: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    source: Option<SourceRaw>,
    #[serde(default)]
    contacts: Option<ContactListRaw>,
    #[serde(default)]
    conversation_parts: Option<PartListRaw>,
}

#[derive(Debug, Deserialize)]
struct SourceRaw {
    #[serde(default, deserialize_with = "de_opt_string")]
    body: Option<String>,
    #[serde(default)]
    author: Option<AuthorRaw>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthorRaw {
    #[serde(rename = "type", default, deserialize_with = "de_opt_string")]
    author_type: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContactListRaw {
    #[serde(default)]
    contacts: Vec<ContactRefRaw>,
}

#[derive(Debug, Deserialize)]
struct ContactRefRaw {
    #[serde(deserialize_with = "de_string_id")]
    id: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartListRaw {
    #[serde(default)]
    conversation_parts: Vec<PartRaw>,
}

#[derive(Debug, Deserialize)]
struct PartRaw {
    #[serde(deserialize_with = "de_string_id")]
    id: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    part_type: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    body: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    author: Option<AuthorRaw>,
}

impl From<AuthorRaw> for PartAuthor {
    fn from(raw: AuthorRaw) -> Self {
        PartAuthor {
            author_type: raw.author_type,
            id: raw.id,
            name: raw.name,
            email: raw.email,
        }
    }
}

// ---------------------------------------------------------------------------
// Transformation
// ---------------------------------------------------------------------------

/// Build a thread from a conversation detail payload.
pub fn materialize(
    conversation_id: &str,
    detail: Value,
    reviewers: &ReviewerConfig,
    cleaner: &dyn TextCleaner,
    now: DateTime<Utc>,
) -> SyncResult<ConversationThread> {
    let build_error = |message: String| SyncError::ThreadBuild {
        conversation_id: conversation_id.to_string(),
        message,
    };

    let detail: ConversationDetail = serde_json::from_value(detail)
        .map_err(|e| build_error(format!("unexpected detail payload: {}", e)))?;

    let created_at = detail
        .created_at
        .ok_or_else(|| build_error("missing created_at".to_string()))?;
    let updated_at = detail.updated_at.unwrap_or(created_at);

    let state = match detail.state.as_deref() {
        Some("open") => ConversationState::Open,
        Some("closed") => ConversationState::Closed,
        Some("snoozed") => ConversationState::Snoozed,
        _ => ConversationState::Unknown,
    };

    let source_author = detail.source.as_ref().and_then(|s| s.author.clone());
    let first_contact = detail
        .contacts
        .as_ref()
        .and_then(|list| list.contacts.first());
    let user = resolve_user(source_author.as_ref(), first_contact);

    let source_body = detail.source.as_ref().and_then(|s| s.body.clone());
    let initial_message = InitialMessage {
        body_clean: source_body
            .as_deref()
            .map(|raw| cleaner.clean(raw))
            .unwrap_or_default(),
        body_raw: source_body,
        created_at,
        author: source_author.map(PartAuthor::from),
    };

    let raw_parts = detail
        .conversation_parts
        .map(|list| list.conversation_parts)
        .unwrap_or_default();

    let mut parts: Vec<ThreadPart> = raw_parts
        .into_iter()
        .map(|raw| {
            let author = raw.author.unwrap_or(AuthorRaw {
                author_type: None,
                id: None,
                name: None,
                email: None,
            });
            ThreadPart {
                id: raw.id,
                kind: raw.part_type.unwrap_or_default(),
                body_clean: raw.body.as_deref().map(|b| cleaner.clean(b)),
                body_raw: raw.body,
                created_at: raw.created_at.unwrap_or(created_at),
                author_type: author.author_type,
                author_id: author.id,
                author_name: author.name,
                author_email: author.email,
            }
        })
        .collect();
    // Stable: parts sharing a timestamp keep payload order
    parts.sort_by_key(|p| p.created_at);

    let classify = |part: &ThreadPart| classify_part(part, reviewers);

    let notes: Vec<ClassifiedPart> = parts
        .iter()
        .filter(|p| p.kind == PART_NOTE)
        .map(classify)
        .collect();
    let admin_responses: Vec<ClassifiedPart> = parts
        .iter()
        .filter(|p| p.kind == PART_COMMENT && p.author_type.as_deref() == Some(AUTHOR_ADMIN))
        .map(classify)
        .collect();
    let user_messages: Vec<ClassifiedPart> = parts
        .iter()
        .filter(|p| p.kind == PART_COMMENT && p.author_type.as_deref() == Some(AUTHOR_USER))
        .map(classify)
        .collect();

    let totals = ThreadTotals {
        parts: parts.len(),
        comments: parts.iter().filter(|p| p.kind == PART_COMMENT).count(),
        notes: notes.len(),
    };

    Ok(ConversationThread {
        conversation_id: detail.id,
        state,
        created_at,
        updated_at,
        user,
        initial_message,
        parts,
        notes,
        admin_responses,
        user_messages,
        totals,
        materialized_at: now,
    })
}

/// Source author when it is an end user, otherwise the first linked contact.
fn resolve_user(
    source_author: Option<&AuthorRaw>,
    first_contact: Option<&ContactRefRaw>,
) -> Option<ThreadUser> {
    if let Some(author) = source_author {
        if author.author_type.as_deref() == Some(AUTHOR_USER) {
            if let Some(id) = author.id.clone() {
                return Some(ThreadUser {
                    id,
                    name: author.name.clone(),
                    email: author.email.clone(),
                });
            }
        }
    }

    first_contact.map(|c| ThreadUser {
        id: c.id.clone(),
        name: c.name.clone(),
        email: c.email.clone(),
    })
}

fn classify_part(part: &ThreadPart, reviewers: &ReviewerConfig) -> ClassifiedPart {
    let is_a = match (&reviewers.reviewer_a_admin_id, &part.author_id) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => false,
    };
    let is_b = match (&reviewers.reviewer_b_email, &part.author_email) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => false,
    };
    ClassifiedPart {
        part: part.clone(),
        is_from_designated_reviewer_a: is_a,
        is_from_designated_reviewer_b: is_b,
    }
}

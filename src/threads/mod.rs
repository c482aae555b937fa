//! Conversation threads.
//!
//! A thread is the materialized, chronologically ordered view of one
//! conversation: the opening message, every part, and the notes / admin
//! replies / user messages split out with reviewer flags.

pub mod builder;
pub mod cleaner;
pub mod materialize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Open,
    Closed,
    Snoozed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Author attached to a message or part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartAuthor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_raw: Option<String>,
    pub body_clean: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<PartAuthor>,
}

/// One entry of the conversation's chronological trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPart {
    pub id: String,
    /// Helpdesk part type: `comment`, `note`, `assignment`, `close`, ...
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_clean: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
}

/// A part copied into one of the derived sequences, with reviewer flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedPart {
    #[serde(flatten)]
    pub part: ThreadPart,
    pub is_from_designated_reviewer_a: bool,
    pub is_from_designated_reviewer_b: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadTotals {
    pub parts: usize,
    pub comments: usize,
    pub notes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationThread {
    pub conversation_id: String,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ThreadUser>,
    pub initial_message: InitialMessage,
    pub parts: Vec<ThreadPart>,
    pub notes: Vec<ClassifiedPart>,
    pub admin_responses: Vec<ClassifiedPart>,
    pub user_messages: Vec<ClassifiedPart>,
    pub totals: ThreadTotals,
    pub materialized_at: DateTime<Utc>,
}

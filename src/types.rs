use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::vote::VoteChoice;

/// Structural identity of a cached query: resource name plus the canonical
/// JSON encoding of its filter parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub resource: Arc<str>,
    pub params: Arc<str>,
}

impl QueryKey {
    pub fn new(resource: &str) -> Self {
        Self {
            resource: Arc::from(resource),
            params: Arc::from("null"),
        }
    }

    pub fn with_params<P: Serialize + ?Sized>(
        resource: &str,
        params: &P,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(params)?;
        let params = serde_jcs::to_string(&value).or_else(|_| serde_json::to_string(&value))?;

        Ok(Self {
            resource: Arc::from(resource),
            params: Arc::from(params.as_str()),
        })
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.as_ref() == "null" {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}{}", self.resource, self.params)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    pub stale: bool,
}

impl CacheEntry {
    pub fn fresh(value: Value) -> Self {
        Self {
            value,
            updated_at: Utc::now(),
            stale: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub content: String,
    pub upvotes: u32,
    pub downvotes: u32,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub comment_count: u32,
    #[serde(default)]
    pub user_vote: Option<VoteChoice>,
    pub author: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    pub content: String,
    pub upvotes: u32,
    pub downvotes: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user_vote: Option<VoteChoice>,
    pub author: User,
}

/// What a comment thread hangs off: a post, or another comment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommentTarget {
    #[serde(rename = "postId")]
    Post(String),
    #[serde(rename = "commentId")]
    Comment(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Active,
    Blocked,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConnectionStatus>,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    #[serde(default)]
    pub user: Option<User>,
}

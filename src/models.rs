//! Core data models shared across the vault index, retrieval, and chat.
//!
//! These types are what the index builder persists to the JSON snapshot and
//! what retrieval and the chat wrapper consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One indexed unit of a note: a whole file or one chunk of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Vault-relative path with `/` separators.
    pub path: String,
    /// Parsed frontmatter.
    #[serde(default)]
    pub yaml: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub headings: Vec<String>,
    pub text: String,
    /// Empty when the embedding request failed or the text was blank.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    /// SHA-256 hex digest of `text`.
    #[serde(default, rename = "lastHash", skip_serializing_if = "Option::is_none")]
    pub last_hash: Option<String>,
    /// Paths (without `.md`) of other notes sharing a tag.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

impl IndexEntry {
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }
}

/// Index as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub version: u32,
    /// Embedding model that produced the vectors.
    pub model: String,
    pub built_at: DateTime<Utc>,
    pub entries: Vec<IndexEntry>,
}

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat-completion message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

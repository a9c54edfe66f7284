// src/model.rs

use chrono::{DateTime, Utc};
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1_000;
/// `offset + limit` never exceeds Elasticsearch's default result window.
pub const MAX_OFFSET: usize = 9_000;

/// The durable image entity, keyed by `id` in both the document store and
/// the search index.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    pub url: String,
    pub description: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Ingestion input. Carries no identifier, one is assigned by the indexer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct IndexRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
}

/// Search-oriented view of an `ImageRecord`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SearchProjection {
    pub tags: String,
    pub created_at: DateTime<Utc>,
}

impl SearchProjection {
    pub fn from_record(record: &ImageRecord) -> Self {
        Self {
            tags: record.tags.join(", "),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindQuery {
    pub tag_filter: String,
    pub limit: usize,
    pub offset: usize,
}

impl Default for FindQuery {
    fn default() -> Self {
        Self {
            tag_filter: String::new(),
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl FindQuery {
    /// Lowercased filter tokens, split on whitespace and commas.
    pub fn tag_tokens(&self) -> Vec<String> {
        tokenize_tags(&self.tag_filter)
    }

    pub fn check_window(&self) -> Result<(), ValidationError> {
        if self.limit > MAX_PAGE_SIZE {
            return Err(ValidationError::invalid_param("limit"));
        }
        if self.offset > MAX_OFFSET {
            return Err(ValidationError::invalid_param("offset"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FindResult {
    pub items: Vec<ImageRecord>,
    pub count: usize,
    pub offset: usize,
}

pub fn tokenize_tags(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

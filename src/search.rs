use crate::error::BackendError;
use crate::model::{ImageRecord, SearchProjection, MAX_OFFSET, MAX_PAGE_SIZE};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Identifiers produced by a search, in rank order. Consumed once.
pub type SearchHits = BoxStream<'static, Result<String, BackendError>>;

/// Query expression understood by every `SearchIndex` backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagQuery {
    MatchAll,
    /// Projections whose tags contain every token.
    AllOf(Vec<String>),
}

impl TagQuery {
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        if tokens.is_empty() {
            TagQuery::MatchAll
        } else {
            TagQuery::AllOf(tokens)
        }
    }
}

/// Deepest hit a backend is asked to collect for one page.
pub const MAX_RESULT_WINDOW: usize = MAX_PAGE_SIZE + MAX_OFFSET;

/// `limit + offset`, refused when it overflows or exceeds `MAX_RESULT_WINDOW`.
pub fn result_window(limit: usize, offset: usize) -> Result<usize, BackendError> {
    limit
        .checked_add(offset)
        .filter(|window| *window <= MAX_RESULT_WINDOW)
        .ok_or_else(|| {
            BackendError::Generic(format!(
                "page limit {} offset {} is past the result window of {}",
                limit, offset, MAX_RESULT_WINDOW
            ))
        })
}

/// Token store holding `SearchProjection`s, ranked by recency.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn ensure_index_exists(&self) -> Result<(), BackendError>;
    async fn put(&self, id: &str, projection: &SearchProjection) -> Result<(), BackendError>;
    /// Returns ids only, newest first.
    async fn search(
        &self,
        query: &TagQuery,
        limit: usize,
        offset: usize,
    ) -> Result<SearchHits, BackendError>;
}

/// Keyed store for full records. Exact key lookup only.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ensure_store_exists(&self) -> Result<(), BackendError>;
    async fn put(&self, key: &str, record: &ImageRecord) -> Result<(), BackendError>;
    /// One slot per key, in key order; `None` for keys that are not stored.
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<ImageRecord>>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_window_refuses_deep_and_overflowing_pages() {
        assert_eq!(result_window(MAX_PAGE_SIZE, MAX_OFFSET).unwrap(), MAX_RESULT_WINDOW);
        assert!(result_window(MAX_RESULT_WINDOW, 1).is_err());
        assert!(result_window(1_000_000_000_000, 0).is_err());
        assert!(result_window(usize::MAX, usize::MAX).is_err());
    }
}

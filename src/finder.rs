use crate::error::FindError;
use crate::model::{FindQuery, FindResult};
use crate::search::{DocumentStore, SearchIndex, TagQuery};
use futures::TryStreamExt;
use std::sync::Arc;

/// Tag search over the projection index, resolved against the document store.
pub struct Finder {
    search_index: Arc<dyn SearchIndex>,
    documents: Arc<dyn DocumentStore>,
}

impl Finder {
    pub fn new(search_index: Arc<dyn SearchIndex>, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            search_index,
            documents,
        }
    }

    pub async fn find(&self, query: FindQuery) -> Result<FindResult, FindError> {
        query.check_window()?;
        let tag_query = TagQuery::from_tokens(query.tag_tokens());
        log::debug!(
            "Finding images with {:?}, limit {}, offset {}",
            tag_query,
            query.limit,
            query.offset
        );

        if query.limit == 0 {
            return Ok(FindResult {
                items: Vec::new(),
                count: 0,
                offset: query.offset,
            });
        }

        let keys: Vec<String> = self
            .search_index
            .search(&tag_query, query.limit, query.offset)
            .await
            .map_err(FindError::Search)?
            .try_collect()
            .await
            .map_err(FindError::Search)?;

        let items = if keys.is_empty() {
            Vec::new()
        } else {
            let slots = self
                .documents
                .get_multi(&keys)
                .await
                .map_err(FindError::Lookup)?;
            resolve_in_order(&keys, slots)?
        };

        log::debug!("Found {} images", items.len());
        Ok(FindResult {
            count: items.len(),
            items,
            offset: query.offset,
        })
    }
}

/// Every search hit must resolve; a missing record is surfaced, never skipped.
fn resolve_in_order<T>(keys: &[String], slots: Vec<Option<T>>) -> Result<Vec<T>, FindError> {
    let found = slots.iter().filter(|slot| slot.is_some()).count();
    let mut missing: Vec<String> = keys
        .iter()
        .zip(slots.iter())
        .filter(|(_, slot)| slot.is_none())
        .map(|(key, _)| key.clone())
        .collect();
    if slots.len() < keys.len() {
        missing.extend(keys[slots.len()..].iter().cloned());
    }

    if !missing.is_empty() || slots.len() != keys.len() {
        return Err(FindError::Consistency {
            expected: keys.len(),
            found,
            missing,
        });
    }
    Ok(slots.into_iter().flatten().collect())
}

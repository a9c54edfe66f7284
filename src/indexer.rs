use crate::error::{IndexError, ValidationError};
use crate::labeling::LabelingService;
use crate::model::{ImageRecord, IndexRequest, SearchProjection};
use crate::search::{DocumentStore, SearchIndex};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_MAX_LABELS: usize = 10;

/// Annotates, persists and indexes one image per call.
///
/// Each call mints a fresh id, so re-running a failed request stores a
/// second record rather than completing the first.
pub struct Indexer {
    labeler: Arc<dyn LabelingService>,
    documents: Arc<dyn DocumentStore>,
    search_index: Arc<dyn SearchIndex>,
    max_labels: usize,
}

pub fn validate_request(request: &IndexRequest) -> Result<(), ValidationError> {
    if request.url.trim().is_empty() {
        return Err(ValidationError::missing_url());
    }
    Ok(())
}

impl Indexer {
    pub fn new(
        labeler: Arc<dyn LabelingService>,
        documents: Arc<dyn DocumentStore>,
        search_index: Arc<dyn SearchIndex>,
        max_labels: usize,
    ) -> Self {
        Self {
            labeler,
            documents,
            search_index,
            max_labels,
        }
    }

    pub async fn index(&self, request: IndexRequest) -> Result<ImageRecord, IndexError> {
        validate_request(&request)?;
        let mut record = new_record(request);
        log::debug!("Indexing image {} as {}", record.url, record.id);

        self.annotate(&mut record).await?;

        self.documents
            .put(&record.id, &record)
            .await
            .map_err(|source| IndexError::Persist {
                id: record.id.clone(),
                source,
            })?;

        // From here on a failure leaves the record stored but unsearchable.
        self.search_index
            .put(&record.id, &SearchProjection::from_record(&record))
            .await
            .map_err(|source| IndexError::SearchIndex {
                id: record.id.clone(),
                source,
            })?;

        log::info!("Indexed image {} with id {}", record.url, record.id);
        Ok(record)
    }

    async fn annotate(&self, record: &mut ImageRecord) -> Result<(), IndexError> {
        let labels = self
            .labeler
            .detect_labels(&record.url, self.max_labels)
            .await
            .map_err(|source| IndexError::Annotation {
                url: record.url.clone(),
                source,
            })?;
        record.tags = labels.into_iter().map(|l| l.description).collect();
        log::info!("For image: {}, found tags: {:?}", record.url, record.tags);
        Ok(())
    }
}

fn new_record(request: IndexRequest) -> ImageRecord {
    ImageRecord {
        id: Uuid::new_v4().to_string(),
        url: request.url,
        description: request.description,
        tags: Vec::new(),
        created_at: Utc::now(),
    }
}

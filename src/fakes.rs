//! In-memory collaborators for tests.

use crate::error::{BackendError, TransportError};
use crate::ingestion::BatchTransport;
use crate::labeling::{Label, LabelingService};
use crate::model::{ImageRecord, IndexRequest, SearchProjection};
use crate::queue::{Task, TaskQueue};
use crate::search::{DocumentStore, SearchHits, SearchIndex, TagQuery};
use crate::stream_client::EventSource;
use crate::stream_filter::StreamEvent;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryDocumentStore {
    records: Mutex<HashMap<String, ImageRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryDocumentStore {
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn remove(&self, key: &str) {
        self.records.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ensure_store_exists(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn put(&self, key: &str, record: &ImageRecord) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("document store write refused".into()));
        }
        self.records.lock().unwrap().insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<ImageRecord>>, BackendError> {
        let records = self.records.lock().unwrap();
        Ok(keys.iter().map(|k| records.get(k).cloned()).collect())
    }
}

/// Ranks by `created_at` descending, ties broken by insertion order (newest first).
#[derive(Default)]
pub struct InMemorySearchIndex {
    entries: Mutex<Vec<(String, SearchProjection)>>,
    fail_writes: AtomicBool,
    /// Served after the regular hits, to simulate a cursor breaking mid-read.
    fail_mid_stream: AtomicBool,
}

impl InMemorySearchIndex {
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_mid_stream(&self) {
        self.fail_mid_stream.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn ensure_index_exists(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn put(&self, id: &str, projection: &SearchProjection) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("search index write refused".into()));
        }
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(existing, _)| existing != id);
        entries.push((id.to_string(), projection.clone()));
        Ok(())
    }

    async fn search(&self, query: &TagQuery, limit: usize, offset: usize) -> Result<SearchHits, BackendError> {
        let entries = self.entries.lock().unwrap();
        let mut matching: Vec<(usize, &String, &SearchProjection)> = entries
            .iter()
            .enumerate()
            .filter(|(_, (_, projection))| match query {
                TagQuery::MatchAll => true,
                TagQuery::AllOf(tokens) => {
                    let tags = crate::model::tokenize_tags(&projection.tags);
                    tokens.iter().all(|t| tags.contains(t))
                }
            })
            .map(|(position, (id, projection))| (position, id, projection))
            .collect();
        matching.sort_by(|a, b| b.2.created_at.cmp(&a.2.created_at).then(b.0.cmp(&a.0)));

        let mut hits: Vec<Result<String, BackendError>> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, id, _)| Ok(id.clone()))
            .collect();
        if self.fail_mid_stream.load(Ordering::SeqCst) {
            hits.push(Err(BackendError::Unavailable("search cursor lost".into())));
        }
        Ok(futures::stream::iter(hits).boxed())
    }
}

/// Answers every image with the same labels, or fails when configured to.
pub struct FakeLabeler {
    labels: Mutex<Vec<String>>,
    fail: AtomicBool,
    calls: Mutex<Vec<(String, usize)>>,
}

impl FakeLabeler {
    pub fn with_labels(labels: &[&str]) -> Self {
        Self {
            labels: Mutex::new(labels.iter().map(|l| l.to_string()).collect()),
            fail: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        let labeler = Self::with_labels(&[]);
        labeler.fail.store(true, Ordering::SeqCst);
        labeler
    }

    pub fn set_labels(&self, labels: &[&str]) {
        *self.labels.lock().unwrap() = labels.iter().map(|l| l.to_string()).collect();
    }

    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LabelingService for FakeLabeler {
    async fn detect_labels(&self, image_url: &str, max_labels: usize) -> Result<Vec<Label>, BackendError> {
        self.calls.lock().unwrap().push((image_url.to_string(), max_labels));
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                service: "image host",
                status: 404,
                body: format!("failed to download {}", image_url),
            });
        }
        Ok(self
            .labels
            .lock()
            .unwrap()
            .iter()
            .take(max_labels)
            .map(|d| Label { description: d.clone() })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    batches: Mutex<Vec<Vec<Task>>>,
    fail: AtomicBool,
}

impl RecordingQueue {
    pub fn failing() -> Self {
        let queue = Self::default();
        queue.fail.store(true, Ordering::SeqCst);
        queue
    }

    pub fn batches(&self) -> Vec<Vec<Task>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), BackendError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::QueueFull {
                requested: tasks.len(),
                available: 0,
            });
        }
        self.batches.lock().unwrap().push(tasks);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<Vec<IndexRequest>>>,
    fail: bool,
    hang: bool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<IndexRequest>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchTransport for RecordingTransport {
    async fn post_batch(&self, batch: &[IndexRequest]) -> Result<(), TransportError> {
        // let concurrent pushers interleave with an in-flight flush
        tokio::task::yield_now().await;
        self.batches.lock().unwrap().push(batch.to_vec());
        if self.hang {
            futures::future::pending::<()>().await;
        }
        if self.fail {
            return Err(TransportError::Delivery {
                target: "http://queue.invalid/queue-index".into(),
                source: BackendError::Unavailable("connection refused".into()),
            });
        }
        Ok(())
    }
}

pub struct VecEventSource {
    events: VecDeque<StreamEvent>,
}

impl VecEventSource {
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

#[async_trait]
impl EventSource for VecEventSource {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, BackendError> {
        Ok(self.events.pop_front())
    }
}

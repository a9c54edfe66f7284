use crate::config::AppConfig;
use crate::error::BackendError;
use crate::model::{ImageRecord, SearchProjection};
use crate::search::{result_window, DocumentStore, SearchHits, SearchIndex, TagQuery};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, FAST, INDEXED, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyError, Term};

const WRITER_MEMORY_BYTES: usize = 50_000_000;

/// One on-disk index with a shared writer and a manually reloaded reader.
#[derive(Clone)]
struct TantivyIndex {
    index: Index,
    reader: IndexReader,
    writer: Arc<Mutex<IndexWriter>>,
}

impl TantivyIndex {
    fn open(path: &Path, schema: Schema) -> Result<Self, BackendError> {
        log::debug!("Opening Tantivy index at {:?}", path);
        std::fs::create_dir_all(path)?;
        let directory = MmapDirectory::open(path).map_err(TantivyError::from)?;
        let index = Index::open_or_create(directory, schema)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer(WRITER_MEMORY_BYTES)?;
        Ok(Self {
            index,
            reader,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    /// Replaces whatever document is stored under `id_term` and makes it visible to readers.
    fn upsert(&self, id_term: Term, document: tantivy::Document) -> Result<(), BackendError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| BackendError::Generic("tantivy writer lock poisoned".into()))?;
        writer.delete_term(id_term);
        writer.add_document(document)?;
        writer.commit()?;
        log::trace!("Tantivy index writer committed changes.");
        self.reader.reload()?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct RecordFields {
    id: Field,
    body: Field,
}

#[derive(Clone, Copy)]
struct ProjectionFields {
    id: Field,
    tags: Field,
    created_at: Field,
}

/// Embedded engine: records and projections in two indices under `tantivy_index_path`.
pub struct TantivyBackend {
    records: TantivyIndex,
    record_fields: RecordFields,
    projections: TantivyIndex,
    projection_fields: ProjectionFields,
}

impl TantivyBackend {
    pub fn new(config: &AppConfig) -> Result<Self, BackendError> {
        Self::open(Path::new(&config.tantivy_index_path))
    }

    pub fn open(root: &Path) -> Result<Self, BackendError> {
        let mut records_schema = Schema::builder();
        let record_fields = RecordFields {
            id: records_schema.add_text_field("id", STRING | STORED),
            body: records_schema.add_text_field("body", STORED),
        };

        let mut projections_schema = Schema::builder();
        let projection_fields = ProjectionFields {
            id: projections_schema.add_text_field("id", STRING | STORED),
            tags: projections_schema.add_text_field("tags", TEXT),
            created_at: projections_schema.add_i64_field("created_at", INDEXED | STORED | FAST),
        };

        let records = TantivyIndex::open(&root.join("records"), records_schema.build())?;
        let projections = TantivyIndex::open(&root.join("projections"), projections_schema.build())?;
        log::debug!("Tantivy backend initialized at {:?}", root);

        Ok(Self {
            records,
            record_fields,
            projections,
            projection_fields,
        })
    }
}

/// Reduces filter tokens to the words the default tokenizer would produce,
/// so the query parser never sees its own syntax characters.
fn sanitize_tokens(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| t.replace(|c: char| !c.is_alphanumeric(), " "))
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl DocumentStore for TantivyBackend {
    async fn ensure_store_exists(&self) -> Result<(), BackendError> {
        // records/ was opened alongside projections/ in `open`
        Ok(())
    }

    async fn put(&self, key: &str, record: &ImageRecord) -> Result<(), BackendError> {
        let store = self.records.clone();
        let fields = self.record_fields;
        let key = key.to_string();
        let body = serde_json::to_string(record)?;

        tokio::task::spawn_blocking(move || {
            log::trace!("Storing record {} in Tantivy", key);
            let document = doc!(fields.id => key.as_str(), fields.body => body);
            store.upsert(Term::from_field_text(fields.id, &key), document)
        })
        .await?
    }

    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<ImageRecord>>, BackendError> {
        let store = self.records.clone();
        let fields = self.record_fields;
        let keys = keys.to_vec();

        tokio::task::spawn_blocking(move || {
            let searcher = store.reader.searcher();
            let mut records = Vec::with_capacity(keys.len());
            for key in &keys {
                let query = TermQuery::new(
                    Term::from_field_text(fields.id, key),
                    IndexRecordOption::Basic,
                );
                let top_docs = searcher.search(&query, &TopDocs::with_limit(1))?;
                let record = match top_docs.first() {
                    Some((_score, address)) => {
                        let stored = searcher.doc(*address)?;
                        let body = stored
                            .get_first(fields.body)
                            .and_then(|v| v.as_text())
                            .unwrap_or("");
                        Some(serde_json::from_str::<ImageRecord>(body)?)
                    }
                    None => {
                        log::trace!("No record stored under key {}", key);
                        None
                    }
                };
                records.push(record);
            }
            Ok::<_, BackendError>(records)
        })
        .await?
    }
}

#[async_trait]
impl SearchIndex for TantivyBackend {
    async fn ensure_index_exists(&self) -> Result<(), BackendError> {
        log::debug!("Tantivy index existence is handled during initialization.");
        Ok(())
    }

    async fn put(&self, id: &str, projection: &SearchProjection) -> Result<(), BackendError> {
        let store = self.projections.clone();
        let fields = self.projection_fields;
        let id = id.to_string();
        let tags = projection.tags.clone();
        let created_at = projection.created_at.timestamp_micros();

        tokio::task::spawn_blocking(move || {
            log::trace!("Indexing projection {} in Tantivy", id);
            let document = doc!(
                fields.id => id.as_str(),
                fields.tags => tags,
                fields.created_at => created_at,
            );
            store.upsert(Term::from_field_text(fields.id, &id), document)
        })
        .await?
    }

    async fn search(&self, query: &TagQuery, limit: usize, offset: usize) -> Result<SearchHits, BackendError> {
        if limit == 0 {
            return Ok(futures::stream::empty().boxed());
        }
        // the collector allocates for `limit + offset` hits up front
        result_window(limit, offset)?;
        let store = self.projections.clone();
        let fields = self.projection_fields;
        let query = query.clone();

        let ids = tokio::task::spawn_blocking(move || {
            log::debug!("Searching Tantivy with {:?}, limit {}, offset {}", query, limit, offset);
            let query_obj: Box<dyn Query> = match &query {
                TagQuery::MatchAll => Box::new(AllQuery),
                TagQuery::AllOf(tokens) => {
                    let words = sanitize_tokens(tokens);
                    if words.is_empty() {
                        return Ok(Vec::new());
                    }
                    let mut parser = QueryParser::for_index(&store.index, vec![fields.tags]);
                    parser.set_conjunction_by_default();
                    parser
                        .parse_query(&words)
                        .map_err(|e| BackendError::Generic(format!("invalid tag query: {}", e)))?
                }
            };

            let searcher = store.reader.searcher();
            let collector = TopDocs::with_limit(limit)
                .and_offset(offset)
                .order_by_fast_field::<i64>(fields.created_at);
            let top_docs = searcher.search(query_obj.as_ref(), &collector)?;

            let mut ids = Vec::with_capacity(top_docs.len());
            for (_created_at, address) in top_docs {
                let stored = searcher.doc(address)?;
                if let Some(id) = stored.get_first(fields.id).and_then(|v| v.as_text()) {
                    ids.push(id.to_string());
                }
            }
            log::debug!("Found {} ids in Tantivy", ids.len());
            Ok::<Vec<String>, BackendError>(ids)
        })
        .await??;

        Ok(futures::stream::iter(ids.into_iter().map(Ok)).boxed())
    }
}

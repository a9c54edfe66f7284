use crate::config::AppConfig;
use crate::error::BackendError;
use crate::model::{ImageRecord, SearchProjection};
use crate::search::{result_window, DocumentStore, SearchHits, SearchIndex, TagQuery};
use async_trait::async_trait;
use elasticsearch::{
    http::response::Response,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::{IndicesCreateParts, IndicesExistsParts},
    Elasticsearch, IndexParts, MgetParts, SearchParts,
};
use futures::StreamExt;
use serde_json::{json, Value};
use url::Url;

const RECORDS_INDEX: &str = "image_records";
const PROJECTIONS_INDEX: &str = "images";

/// Both stores on one cluster: full records in `image_records`, projections in `images`.
pub struct ElasticsearchBackend {
    client: Elasticsearch,
}

impl ElasticsearchBackend {
    pub fn new(config: &AppConfig) -> Result<Self, BackendError> {
        log::debug!("Creating Elasticsearch client for URL: {}", config.elasticsearch_url);
        let url = Url::parse(&config.elasticsearch_url)
            .map_err(|e| BackendError::Generic(format!("invalid elasticsearch_url: {}", e)))?;
        let conn_pool = SingleNodeConnectionPool::new(url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::Generic(format!("failed to build transport: {}", e)))?;
        let client = Elasticsearch::new(transport);
        log::trace!("Elasticsearch client created successfully.");
        Ok(Self { client })
    }

    async fn create_index_if_missing(&self, name: &str, mappings: Value) -> Result<(), BackendError> {
        log::debug!("Checking if Elasticsearch index '{}' exists.", name);
        let index_exists = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[name]))
            .send()
            .await?
            .status_code()
            .is_success();

        if index_exists {
            log::debug!("Elasticsearch index '{}' already exists.", name);
            return Ok(());
        }

        log::info!("Elasticsearch index '{}' does not exist. Creating it.", name);
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(name))
            .body(json!({ "mappings": mappings }))
            .send()
            .await?;
        ensure_success(response).await?;
        log::info!("Elasticsearch index '{}' created successfully.", name);
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Response, BackendError> {
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        service: "elasticsearch",
        status: status.as_u16(),
        body,
    })
}

fn query_body(query: &TagQuery) -> Value {
    let expr = match query {
        TagQuery::MatchAll => json!({ "match_all": {} }),
        TagQuery::AllOf(tokens) => json!({
            "match": {
                "tags": { "query": tokens.join(" "), "operator": "and" }
            }
        }),
    };
    json!({
        "query": expr,
        "sort": [{ "created_at": { "order": "desc" } }],
        "_source": false
    })
}

fn records_from_mget(body: &Value, keys: &[String]) -> Result<Vec<Option<ImageRecord>>, BackendError> {
    let docs = body["docs"].as_array().cloned().unwrap_or_default();
    let mut records = Vec::with_capacity(keys.len());
    for doc in docs {
        if doc["found"].as_bool() != Some(true) {
            records.push(None);
            continue;
        }
        let record: ImageRecord = serde_json::from_value(doc["_source"].clone())?;
        records.push(Some(record));
    }
    Ok(records)
}

#[async_trait]
impl DocumentStore for ElasticsearchBackend {
    async fn ensure_store_exists(&self) -> Result<(), BackendError> {
        self.create_index_if_missing(
            RECORDS_INDEX,
            json!({
                "properties": {
                    "id": { "type": "keyword" },
                    "url": { "type": "keyword", "index": false },
                    "description": { "type": "text", "index": false },
                    "tags": { "type": "keyword", "index": false },
                    "created_at": { "type": "date" }
                }
            }),
        )
        .await
    }

    async fn put(&self, key: &str, record: &ImageRecord) -> Result<(), BackendError> {
        log::trace!("Putting record {} into '{}'", key, RECORDS_INDEX);
        let response = self
            .client
            .index(IndexParts::IndexId(RECORDS_INDEX, key))
            .body(record)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<ImageRecord>>, BackendError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .mget(MgetParts::Index(RECORDS_INDEX))
            .body(json!({ "ids": keys }))
            .send()
            .await?;
        let body = ensure_success(response).await?.json::<Value>().await?;
        records_from_mget(&body, keys)
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchBackend {
    async fn ensure_index_exists(&self) -> Result<(), BackendError> {
        self.create_index_if_missing(
            PROJECTIONS_INDEX,
            json!({
                "properties": {
                    "tags": { "type": "text" },
                    "created_at": { "type": "date" }
                }
            }),
        )
        .await
    }

    async fn put(&self, id: &str, projection: &SearchProjection) -> Result<(), BackendError> {
        log::trace!("Indexing projection {} into '{}'", id, PROJECTIONS_INDEX);
        let response = self
            .client
            .index(IndexParts::IndexId(PROJECTIONS_INDEX, id))
            .body(projection)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn search(&self, query: &TagQuery, limit: usize, offset: usize) -> Result<SearchHits, BackendError> {
        log::debug!("Searching Elasticsearch with {:?}, limit {}, offset {}", query, limit, offset);
        result_window(limit, offset)?;
        let from = i64::try_from(offset).map_err(|e| BackendError::Generic(format!("offset {}: {}", offset, e)))?;
        let size = i64::try_from(limit).map_err(|e| BackendError::Generic(format!("limit {}: {}", limit, e)))?;
        let response = self
            .client
            .search(SearchParts::Index(&[PROJECTIONS_INDEX]))
            .from(from)
            .size(size)
            .body(query_body(query))
            .send()
            .await?;
        let body = ensure_success(response).await?.json::<Value>().await?;
        log::trace!("Elasticsearch search response: {:?}", body);

        let ids: Vec<String> = body["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| hit["_id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        log::debug!("Found {} ids in Elasticsearch", ids.len());
        Ok(futures::stream::iter(ids.into_iter().map(Ok)).boxed())
    }
}

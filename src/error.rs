use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use elasticsearch::Error as ElasticsearchError;
use serde_json::Error as SerdeJsonError;
use std::time::Duration;
use tantivy::TantivyError;
use thiserror::Error;
use tokio::task::JoinError;

pub const SERVER_ERROR_MESSAGE: &str = "An error occured, please try again later";
pub const INVALID_JSON_MESSAGE: &str = "The request payload must be a valid JSON";

/// Failure reported by an external collaborator (store, index, labeler, queue, HTTP peer).
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Elasticsearch error: {0}")]
    Elasticsearch(#[from] ElasticsearchError),

    #[error("Tantivy error: {0}")]
    Tantivy(#[from] TantivyError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    #[error("Tokio join error: {0}")]
    Join(#[from] JoinError),

    #[error("{service} responded with status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Queue is full: {requested} tasks requested, capacity for {available}")]
    QueueFull { requested: usize, available: usize },

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Generic error: {0}")]
    Generic(String),
}

/// Malformed client input. Mapped straight to a 400 and never logged as a server error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn missing_url() -> Self {
        ValidationError(r#"Missing "url" property"#.to_string())
    }

    pub fn invalid_param(name: &str) -> Self {
        ValidationError(format!(r#"Invalid value for parameter "{}""#, name))
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to compute tags for image {url}: {source}")]
    Annotation {
        url: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to put image {id} into the document store: {source}")]
    Persist {
        id: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to add image {id} to the search index: {source}")]
    SearchIndex {
        id: String,
        #[source]
        source: BackendError,
    },
}

#[derive(Error, Debug)]
pub enum FindError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to perform the search operation: {0}")]
    Search(#[source] BackendError),

    #[error("Failed to get images from the document store: {0}")]
    Lookup(#[source] BackendError),

    #[error("Search index returned {expected} ids but only {found} resolved in the document store, missing: {missing:?}")]
    Consistency {
        expected: usize,
        found: usize,
        missing: Vec<String>,
    },
}

/// Delivery failure of a batch (buffer flush or queue enqueue).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to encode batch: {0}")]
    Encode(#[from] SerdeJsonError),

    #[error("Delivery to {target} failed: {source}")]
    Delivery {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Client-facing error of the HTTP layer.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.0)
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let description = match self {
            ApiError::BadRequest(message) => message.as_str(),
            ApiError::Internal(_) => SERVER_ERROR_MESSAGE,
        };
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": true,
            "error_description": description,
        }))
    }

    fn status_code(&self) -> StatusCode {
        match *self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

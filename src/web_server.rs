use actix_web::{web, App, HttpResponse, HttpServer};
use serde_json::json;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use crate::dispatcher::Dispatcher;
use crate::error::{ApiError, FindError, IndexError, ValidationError, INVALID_JSON_MESSAGE};
use crate::finder::Finder;
use crate::indexer::Indexer;
use crate::model::{FindQuery, IndexRequest, DEFAULT_PAGE_SIZE};

/// Components shared by every worker; all of them are stateless per call.
pub struct AppState {
    pub indexer: Arc<Indexer>,
    pub finder: Arc<Finder>,
    pub dispatcher: Arc<Dispatcher>,
    pub request_timeout: Duration,
}

fn server_error(operation: &str, err: impl Display) -> ApiError {
    log::error!("Call to {} failed: {}", operation, err);
    ApiError::Internal(format!("{} failed", operation))
}

/// Bounds a whole call; dropping the future on expiry cancels every in-flight backend request.
async fn within_deadline<F, T, E>(state: &AppState, operation: &str, call: F) -> Result<Result<T, E>, ApiError>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::time::timeout(state.request_timeout, call)
        .await
        .map_err(|_| server_error(operation, format!("deadline of {:?} exceeded", state.request_timeout)))
}

fn parse_param(params: &HashMap<String, String>, name: &str, default: usize) -> Result<usize, ApiError> {
    match params.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ApiError::from(ValidationError::invalid_param(name))),
    }
}

fn build_find_query(params: &HashMap<String, String>) -> Result<FindQuery, ApiError> {
    let query = FindQuery {
        tag_filter: params.get("tags").cloned().unwrap_or_default(),
        limit: parse_param(params, "limit", DEFAULT_PAGE_SIZE)?,
        offset: parse_param(params, "offset", 0)?,
    };
    query.check_window()?;
    Ok(query)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        log::debug!("Rejecting invalid JSON payload: {}", e);
        ApiError::BadRequest(INVALID_JSON_MESSAGE.to_string())
    })
}

async fn list_images(
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, ApiError> {
    log::debug!("Received request for images with query: {:?}", query);
    let find_query = build_find_query(&query)?;

    match within_deadline(&state, "Finder.find", state.finder.find(find_query)).await? {
        Ok(result) => Ok(HttpResponse::Ok().json(result)),
        Err(FindError::Validation(e)) => Err(e.into()),
        Err(e) => Err(server_error("Finder.find", e)),
    }
}

async fn index_image(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse, ApiError> {
    let request: IndexRequest = parse_body(&body)?;

    match within_deadline(&state, "Indexer.index", state.indexer.index(request)).await? {
        Ok(_) => Ok(HttpResponse::Ok().json(json!({ "error": false }))),
        Err(IndexError::Validation(e)) => Err(e.into()),
        Err(e) => Err(server_error("Indexer.index", e)),
    }
}

async fn queue_index(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse, ApiError> {
    let requests: Vec<IndexRequest> = parse_body(&body)?;
    log::debug!("Received batch of {} index requests", requests.len());

    let report = within_deadline(&state, "Dispatcher.dispatch", state.dispatcher.dispatch(requests))
        .await?
        .map_err(|e| server_error("Dispatcher.dispatch", e))?;
    Ok(HttpResponse::Ok().json(json!({
        "error": false,
        "queued": report.queued,
        "rejected": report.rejected,
    })))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/find", web::get().to(list_images))
        .route("/index", web::post().to(index_image))
        .route("/queue-index", web::post().to(queue_index))
        .route("/health", web::get().to(health));
}

pub async fn start_web_server(port: u16, state: AppState) -> std::io::Result<()> {
    let state_data = web::Data::new(state);

    log::info!("Starting web server on port: {}", port);

    HttpServer::new(move || {
        App::new()
            .app_data(state_data.clone())
            .configure(routes)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

mod config;
mod dispatcher;
mod error;
#[cfg(test)]
mod fakes;
mod finder;
mod indexer;
mod ingestion;
mod labeling;
mod model;
mod queue;
mod search;
mod search_clients;
mod stream_client;
mod stream_filter;
mod web_server;

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::finder::Finder;
use crate::indexer::Indexer;
use crate::ingestion::{HttpBatchTransport, IngestionBuffer};
use crate::labeling::VisionLabeler;
use crate::queue::HttpPushQueue;
use crate::search::{DocumentStore, SearchIndex};
use crate::search_clients::{elasticsearch::ElasticsearchBackend, tantivy::TantivyBackend};
use crate::stream_client::HttpEventSource;
use crate::web_server::AppState;
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "image-stream-indexer", about = "Tags, indexes and searches images found in a live event stream")]
struct Cli {
    /// Directory holding default.toml and its overrides
    #[arg(long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the search and indexing API together with the indexing queue
    Serve,
    /// Read the event stream and forward image batches to the queue endpoint
    Stream,
}

fn build_stores(config: &AppConfig) -> Result<(Arc<dyn DocumentStore>, Arc<dyn SearchIndex>)> {
    if config.engine == "elasticsearch" {
        let backend = Arc::new(ElasticsearchBackend::new(config)?);
        let documents: Arc<dyn DocumentStore> = backend.clone();
        let search_index: Arc<dyn SearchIndex> = backend;
        Ok((documents, search_index))
    } else {
        let backend = Arc::new(TantivyBackend::new(config)?);
        let documents: Arc<dyn DocumentStore> = backend.clone();
        let search_index: Arc<dyn SearchIndex> = backend;
        Ok((documents, search_index))
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let (documents, search_index) = build_stores(&config)?;
    documents.ensure_store_exists().await?;
    search_index.ensure_index_exists().await?;

    let cancel = CancellationToken::new();
    let queue = Arc::new(HttpPushQueue::start(&config.queue, cancel.clone())?);
    let labeler = Arc::new(VisionLabeler::new(&config.labeling)?);

    let state = AppState {
        indexer: Arc::new(Indexer::new(
            labeler,
            documents.clone(),
            search_index.clone(),
            config.labeling.max_labels,
        )),
        finder: Arc::new(Finder::new(search_index, documents)),
        dispatcher: Arc::new(Dispatcher::new(queue)),
        request_timeout: config.request_timeout(),
    };

    let result = web_server::start_web_server(config.web_port, state).await;
    cancel.cancel();
    result?;
    Ok(())
}

async fn stream(config: AppConfig) -> Result<()> {
    let stream_config = config.stream;
    let transport = Arc::new(HttpBatchTransport::new(
        &stream_config.queue_index_endpoint,
        stream_config.flush_timeout(),
    )?);
    let buffer = Arc::new(IngestionBuffer::new(
        transport,
        stream_config.buffer_threshold,
        stream_config.flush_timeout(),
    ));
    let source = HttpEventSource::connect(&stream_config).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, flushing buffered requests");
            shutdown.cancel();
        }
    });

    ingestion::run_ingestion(Box::new(source), buffer, stream_config.flush_interval(), cancel).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new(&cli.config_dir)?;

    // Initialize env_logger based on config.log_level
    env_logger::Builder::new()
        .filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    info!("Starting image-stream-indexer ({:?})", cli.command);

    match cli.command {
        Command::Serve => serve(config).await?,
        Command::Stream => stream(config).await?,
    }

    info!("Image-stream-indexer finished");

    Ok(())
}

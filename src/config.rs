use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: String,
    pub elasticsearch_url: String,
    pub tantivy_index_path: String,
    pub web_port: u16,
    pub log_level: String,
    pub request_timeout_secs: u64,
    pub labeling: LabelingConfig,
    pub queue: QueueConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelingConfig {
    pub vision_endpoint: String,
    #[serde(default)]
    pub vision_api_key: String,
    #[serde(default = "default_max_labels")]
    pub max_labels: usize,
    pub timeout_secs: u64,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Base URL the push queue delivers tasks to, usually this server.
    pub target_base_url: String,
    pub workers: usize,
    pub capacity: usize,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default)]
    pub bearer_token: String,
    pub queue_index_endpoint: String,
    pub buffer_threshold: usize,
    pub flush_interval_secs: u64,
    pub flush_timeout_secs: u64,
}

fn default_max_labels() -> usize {
    crate::indexer::DEFAULT_MAX_LABELS
}

fn default_max_image_bytes() -> usize {
    crate::labeling::DEFAULT_MAX_IMAGE_BYTES
}

impl AppConfig {
    pub fn new(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)))
            .add_source(File::with_name(&format!("{}/{}", config_dir, env)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            .add_source(Environment::with_prefix("IMAGES").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

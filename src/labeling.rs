use crate::config::LabelingConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub description: String,
}

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 7 * 1024 * 1024;

/// Image labeling collaborator.
#[async_trait]
pub trait LabelingService: Send + Sync {
    /// Labels in the order the service ranks them.
    async fn detect_labels(&self, image_url: &str, max_labels: usize) -> Result<Vec<Label>, BackendError>;
}

/// Cloud Vision `images:annotate` client. Downloads the image itself and
/// sends the bytes inline.
pub struct VisionLabeler {
    client: Client,
    annotate_url: Url,
    max_image_bytes: usize,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize)]
struct AnnotateImageResponse {
    #[serde(default, rename = "labelAnnotations")]
    label_annotations: Vec<Label>,
    error: Option<VisionStatus>,
}

#[derive(Deserialize)]
struct VisionStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl VisionLabeler {
    pub fn new(config: &LabelingConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let annotate_url = Url::parse_with_params(
            &config.vision_endpoint,
            &[("key", config.vision_api_key.as_str())],
        )
        .map_err(|e| BackendError::Generic(format!("invalid vision_endpoint: {}", e)))?;
        Ok(Self {
            client,
            annotate_url,
            max_image_bytes: config.max_image_bytes,
        })
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        log::trace!("Downloading image at {}", url);
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                service: "image host",
                status: status.as_u16(),
                body: format!("failed to download {}", url),
            });
        }
        if let Some(declared) = response.content_length() {
            check_image_size(url, declared, self.max_image_bytes)?;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            check_image_size(url, (bytes.len() + chunk.len()) as u64, self.max_image_bytes)?;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

fn check_image_size(url: &str, size: u64, limit: usize) -> Result<(), BackendError> {
    if size > limit as u64 {
        return Err(BackendError::Generic(format!(
            "image at {} is larger than {} bytes",
            url, limit
        )));
    }
    Ok(())
}

#[async_trait]
impl LabelingService for VisionLabeler {
    async fn detect_labels(&self, image_url: &str, max_labels: usize) -> Result<Vec<Label>, BackendError> {
        let bytes = self.fetch_image(image_url).await?;
        log::debug!("Fetched {} bytes from {}, requesting labels", bytes.len(), image_url);

        let response = self
            .client
            .post(self.annotate_url.clone())
            .json(&json!({
                "requests": [{
                    "image": { "content": STANDARD.encode(&bytes) },
                    "features": [{ "type": "LABEL_DETECTION", "maxResults": max_labels }]
                }]
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                service: "vision",
                status: status.as_u16(),
                body,
            });
        }

        let body: AnnotateResponse = response.json().await?;
        let first = body
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Generic("vision returned no annotation response".into()))?;
        if let Some(err) = first.error {
            return Err(BackendError::Generic(format!(
                "vision label detection failed ({}): {}",
                err.code, err.message
            )));
        }
        Ok(first.label_annotations)
    }
}

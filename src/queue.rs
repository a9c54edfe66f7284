use crate::config::QueueConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use reqwest::{Client, Method};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One unit of deferred work, delivered as an HTTP request to `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub path: String,
    pub method: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Accepts every task or none of them.
    async fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), BackendError>;
}

/// In-process push queue. Workers deliver tasks to `target_base_url` and
/// own the retry policy.
pub struct HttpPushQueue {
    sender: mpsc::Sender<Task>,
}

#[derive(Clone)]
struct Delivery {
    client: Client,
    base_url: String,
    max_attempts: u32,
}

impl HttpPushQueue {
    pub fn start(config: &QueueConfig, cancel: CancellationToken) -> Result<Self, BackendError> {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let delivery = Delivery {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            base_url: config.target_base_url.trim_end_matches('/').to_string(),
            max_attempts: config.max_attempts.max(1),
        };

        log::info!(
            "Starting push queue with {} workers delivering to {}",
            config.workers,
            delivery.base_url
        );
        for worker in 0..config.workers.max(1) {
            tokio::spawn(run_worker(
                worker,
                receiver.clone(),
                delivery.clone(),
                cancel.clone(),
            ));
        }

        Ok(Self { sender })
    }
}

#[async_trait]
impl TaskQueue for HttpPushQueue {
    async fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), BackendError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let requested = tasks.len();
        let permits = self.sender.try_reserve_many(requested).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BackendError::QueueFull {
                requested,
                available: self.sender.capacity(),
            },
            mpsc::error::TrySendError::Closed(_) => {
                BackendError::Unavailable("push queue workers have stopped".into())
            }
        })?;
        for (permit, task) in permits.zip(tasks) {
            permit.send(task);
        }
        log::debug!("Queued {} tasks", requested);
        Ok(())
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    delivery: Delivery,
    cancel: CancellationToken,
) {
    log::debug!("Queue worker {} started", worker);
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(task) = task else { break };
        if let Err(e) = delivery.deliver(&task).await {
            log::error!("Dropping task {} {}: {}", task.method, task.path, e);
        }
    }
    log::debug!("Queue worker {} stopped", worker);
}

enum Attempt {
    Retry(BackendError),
    GiveUp(BackendError),
}

impl Delivery {
    async fn deliver(&self, task: &Task) -> Result<(), BackendError> {
        let mut backoff = ExponentialBackoff {
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            log::trace!("Delivering {} {} (attempt {})", task.method, task.path, attempts);
            let err = match self.attempt(task).await {
                Ok(()) => return Ok(()),
                Err(Attempt::GiveUp(e)) => return Err(e),
                Err(Attempt::Retry(e)) => e,
            };
            if attempts >= self.max_attempts {
                log::error!("Max delivery attempts exceeded for {}", task.path);
                return Err(err);
            }
            match backoff.next_backoff() {
                Some(duration) => {
                    log::warn!("Delivery of {} failed, retrying in {:?}: {}", task.path, duration, err);
                    tokio::time::sleep(duration).await;
                }
                None => return Err(err),
            }
        }
    }

    async fn attempt(&self, task: &Task) -> Result<(), Attempt> {
        let method = Method::from_bytes(task.method.as_bytes())
            .map_err(|e| Attempt::GiveUp(BackendError::Generic(format!("invalid method: {}", e))))?;
        let url = format!("{}{}", self.base_url, task.path);
        let response = self
            .client
            .request(method, &url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(task.payload.clone())
            .send()
            .await
            .map_err(|e| Attempt::Retry(e.into()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let err = BackendError::Status {
            service: "task target",
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        };
        // The target rejected the payload itself, another attempt cannot succeed.
        if status.is_client_error() {
            Err(Attempt::GiveUp(err))
        } else {
            Err(Attempt::Retry(err))
        }
    }
}

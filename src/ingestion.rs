use crate::error::{BackendError, TransportError};
use crate::model::IndexRequest;
use crate::stream_client::EventSource;
use crate::stream_filter::inspect_event;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Capacity of the handoff between the stream reader and the buffer driver.
const HANDOFF_CAPACITY: usize = 1024;

/// Number of requests delivered, or why delivery failed.
pub type FlushOutcome = Result<usize, TransportError>;

/// Downstream endpoint for flushed batches.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn post_batch(&self, batch: &[IndexRequest]) -> Result<(), TransportError>;
}

/// Posts each batch as a JSON array to the queue endpoint.
pub struct HttpBatchTransport {
    client: Client,
    endpoint: String,
}

impl HttpBatchTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn post_batch(&self, batch: &[IndexRequest]) -> Result<(), TransportError> {
        let body = serde_json::to_vec(batch)?;
        let delivery_error = |source: BackendError| TransportError::Delivery {
            target: self.endpoint.clone(),
            source,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| delivery_error(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(delivery_error(BackendError::Status {
                service: "queue endpoint",
                status: status.as_u16(),
                body,
            }));
        }
        Ok(())
    }
}

/// Accumulates index requests and hands them to the transport in batches.
///
/// Draining happens inside the same critical section as appending, so a
/// request is either in the buffer or in exactly one flushed batch. Delivery
/// is best-effort: a failed batch is logged and dropped.
pub struct IngestionBuffer {
    requests: Mutex<Vec<IndexRequest>>,
    threshold: usize,
    flush_timeout: Duration,
    transport: Arc<dyn BatchTransport>,
}

impl IngestionBuffer {
    pub fn new(transport: Arc<dyn BatchTransport>, threshold: usize, flush_timeout: Duration) -> Self {
        Self {
            requests: Mutex::new(Vec::with_capacity(threshold + 1)),
            threshold,
            flush_timeout,
            transport,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<IndexRequest>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a request; flushes when the buffer grows past the threshold.
    pub async fn push(&self, request: IndexRequest) -> Option<FlushOutcome> {
        let batch = {
            let mut requests = self.lock();
            requests.push(request);
            if requests.len() > self.threshold {
                Some(std::mem::take(&mut *requests))
            } else {
                None
            }
        };
        match batch {
            Some(batch) => Some(self.deliver(batch).await),
            None => None,
        }
    }

    /// Flushes whatever is buffered. A no-op on an empty buffer.
    pub async fn flush(&self) -> Option<FlushOutcome> {
        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return None;
        }
        Some(self.deliver(batch).await)
    }

    async fn deliver(&self, batch: Vec<IndexRequest>) -> FlushOutcome {
        let count = batch.len();
        log::info!("About to flush {} index requests", count);
        let outcome = match tokio::time::timeout(self.flush_timeout, self.transport.post_batch(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.flush_timeout)),
        };
        match outcome {
            Ok(()) => {
                log::info!("Flush of {} index requests done", count);
                Ok(count)
            }
            Err(e) => {
                log::error!("Failed to flush {} index requests, dropping them: {}", count, e);
                Err(e)
            }
        }
    }
}

/// Drives the buffer: appends handed-off requests, flushes on a timer, and
/// flushes once more on shutdown or when the handoff closes.
pub async fn run_buffer(
    buffer: Arc<IngestionBuffer>,
    mut requests: mpsc::Receiver<IndexRequest>,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let flush_interval = flush_interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("Buffer driver cancelled");
                break;
            }
            request = requests.recv() => match request {
                Some(request) => {
                    buffer.push(request).await;
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    log::debug!("Flush interval elapsed with {} buffered requests", buffer.len());
                    buffer.flush().await;
                }
            }
        }
    }

    while let Ok(request) = requests.try_recv() {
        buffer.push(request).await;
    }
    buffer.flush().await;
}

/// Reads the stream until it ends, fails, or `cancel` fires, forwarding
/// photo events to the buffer.
pub async fn run_ingestion(
    mut source: Box<dyn EventSource>,
    buffer: Arc<IngestionBuffer>,
    flush_interval: Duration,
    cancel: CancellationToken,
) -> Result<(), BackendError> {
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    let driver = tokio::spawn(run_buffer(buffer, rx, flush_interval, cancel.clone()));

    log::info!("Start listening on stream events...");
    let result = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            event = source.next_event() => event,
        };
        match event {
            Ok(Some(event)) => {
                if let Some(request) = inspect_event(&event) {
                    log::debug!("Forwarding image {}", request.url);
                    if tx.send(request).await.is_err() {
                        break Ok(());
                    }
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    drop(tx);
    driver.await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{RecordingTransport, VecEventSource};
    use crate::stream_filter::{Entities, Media, StreamEvent};

    fn request(n: usize) -> IndexRequest {
        IndexRequest {
            url: format!("http://x/{}.jpg", n),
            description: format!("image {}", n),
        }
    }

    fn buffer(transport: Arc<RecordingTransport>, threshold: usize) -> Arc<IngestionBuffer> {
        Arc::new(IngestionBuffer::new(transport, threshold, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn exceeding_threshold_flushes_everything_once() {
        let transport = Arc::new(RecordingTransport::default());
        let buffer = buffer(transport.clone(), 50);

        for n in 0..50 {
            assert!(buffer.push(request(n)).await.is_none());
        }
        let outcome = buffer.push(request(50)).await;
        assert_eq!(outcome.unwrap().unwrap(), 51);
        assert!(buffer.is_empty());

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], (0..51).map(request).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_flush_still_clears_the_buffer() {
        let transport = Arc::new(RecordingTransport::failing());
        let buffer = buffer(transport.clone(), 2);

        buffer.push(request(0)).await;
        buffer.push(request(1)).await;
        let outcome = buffer.push(request(2)).await.unwrap();
        assert!(matches!(outcome, Err(TransportError::Delivery { .. })));
        assert!(buffer.is_empty());
        assert_eq!(transport.batches().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pushes_are_delivered_exactly_once() {
        let transport = Arc::new(RecordingTransport::default());
        let buffer = buffer(transport.clone(), 3);

        let pushers: Vec<_> = (0..8)
            .map(|worker| {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    for n in 0..50 {
                        buffer.push(request(worker * 50 + n)).await;
                    }
                })
            })
            .collect();
        for pusher in pushers {
            pusher.await.unwrap();
        }
        buffer.flush().await;

        assert!(buffer.is_empty());
        let mut delivered: Vec<String> = transport
            .batches()
            .into_iter()
            .flatten()
            .map(|r| r.url)
            .collect();
        delivered.sort();
        let mut expected: Vec<String> = (0..400).map(|n| request(n).url).collect();
        expected.sort();
        assert_eq!(delivered, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_transport_is_cut_off() {
        let transport = Arc::new(RecordingTransport::hanging());
        let buffer = Arc::new(IngestionBuffer::new(transport, 0, Duration::from_secs(30)));

        let outcome = buffer.push(request(0)).await.unwrap();
        assert!(matches!(outcome, Err(TransportError::Timeout(_))));
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batch() {
        let transport = Arc::new(RecordingTransport::default());
        let buffer = buffer(transport.clone(), 50);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(run_buffer(buffer.clone(), rx, Duration::from_secs(10), cancel.clone()));

        tx.send(request(0)).await.unwrap();
        tx.send(request(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(transport.batches(), vec![vec![request(0), request(1)]]);
        assert!(buffer.is_empty());
        cancel.cancel();
        driver.await.unwrap();
        assert_eq!(transport.batches().len(), 1);
    }

    #[tokio::test]
    async fn stream_end_flushes_filtered_requests_in_order() {
        let photo = |text: &str, kind: &str| StreamEvent {
            text: text.to_string(),
            entities: Entities {
                media: vec![Media {
                    media_type: kind.to_string(),
                    media_url: format!("http://x/{}.jpg", text),
                }],
            },
        };
        let source = VecEventSource::new(vec![
            photo("a", "photo"),
            photo("b", "video"),
            StreamEvent::default(),
            photo("c", "photo"),
        ]);
        let transport = Arc::new(RecordingTransport::default());
        let buffer = buffer(transport.clone(), 50);

        run_ingestion(Box::new(source), buffer.clone(), Duration::from_secs(3600), CancellationToken::new())
            .await
            .unwrap();

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        let urls: Vec<&str> = batches[0].iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["http://x/a.jpg", "http://x/c.jpg"]);
        assert!(buffer.is_empty());
    }
}

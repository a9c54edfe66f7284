use crate::error::{TransportError, ValidationError};
use crate::indexer::validate_request;
use crate::model::IndexRequest;
use crate::queue::{Task, TaskQueue};
use serde::Serialize;
use std::sync::Arc;

pub const INDEX_TASK_PATH: &str = "/index";
pub const INDEX_TASK_METHOD: &str = "POST";

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub position: usize,
    pub error_description: String,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub queued: usize,
    pub rejected: Vec<Rejection>,
}

/// Fans a batch of index requests out into one queued indexing task each.
pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    /// Invalid elements are reported individually; the rest go to the queue in
    /// one call, which either takes all of them or fails the batch.
    pub async fn dispatch(&self, requests: Vec<IndexRequest>) -> Result<DispatchReport, TransportError> {
        let mut report = DispatchReport::default();
        let mut tasks = Vec::with_capacity(requests.len());

        for (position, request) in requests.iter().enumerate() {
            if let Err(ValidationError(message)) = validate_request(request) {
                log::debug!("Rejecting index request at position {}: {}", position, message);
                report.rejected.push(Rejection {
                    position,
                    error_description: message,
                });
                continue;
            }
            tasks.push(Task {
                path: INDEX_TASK_PATH.to_string(),
                method: INDEX_TASK_METHOD.to_string(),
                payload: serde_json::to_vec(request)?,
            });
        }

        if tasks.is_empty() {
            return Ok(report);
        }

        let count = tasks.len();
        self.queue
            .enqueue_batch(tasks)
            .await
            .map_err(|source| TransportError::Delivery {
                target: "task queue".to_string(),
                source,
            })?;
        report.queued = count;
        log::info!("Queued {} index tasks, rejected {}", count, report.rejected.len());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingQueue;

    fn request(url: &str) -> IndexRequest {
        IndexRequest {
            url: url.to_string(),
            description: "desc".to_string(),
        }
    }

    #[tokio::test]
    async fn one_task_per_request_in_order() {
        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = Dispatcher::new(queue.clone());

        let report = dispatcher
            .dispatch(vec![request("http://x/a.jpg"), request("http://x/b.jpg")])
            .await
            .unwrap();

        assert_eq!(report.queued, 2);
        assert!(report.rejected.is_empty());
        let batches = queue.batches();
        assert_eq!(batches.len(), 1);
        let tasks = &batches[0];
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.path == "/index" && t.method == "POST"));
        let decoded: IndexRequest = serde_json::from_slice(&tasks[1].payload).unwrap();
        assert_eq!(decoded, request("http://x/b.jpg"));
    }

    #[tokio::test]
    async fn empty_url_rejects_only_that_element() {
        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = Dispatcher::new(queue.clone());

        let report = dispatcher
            .dispatch(vec![request("http://x/a.jpg"), request(""), request("http://x/c.jpg")])
            .await
            .unwrap();

        assert_eq!(report.queued, 2);
        assert_eq!(
            report.rejected,
            vec![Rejection {
                position: 1,
                error_description: r#"Missing "url" property"#.to_string()
            }]
        );
        assert_eq!(queue.batches()[0].len(), 2);
    }

    #[tokio::test]
    async fn all_invalid_batch_never_reaches_the_queue() {
        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = Dispatcher::new(queue.clone());

        let report = dispatcher.dispatch(vec![request("")]).await.unwrap();
        assert_eq!(report.queued, 0);
        assert_eq!(report.rejected.len(), 1);
        assert!(queue.batches().is_empty());
    }

    #[tokio::test]
    async fn queue_failure_fails_the_whole_batch() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingQueue::failing()));
        let err = dispatcher
            .dispatch(vec![request("http://x/a.jpg"), request("http://x/b.jpg")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Delivery { .. }));
    }
}

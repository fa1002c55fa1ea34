use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{FetchCallbacks, SegmentFetcher};
use crate::error::DownloadError;
use crate::metrics::NetworkMetrics;
use crate::model::SegmentContext;
use crate::prioritizer::{TaskId, TaskObserver, TaskPrioritizer};

/// A segment request registered in the prioritizer.
pub struct SegmentRequest {
    pub id: TaskId,
    /// Must be polled for the request to make progress. Dropping it cancels the request.
    pub future: BoxFuture<'static, Result<(), DownloadError>>,
}

/// Forwards prioritizer lifecycle events to the request callbacks.
struct Lifecycle {
    callbacks: Arc<dyn FetchCallbacks>,
    metrics: Option<Arc<NetworkMetrics>>,
}

impl TaskObserver for Lifecycle {
    fn before_interrupted(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_interruption();
        }
        self.callbacks.before_interrupted();
    }

    fn before_ended(&self) {
        self.callbacks.before_ended();
    }
}

/// [`SegmentFetcher`] whose requests are scheduled by a shared [`TaskPrioritizer`].
#[derive(Clone)]
pub struct PrioritizedSegmentFetcher {
    fetcher: Arc<SegmentFetcher>,
    prioritizer: TaskPrioritizer,
}

impl PrioritizedSegmentFetcher {
    pub fn new(fetcher: Arc<SegmentFetcher>, prioritizer: TaskPrioritizer) -> Self {
        Self {
            fetcher,
            prioritizer,
        }
    }

    pub fn fetcher(&self) -> &Arc<SegmentFetcher> {
        &self.fetcher
    }

    pub fn prioritizer(&self) -> &TaskPrioritizer {
        &self.prioritizer
    }

    /// Registers a segment request with the given priority. An interrupted request
    /// restarts its fetch from scratch.
    pub fn create_request(
        &self,
        context: SegmentContext,
        priority: u32,
        callbacks: Arc<dyn FetchCallbacks>,
        token: CancellationToken,
    ) -> SegmentRequest {
        let fetcher = Arc::clone(&self.fetcher);
        let task_callbacks = Arc::clone(&callbacks);
        let observer = Arc::new(Lifecycle {
            callbacks,
            metrics: self.fetcher.metrics().cloned(),
        });

        let (id, task) = self.prioritizer.create(
            move |run_token| {
                let fetcher = Arc::clone(&fetcher);
                let context = context.clone();
                let callbacks = Arc::clone(&task_callbacks);
                async move { fetcher.fetch(&context, callbacks.as_ref(), &run_token).await }
            },
            priority,
            observer,
            token,
        );

        SegmentRequest {
            id,
            future: task.map(|result| result.map_err(DownloadError::from)).boxed(),
        }
    }

    pub fn update_priority(&self, id: TaskId, priority: u32) {
        self.prioritizer.update_priority(id, priority);
    }

    /// Removes the request from the prioritizer right away.
    pub fn cancel(&self, id: TaskId) {
        self.prioritizer.cancel(id);
    }
}

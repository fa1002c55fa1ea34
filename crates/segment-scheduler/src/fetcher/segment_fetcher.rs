// Segment Fetcher: Loads one segment through the retry engine and hands its chunks to
// the caller, unparsed.

use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::chunk::{ParseTracker, SegmentChunk};
use super::init_cache::InitSegmentCache;
use super::FetchCallbacks;
use crate::cdn::CdnPrioritizer;
use crate::config::FetcherConfig;
use crate::error::DownloadError;
use crate::metrics::{MetricsListener, NetworkMetrics};
use crate::model::{BufferType, SegmentContext};
use crate::retry::schedule_request_with_cdns;
use crate::transport::{LoaderOptions, LoaderResponse, SegmentPipeline};

/// Fetches the segments of one buffer type.
pub struct SegmentFetcher {
    buffer_type: BufferType,
    pipeline: SegmentPipeline,
    cdn_prioritizer: Option<Arc<CdnPrioritizer>>,
    config: FetcherConfig,
    /// Only for audio and video.
    init_cache: Option<InitSegmentCache>,
    metrics: Option<Arc<NetworkMetrics>>,
    metrics_listener: Option<Arc<dyn MetricsListener>>,
}

impl SegmentFetcher {
    pub fn new(
        buffer_type: BufferType,
        pipeline: SegmentPipeline,
        cdn_prioritizer: Option<Arc<CdnPrioritizer>>,
        config: FetcherConfig,
    ) -> Self {
        let init_cache = (buffer_type.caches_init_segments() && config.init_cache_capacity > 0)
            .then(|| InitSegmentCache::new(config.init_cache_capacity));
        Self {
            buffer_type,
            pipeline,
            cdn_prioritizer,
            config,
            init_cache,
            metrics: None,
            metrics_listener: None,
        }
    }

    /// Records request counters in `metrics`, which also receives per-segment
    /// measurements unless another listener is set.
    pub fn with_metrics(mut self, metrics: Arc<NetworkMetrics>) -> Self {
        if self.metrics_listener.is_none() {
            self.metrics_listener = Some(Arc::clone(&metrics) as Arc<dyn MetricsListener>);
        }
        self.metrics = Some(metrics);
        self
    }

    pub fn with_metrics_listener(mut self, listener: Arc<dyn MetricsListener>) -> Self {
        self.metrics_listener = Some(listener);
        self
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn metrics(&self) -> Option<&Arc<NetworkMetrics>> {
        self.metrics.as_ref()
    }

    pub fn init_cache(&self) -> Option<&InitSegmentCache> {
        self.init_cache.as_ref()
    }

    /// Fetches one segment, reporting its chunks and completion through `callbacks`.
    ///
    /// Resolves once every chunk was delivered. Fails with the last error once every
    /// candidate CDN is exhausted, or with [`DownloadError::Cancelled`].
    #[instrument(skip_all, fields(segment = %context.label()))]
    pub async fn fetch(
        &self,
        context: &SegmentContext,
        callbacks: &dyn FetchCallbacks,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let segment = &context.segment;
        let parser = Arc::clone(&self.pipeline.parser);

        if segment.is_init {
            if let Some(cache) = &self.init_cache {
                if let Some(data) = cache.get(context) {
                    debug!("Initialization segment served from cache");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cache_hit();
                    }
                    callbacks.on_chunk(SegmentChunk::new(
                        data,
                        false,
                        context.clone(),
                        parser,
                        None,
                    ));
                    callbacks.on_all_chunks_received();
                    return Ok(());
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_miss();
                }
            }
        }

        let tracker = self
            .metrics_listener
            .as_ref()
            .map(|listener| Arc::new(ParseTracker::new(context.clone(), Arc::clone(listener))));
        let options = LoaderOptions {
            connection_timeout: self.config.connection_timeout,
            // Init segments are always parsed and cached whole.
            chunked: self.config.low_latency_mode && !segment.is_init,
        };
        let options = &options;

        let response = schedule_request_with_cdns(
            context.representation.cdn_metadata.as_deref(),
            self.cdn_prioritizer.as_deref(),
            |cdn, attempt_token| {
                let tracker = tracker.clone();
                let parser = Arc::clone(&parser);
                async move {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_request();
                    }
                    let on_chunk = |data: Bytes| {
                        trace!(size = data.len(), "Received chunk");
                        callbacks.on_chunk(SegmentChunk::new(
                            data,
                            true,
                            context.clone(),
                            Arc::clone(&parser),
                            tracker.as_ref(),
                        ));
                    };
                    let load = self.pipeline.loader.load_segment(
                        cdn.as_ref(),
                        context,
                        options,
                        &attempt_token,
                        &on_chunk,
                    );
                    match self.config.request_timeout {
                        Some(limit) => tokio::time::timeout(limit, load)
                            .await
                            .map_err(|_| DownloadError::timeout(context.label()))?,
                        None => load.await,
                    }
                }
            },
            &self.config.backoff,
            |error| {
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry();
                }
                callbacks.on_retry(error);
            },
            token,
        )
        .await;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                if !error.is_cancelled() {
                    warn!(error = %error, "Segment request failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_failure();
                    }
                }
                return Err(error);
            }
        };

        match response {
            LoaderResponse::Loaded {
                data,
                size,
                request_duration,
            } => {
                if segment.is_init {
                    if let Some(cache) = &self.init_cache {
                        cache.insert(context, data.clone());
                    }
                }
                let size = size.unwrap_or(data.len() as u64);
                callbacks.on_chunk(SegmentChunk::new(
                    data,
                    false,
                    context.clone(),
                    parser,
                    tracker.as_ref(),
                ));
                if let Some(tracker) = &tracker {
                    tracker.mark_loaded(request_duration.map(|duration| (size, duration)));
                }
            }
            LoaderResponse::ChunksComplete {
                size,
                request_duration,
            } => {
                if let Some(tracker) = &tracker {
                    tracker.mark_loaded(size.zip(request_duration));
                }
            }
            LoaderResponse::Created { data } => {
                callbacks.on_chunk(SegmentChunk::new(
                    data,
                    false,
                    context.clone(),
                    parser,
                    tracker.as_ref(),
                ));
                if let Some(tracker) = &tracker {
                    tracker.mark_loaded(None);
                }
            }
        }

        debug!("All chunks received");
        callbacks.on_all_chunks_received();
        Ok(())
    }
}

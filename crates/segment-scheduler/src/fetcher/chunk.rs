use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::error::DownloadError;
use crate::metrics::{MetricsListener, SegmentNetworkMetrics};
use crate::model::{ParsedChunk, SegmentContext};
use crate::transport::SegmentParser;

#[derive(Default)]
struct TrackerState {
    /// One flag per chunk delivered so far.
    parsed: Vec<bool>,
    segment_duration: Option<f64>,
    /// Set once every chunk has been received. `None` inside means nothing to report.
    loaded: Option<Option<(u64, Duration)>>,
    metrics_sent: bool,
}

/// Reports network metrics of one segment once it is both fully loaded and fully
/// parsed, whichever happens last.
pub(crate) struct ParseTracker {
    context: SegmentContext,
    listener: Arc<dyn MetricsListener>,
    state: Mutex<TrackerState>,
}

impl ParseTracker {
    pub(crate) fn new(context: SegmentContext, listener: Arc<dyn MetricsListener>) -> Self {
        Self {
            context,
            listener,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn register_chunk(&self) -> usize {
        let mut state = self.state.lock();
        state.parsed.push(false);
        state.parsed.len() - 1
    }

    fn mark_parsed(&self, index: usize, duration: Option<f64>) {
        let metrics = {
            let mut state = self.state.lock();
            match state.parsed.get_mut(index) {
                Some(parsed) if !*parsed => *parsed = true,
                _ => return,
            }
            if let Some(duration) = duration {
                *state.segment_duration.get_or_insert(0.0) += duration;
            }
            self.take_metrics(&mut state)
        };
        self.report(metrics);
    }

    /// Every chunk was received. `size_and_duration` is `None` when no request was
    /// performed, in which case nothing is reported.
    pub(crate) fn mark_loaded(&self, size_and_duration: Option<(u64, Duration)>) {
        let metrics = {
            let mut state = self.state.lock();
            state.loaded = Some(size_and_duration);
            self.take_metrics(&mut state)
        };
        self.report(metrics);
    }

    fn take_metrics(&self, state: &mut TrackerState) -> Option<SegmentNetworkMetrics> {
        if state.metrics_sent || !state.parsed.iter().all(|parsed| *parsed) {
            return None;
        }
        let (size, request_duration) = state.loaded??;
        state.metrics_sent = true;
        Some(SegmentNetworkMetrics {
            buffer_type: self.context.buffer_type,
            size,
            request_duration,
            segment_duration: state.segment_duration,
        })
    }

    fn report(&self, metrics: Option<SegmentNetworkMetrics>) {
        if let Some(metrics) = metrics {
            trace!(
                segment = %self.context.label(),
                size = metrics.size,
                request_ms = metrics.request_duration.as_millis() as u64,
                "Segment fully loaded and parsed"
            );
            self.listener.on_segment_metrics(&metrics);
        }
    }
}

/// Loaded data of a segment, possibly only a part of it, not parsed yet.
///
/// Parsing is left to the receiver, which decides when it happens (typically once the
/// timescale of the initialization segment is known).
#[derive(Clone)]
pub struct SegmentChunk {
    data: Bytes,
    is_chunked: bool,
    context: SegmentContext,
    parser: Arc<dyn SegmentParser>,
    tracker: Option<(Arc<ParseTracker>, usize)>,
}

impl SegmentChunk {
    pub(crate) fn new(
        data: Bytes,
        is_chunked: bool,
        context: SegmentContext,
        parser: Arc<dyn SegmentParser>,
        tracker: Option<&Arc<ParseTracker>>,
    ) -> Self {
        let tracker = tracker.map(|tracker| (Arc::clone(tracker), tracker.register_chunk()));
        Self {
            data,
            is_chunked,
            context,
            parser,
            tracker,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn context(&self) -> &SegmentContext {
        &self.context
    }

    /// Whether this is one part of a segment delivered progressively.
    pub fn is_chunked(&self) -> bool {
        self.is_chunked
    }

    pub fn parse(&self, init_timescale: Option<u32>) -> Result<ParsedChunk, DownloadError> {
        let parsed =
            self.parser
                .parse_segment(&self.data, self.is_chunked, &self.context, init_timescale)?;
        if let Some((tracker, index)) = &self.tracker {
            tracker.mark_parsed(*index, parsed.duration());
        }
        Ok(parsed)
    }
}

impl std::fmt::Debug for SegmentChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentChunk")
            .field("segment", &self.context.label())
            .field("size", &self.data.len())
            .field("is_chunked", &self.is_chunked)
            .finish()
    }
}

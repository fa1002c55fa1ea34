use std::sync::Arc;

use crate::error::DownloadError;
use crate::model::{ParsedInitChunk, ParsedMediaChunk, SegmentDescriptor};

/// Events emitted by a [`SegmentQueue`](super::SegmentQueue) for its track.
#[derive(Debug, Clone)]
pub enum SegmentQueueEvent {
    /// The initialization segment was loaded and parsed.
    ParsedInitSegment {
        segment: Arc<SegmentDescriptor>,
        chunk: ParsedInitChunk,
    },
    /// A parsed chunk of a media segment. Several may be emitted per segment.
    ParsedMediaSegment {
        segment: Arc<SegmentDescriptor>,
        chunk: ParsedMediaChunk,
    },
    /// Every chunk of the segment was loaded and emitted.
    FullyLoadedSegment { segment: Arc<SegmentDescriptor> },
    /// A request attempt failed and is being retried.
    RequestRetry {
        segment: Arc<SegmentDescriptor>,
        error: DownloadError,
    },
    /// No media segment is left to request.
    EmptyQueue,
    /// Fatal error. The queue is stopped.
    Error(DownloadError),
}

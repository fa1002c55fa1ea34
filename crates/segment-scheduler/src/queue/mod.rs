// Segment Queue: per-track orchestration of segment requests from a live-updated list
// of wanted segments.

use std::sync::Arc;

use crate::model::{BufferType, Representation, SegmentDescriptor};

mod events;
mod segment_queue;

pub use events::SegmentQueueEvent;
pub use segment_queue::{SegmentQueue, SegmentQueueHandle};

/// A segment to request and its priority number (lower is more urgent).
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSegment {
    pub segment: Arc<SegmentDescriptor>,
    pub priority: u32,
}

impl QueuedSegment {
    pub fn new(segment: impl Into<Arc<SegmentDescriptor>>, priority: u32) -> Self {
        Self {
            segment: segment.into(),
            priority,
        }
    }
}

/// Wanted state of one track, updated by the buffer logic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentQueueItem {
    /// Initialization segment to load, if not loaded yet.
    pub init_segment: Option<QueuedSegment>,
    /// Media segments to load, the first one being requested next.
    pub segment_queue: Vec<QueuedSegment>,
}

/// The track a [`SegmentQueue`] loads segments for.
#[derive(Debug, Clone)]
pub struct SegmentQueueContent {
    pub buffer_type: BufferType,
    pub representation: Arc<Representation>,
    /// When `false`, media segments are parsed without waiting for an initialization
    /// segment.
    pub has_init_segment: bool,
}

//! # Segment Scheduler
//!
//! Request scheduling core of an adaptive streaming client. It decides which media
//! segment is requested next, at which priority, which content source (CDN) serves it
//! and what happens when a source fails.
//!
//! Components, leaf-first:
//!
//! - [`CdnPrioritizer`]: shared list of temporarily downgraded CDNs
//! - [`retry`]: backoff primitives and the multi-CDN request engine
//! - [`SegmentFetcher`]: loads and lazily parses one segment, with an init segment cache
//! - [`TaskPrioritizer`]: priority-based concurrency scheduler with interruption
//! - [`SegmentQueue`]: per-track orchestrator driven by a live "wanted segments" queue
//!
//! Transport specifics (loading bytes, parsing containers) stay behind the
//! [`SegmentLoader`] and [`SegmentParser`] traits. A reqwest based
//! [`HttpSegmentLoader`] is bundled.
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod cdn;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod model;
pub mod prioritizer;
pub mod queue;
pub mod retry;
pub mod shared;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cdn::{CdnMetadata, CdnPrioritizer, CdnPriorityChange};
pub use config::{
    BackoffConfig, CdnConfig, FetcherConfig, HttpLoaderConfig, PrioritySteps, SchedulerConfig,
    SegmentQueueConfig,
};
pub use error::DownloadError;
pub use fetcher::{
    FetchCallbacks, InitSegmentCache, PrioritizedSegmentFetcher, SegmentChunk, SegmentFetcher,
    SegmentRequest,
};
pub use metrics::{MetricsListener, MetricsSnapshot, NetworkMetrics, SegmentNetworkMetrics};
pub use model::{
    BufferType, ParsedChunk, ParsedInitChunk, ParsedMediaChunk, Representation, SegmentContext,
    SegmentDescriptor,
};
pub use prioritizer::{
    SEGMENT_PRIORITIES_STEPS, TaskError, TaskId, TaskObserver, TaskPrioritizer, segment_priority,
};
pub use queue::{
    QueuedSegment, SegmentQueue, SegmentQueueContent, SegmentQueueEvent, SegmentQueueHandle,
    SegmentQueueItem,
};
pub use retry::{schedule_request, schedule_request_with_cdns};
pub use shared::SharedReference;
pub use transport::{
    HttpSegmentLoader, LoaderOptions, LoaderResponse, PassthroughParser, SegmentLoader,
    SegmentParser, SegmentPipeline,
};

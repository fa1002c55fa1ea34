// Segment fetching: one segment request through the retry engine, with an
// initialization segment cache and lazily parsed chunks.

use crate::error::DownloadError;

mod chunk;
mod init_cache;
mod prioritized;
mod segment_fetcher;

pub use chunk::SegmentChunk;
pub use init_cache::InitSegmentCache;
pub use prioritized::{PrioritizedSegmentFetcher, SegmentRequest};
pub use segment_fetcher::SegmentFetcher;

/// Receives the progress of one segment request.
pub trait FetchCallbacks: Send + Sync {
    /// Some data of the segment was loaded. Parsing is up to the receiver.
    fn on_chunk(&self, chunk: SegmentChunk);

    /// Every chunk of the segment was delivered.
    fn on_all_chunks_received(&self);

    /// An attempt failed and another one is about to be scheduled.
    fn on_retry(&self, _error: &DownloadError) {}

    /// The request is being interrupted by a more urgent one and will restart later.
    fn before_interrupted(&self) {}

    /// The request succeeded and is about to be removed from the prioritizer.
    fn before_ended(&self) {}
}

// Transport seams: how segment bytes are obtained and how they are turned into parsed
// chunks. The scheduling core only relies on these traits.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cdn::CdnMetadata;
use crate::error::DownloadError;
use crate::model::{ParsedChunk, ParsedInitChunk, ParsedMediaChunk, SegmentContext};

pub mod http;

pub use http::HttpSegmentLoader;

/// Options applied to a single load attempt.
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    pub connection_timeout: Option<Duration>,
    /// Deliver data through `on_chunk` as it arrives instead of returning it at once.
    pub chunked: bool,
}

#[derive(Debug, Clone)]
pub enum LoaderResponse {
    /// The whole segment, returned at once.
    Loaded {
        data: Bytes,
        size: Option<u64>,
        request_duration: Option<Duration>,
    },
    /// Every chunk was already delivered through `on_chunk`.
    ChunksComplete {
        size: Option<u64>,
        request_duration: Option<Duration>,
    },
    /// Data produced without a network request.
    Created { data: Bytes },
}

/// Loads the raw data of a segment from one source.
#[async_trait]
pub trait SegmentLoader: Send + Sync {
    /// Performs one attempt. Must return [`DownloadError::Cancelled`] promptly once
    /// `token` is cancelled.
    async fn load_segment(
        &self,
        cdn: Option<&CdnMetadata>,
        context: &SegmentContext,
        options: &LoaderOptions,
        token: &CancellationToken,
        on_chunk: &(dyn Fn(Bytes) + Send + Sync),
    ) -> Result<LoaderResponse, DownloadError>;
}

/// Turns loaded data into a parsed chunk. Synchronous; the caller decides when it runs.
pub trait SegmentParser: Send + Sync {
    fn parse_segment(
        &self,
        data: &Bytes,
        is_chunked: bool,
        context: &SegmentContext,
        init_timescale: Option<u32>,
    ) -> Result<ParsedChunk, DownloadError>;
}

/// Loader and parser of one transport.
#[derive(Clone)]
pub struct SegmentPipeline {
    pub loader: Arc<dyn SegmentLoader>,
    pub parser: Arc<dyn SegmentParser>,
}

impl SegmentPipeline {
    pub fn new(loader: Arc<dyn SegmentLoader>, parser: Arc<dyn SegmentParser>) -> Self {
        Self { loader, parser }
    }
}

/// Forwards data untouched, taking timing information from the segment descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughParser;

impl SegmentParser for PassthroughParser {
    fn parse_segment(
        &self,
        data: &Bytes,
        is_chunked: bool,
        context: &SegmentContext,
        _init_timescale: Option<u32>,
    ) -> Result<ParsedChunk, DownloadError> {
        let segment = &context.segment;
        if segment.is_init {
            return Ok(ParsedChunk::Init(ParsedInitChunk {
                data: Some(data.clone()),
                init_timescale: None,
            }));
        }
        // A single chunk of a chunked segment does not cover the whole segment.
        let (start, duration) = if is_chunked {
            (None, None)
        } else {
            (Some(segment.time), Some(segment.duration))
        };
        Ok(ParsedChunk::Media(ParsedMediaChunk {
            data: data.clone(),
            start,
            duration,
        }))
    }
}

//! Shared helpers for the segment-scheduler integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use segment_scheduler::{
    CdnMetadata, DownloadError, LoaderOptions, LoaderResponse, ParsedChunk, ParsedInitChunk,
    ParsedMediaChunk, SegmentContext, SegmentLoader, SegmentParser,
};

pub const TEST_TIMESCALE: u32 = 90_000;

/// Initialize tracing for tests with appropriate settings
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Loader serving `b"<segment id>"` after a per-segment delay, failing for the
/// segments registered through [`FakeLoader::fail`].
#[derive(Default)]
pub struct FakeLoader {
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashMap<String, DownloadError>>,
    pub calls: Mutex<Vec<String>>,
    pub cancellations: Mutex<Vec<String>>,
}

impl FakeLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delay(&self, segment: &str, delay: Duration) {
        self.delays.lock().insert(segment.to_string(), delay);
    }

    pub fn fail(&self, segment: &str, error: DownloadError) {
        self.failures.lock().insert(segment.to_string(), error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn cancellations(&self) -> Vec<String> {
        self.cancellations.lock().clone()
    }
}

#[async_trait]
impl SegmentLoader for FakeLoader {
    async fn load_segment(
        &self,
        _cdn: Option<&CdnMetadata>,
        context: &SegmentContext,
        _options: &LoaderOptions,
        token: &CancellationToken,
        _on_chunk: &(dyn Fn(Bytes) + Send + Sync),
    ) -> Result<LoaderResponse, DownloadError> {
        let id = context.segment.id.to_string();
        self.calls.lock().push(id.clone());

        let delay = self.delays.lock().get(&id).copied();
        if let Some(delay) = delay {
            tokio::select! {
                _ = token.cancelled() => {
                    self.cancellations.lock().push(id);
                    return Err(DownloadError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(error) = self.failures.lock().get(&id).cloned() {
            return Err(error);
        }

        let data = Bytes::from(id);
        Ok(LoaderResponse::Loaded {
            size: Some(data.len() as u64),
            data,
            request_duration: delay,
        })
    }
}

/// Parser announcing [`TEST_TIMESCALE`] in initialization segments and refusing to
/// parse media without it.
pub struct TimescaleParser;

impl SegmentParser for TimescaleParser {
    fn parse_segment(
        &self,
        data: &Bytes,
        _is_chunked: bool,
        context: &SegmentContext,
        init_timescale: Option<u32>,
    ) -> Result<ParsedChunk, DownloadError> {
        if context.segment.is_init {
            return Ok(ParsedChunk::Init(ParsedInitChunk {
                data: Some(data.clone()),
                init_timescale: Some(TEST_TIMESCALE),
            }));
        }
        if init_timescale != Some(TEST_TIMESCALE) {
            return Err(DownloadError::parse(format!(
                "media segment {} parsed without timescale",
                context.segment.id
            )));
        }
        Ok(ParsedChunk::Media(ParsedMediaChunk {
            data: data.clone(),
            start: Some(context.segment.time),
            duration: Some(context.segment.duration),
        }))
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cdn::CdnMetadata;
use crate::error::DownloadError;
use crate::fetcher::{FetchCallbacks, SegmentChunk};
use crate::model::SegmentContext;
use crate::transport::{LoaderOptions, LoaderResponse, SegmentLoader};

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer() // Write to test output
        .try_init();
}

type Handler =
    Box<dyn Fn(Option<&CdnMetadata>, &SegmentContext) -> Result<Bytes, DownloadError> + Send + Sync>;

/// Loader answering through a closure after an optional delay, recording every call as
/// `"<cdn>:<segment id>"`.
pub struct ScriptedLoader {
    handler: Handler,
    delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedLoader {
    pub fn new(
        handler: impl Fn(Option<&CdnMetadata>, &SegmentContext) -> Result<Bytes, DownloadError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl SegmentLoader for ScriptedLoader {
    async fn load_segment(
        &self,
        cdn: Option<&CdnMetadata>,
        context: &SegmentContext,
        options: &LoaderOptions,
        token: &CancellationToken,
        on_chunk: &(dyn Fn(Bytes) + Send + Sync),
    ) -> Result<LoaderResponse, DownloadError> {
        self.calls.lock().push(format!(
            "{}:{}",
            cdn.map_or("-", CdnMetadata::label),
            context.segment.id
        ));

        if !self.delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let data = (self.handler)(cdn, context)?;
        if options.chunked {
            let middle = data.len() / 2;
            on_chunk(data.slice(..middle));
            on_chunk(data.slice(middle..));
            return Ok(LoaderResponse::ChunksComplete {
                size: Some(data.len() as u64),
                request_duration: Some(self.delay),
            });
        }
        Ok(LoaderResponse::Loaded {
            size: Some(data.len() as u64),
            data,
            request_duration: Some(self.delay),
        })
    }
}

/// Callbacks recording what they receive.
#[derive(Default)]
pub struct RecordingCallbacks {
    pub chunks: Mutex<Vec<SegmentChunk>>,
    pub events: Mutex<Vec<String>>,
}

impl FetchCallbacks for RecordingCallbacks {
    fn on_chunk(&self, chunk: SegmentChunk) {
        self.events.lock().push("chunk".to_string());
        self.chunks.lock().push(chunk);
    }

    fn on_all_chunks_received(&self) {
        self.events.lock().push("complete".to_string());
    }

    fn on_retry(&self, error: &DownloadError) {
        self.events.lock().push(format!("retry: {error}"));
    }

    fn before_interrupted(&self) {
        self.events.lock().push("interrupted".to_string());
    }

    fn before_ended(&self) {
        self.events.lock().push("ended".to_string());
    }
}

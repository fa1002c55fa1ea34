// HTTP Segment Loader: Performs one segment request against one CDN with reqwest.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use url::Url;

use super::{LoaderOptions, LoaderResponse, SegmentLoader};
use crate::cdn::CdnMetadata;
use crate::config::HttpLoaderConfig;
use crate::error::DownloadError;
use crate::model::{SegmentContext, SegmentDescriptor};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// `Range` header value for an inclusive byte range.
pub fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={start}-{end}"),
        None => format!("bytes={start}-"),
    }
}

/// Resolves the URL of `segment` against the base URL of `cdn`.
///
/// Absolute segment URLs are used as is, whatever the CDN.
pub fn resolve_segment_url(
    cdn: Option<&CdnMetadata>,
    segment: &SegmentDescriptor,
) -> Result<Url, DownloadError> {
    let Some(path) = segment.url.as_deref() else {
        return match cdn {
            Some(cdn) => parse_url(&cdn.base_url),
            None => Err(DownloadError::InvalidUrl {
                input: segment.id.to_string(),
                reason: "segment has neither a URL nor a CDN".to_string(),
            }),
        };
    };

    if let Ok(absolute) = Url::parse(path) {
        return Ok(absolute);
    }

    let Some(cdn) = cdn else {
        return Err(DownloadError::InvalidUrl {
            input: path.to_string(),
            reason: "relative segment URL without CDN".to_string(),
        });
    };
    parse_url(&cdn.base_url)?
        .join(path)
        .map_err(|e| DownloadError::InvalidUrl {
            input: path.to_string(),
            reason: e.to_string(),
        })
}

fn parse_url(input: &str) -> Result<Url, DownloadError> {
    Url::parse(input).map_err(|e| DownloadError::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Races `fut` against `token`, and against `timeout` when set.
async fn guarded<T>(
    fut: impl Future<Output = Result<T, reqwest::Error>>,
    timeout: Option<Duration>,
    token: &CancellationToken,
    url: &Url,
) -> Result<T, DownloadError> {
    let fut = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| DownloadError::timeout(url.as_str()))?
                .map_err(DownloadError::from),
            None => fut.await.map_err(DownloadError::from),
        }
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DownloadError::Cancelled),
        result = fut => result,
    }
}

/// [`SegmentLoader`] fetching segments over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpSegmentLoader {
    client: Client,
}

impl HttpSegmentLoader {
    pub fn new(config: &HttpLoaderConfig) -> Result<Self, DownloadError> {
        install_rustls_provider();

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(config.headers.clone())
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| DownloadError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn stream_body(
        &self,
        response: reqwest::Response,
        token: &CancellationToken,
        url: &Url,
        on_chunk: &(dyn Fn(Bytes) + Send + Sync),
    ) -> Result<u64, DownloadError> {
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(DownloadError::from)?;
            received += chunk.len() as u64;
            trace!(url = %url, chunk_size = chunk.len(), received, "Received segment chunk");
            on_chunk(chunk);
        }

        Ok(received)
    }
}

#[async_trait]
impl SegmentLoader for HttpSegmentLoader {
    #[instrument(skip_all, fields(segment = %context.label(), cdn = ?cdn.map(CdnMetadata::label)))]
    async fn load_segment(
        &self,
        cdn: Option<&CdnMetadata>,
        context: &SegmentContext,
        options: &LoaderOptions,
        token: &CancellationToken,
        on_chunk: &(dyn Fn(Bytes) + Send + Sync),
    ) -> Result<LoaderResponse, DownloadError> {
        let url = resolve_segment_url(cdn, &context.segment)?;
        let mut request = self.client.get(url.clone());
        if let Some((start, end)) = context.segment.byte_range {
            request = request.header(reqwest::header::RANGE, range_header(start, end));
        }

        let started = Instant::now();
        let response = guarded(request.send(), options.connection_timeout, token, &url).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, url.as_str()));
        }
        trace!(url = %url, http_version = ?response.version(), "Segment response received");

        if options.chunked {
            let size = self.stream_body(response, token, &url, on_chunk).await?;
            return Ok(LoaderResponse::ChunksComplete {
                size: Some(size),
                request_duration: Some(started.elapsed()),
            });
        }

        let data = guarded(response.bytes(), None, token, &url).await?;
        debug!(url = %url, bytes = data.len(), "Segment loaded");
        Ok(LoaderResponse::Loaded {
            size: Some(data.len() as u64),
            data,
            request_duration: Some(started.elapsed()),
        })
    }
}

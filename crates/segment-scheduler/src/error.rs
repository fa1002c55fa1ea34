use reqwest::StatusCode;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    #[error("request cancelled")]
    Cancelled,

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("request timed out: {url}")]
    Timeout { url: String },

    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("integrity check failed: {reason}")]
    Integrity { reason: String },

    #[error("loader error: {reason}")]
    Loader { reason: String, retryable: bool },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("no CDN available for {resource}")]
    NoCdnAvailable { resource: String },

    #[error("segment parsing failed: {reason}")]
    Parse { reason: String },

    #[error("unexpected chunk: {reason}")]
    UnexpectedChunk { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl DownloadError {
    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity {
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a failed attempt may be retried, possibly on the same source.
    ///
    /// Server errors, 404, 412 and 415 are considered transient, as are timeouts,
    /// connection level failures and integrity errors. Cancellation never is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::NOT_FOUND
                    || *status == StatusCode::PRECONDITION_FAILED
                    || *status == StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            Self::Timeout { .. } | Self::Network { .. } | Self::Integrity { .. } => true,
            Self::Loader { retryable, .. } => *retryable,
            Self::InvalidUrl { .. }
            | Self::NoCdnAvailable { .. }
            | Self::Parse { .. }
            | Self::UnexpectedChunk { .. }
            | Self::Configuration { .. } => false,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if err.is_timeout() {
            Self::Timeout { url }
        } else if let Some(status) = err.status() {
            Self::HttpStatus { status, url }
        } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            Self::Network {
                reason: err.to_string(),
            }
        } else {
            Self::Loader {
                reason: err.to_string(),
                retryable: false,
            }
        }
    }
}

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::DownloadError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

// --- Backoff Configuration ---

/// Exponential backoff settings for one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry. Doubled on each following error.
    pub base_delay: Duration,
    /// Hard cap on the computed delay (applied before fuzzing).
    pub max_delay: Duration,
    /// Number of retries allowed per source, not counting the initial attempt.
    pub max_retry: u32,
}

impl BackoffConfig {
    pub fn regular() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            max_retry: 4,
        }
    }

    /// Shorter delays, used when playing close to the live edge.
    pub fn low_latency() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            max_retry: 4,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::regular()
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub backoff: BackoffConfig,
    /// Low-latency mode: chunked segment delivery and shorter backoff.
    pub low_latency_mode: bool,
    /// Abort one attempt after this duration and treat it as a retryable failure.
    pub request_timeout: Option<Duration>,
    /// Maximum time until response headers arrive, forwarded to the loader.
    /// Body streaming is bounded by `request_timeout` only.
    pub connection_timeout: Option<Duration>,
    /// Number of initialization segments kept per fetcher.
    pub init_cache_capacity: u64,
}

impl FetcherConfig {
    pub fn low_latency() -> Self {
        Self {
            backoff: BackoffConfig::low_latency(),
            low_latency_mode: true,
            ..Self::default()
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::regular(),
            low_latency_mode: false,
            request_timeout: Some(Duration::from_secs(30)),
            connection_timeout: Some(Duration::from_secs(15)),
            init_cache_capacity: 16,
        }
    }
}

// --- Priority Steps ---

/// Thresholds splitting priority numbers into high, normal and low bands.
///
/// A task with a priority number `<= high` interrupts every pending task whose
/// priority number is `>= low`. Lower numbers are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySteps {
    pub high: u32,
    pub low: u32,
}

impl PrioritySteps {
    pub fn new(high: u32, low: u32) -> Result<Self, DownloadError> {
        let steps = Self { high, low };
        steps.validate()?;
        Ok(steps)
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.high >= self.low {
            return Err(DownloadError::configuration(format!(
                "high priority step ({}) must be strictly lower than the low priority step ({})",
                self.high, self.low
            )));
        }
        Ok(())
    }

    pub fn is_high(&self, priority: u32) -> bool {
        priority <= self.high
    }

    pub fn is_low(&self, priority: u32) -> bool {
        priority >= self.low
    }
}

impl Default for PrioritySteps {
    fn default() -> Self {
        Self { high: 1, low: 3 }
    }
}

// --- CDN Configuration ---
#[derive(Debug, Clone)]
pub struct CdnConfig {
    /// How long a failing CDN stays deprioritized.
    pub downgrade_time: Duration,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            downgrade_time: Duration::from_secs(60),
        }
    }
}

// --- Segment Queue Configuration ---
#[derive(Debug, Clone)]
pub struct SegmentQueueConfig {
    /// Capacity of the channel carrying events to the consumer.
    pub event_buffer: usize,
}

impl Default for SegmentQueueConfig {
    fn default() -> Self {
        Self { event_buffer: 32 }
    }
}

// --- HTTP Loader Configuration ---
#[derive(Debug, Clone)]
pub struct HttpLoaderConfig {
    pub user_agent: String,
    /// Time allowed to open the TCP/TLS connection. Applied by the client to
    /// every request.
    pub connect_timeout: Duration,
    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
    pub headers: HeaderMap,
}

impl HttpLoaderConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }
}

impl Default for HttpLoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(15),
            pool_idle_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
            headers: Self::get_default_headers(),
        }
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub fetcher: FetcherConfig,
    pub priority_steps: PrioritySteps,
    pub cdn: CdnConfig,
    pub queue: SegmentQueueConfig,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), DownloadError> {
        self.priority_steps.validate()?;
        if self.queue.event_buffer == 0 {
            return Err(DownloadError::configuration(
                "segment queue event buffer must not be empty",
            ));
        }
        Ok(())
    }
}

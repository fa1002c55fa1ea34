// Request Retry Engine: Resolves one resource fetch against an ordered, dynamically
// reprioritized set of CDNs.
//
// Implements exponential backoff with fuzzing, per-source blacklisting on fatal errors,
// and re-selection of the source when CDN priorities change during a backoff wait.

use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cdn::{CdnMetadata, CdnPrioritizer, CdnPriorityChange};
use crate::config::BackoffConfig;
use crate::error::DownloadError;

/// Maximum relative deviation applied to a backoff delay.
const FUZZ_FACTOR: f64 = 0.3;

/// Exponential delay for the `error_count`-th consecutive error (1-indexed), capped to
/// `max_delay`.
pub fn backoff_delay(config: &BackoffConfig, error_count: u32) -> Duration {
    let exponent = error_count.saturating_sub(1);
    // 2^exponent computed with a checked shift so large counts saturate.
    let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    config
        .base_delay
        .checked_mul(multiplier)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// Randomly spreads `delay` by up to [`FUZZ_FACTOR`] in both directions so that
/// concurrent clients do not retry in lockstep.
pub fn fuzzed_delay(delay: Duration) -> Duration {
    let fuzz = rand::rng().random_range(-FUZZ_FACTOR..FUZZ_FACTOR);
    delay.mul_f64(1.0 + fuzz)
}

/// Transient per-source bookkeeping for one logical request.
#[derive(Debug, Clone, Default)]
struct AttemptMetadata {
    error_counter: u32,
    blocked_until: Option<Instant>,
    is_blacklisted: bool,
}

/// Candidate sources of one logical request, with their attempt metadata.
struct CandidateSet<'a> {
    /// `None` when the resource has no CDN concept: a single implicit source.
    cdns: Option<&'a [CdnMetadata]>,
    attempts: Vec<AttemptMetadata>,
}

impl<'a> CandidateSet<'a> {
    fn new(cdns: Option<&'a [CdnMetadata]>) -> Self {
        let len = cdns.map_or(1, <[CdnMetadata]>::len);
        Self {
            cdns,
            attempts: vec![AttemptMetadata::default(); len],
        }
    }

    fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn cdn(&self, index: usize) -> Option<CdnMetadata> {
        self.cdns.and_then(|cdns| cdns.get(index).cloned())
    }

    fn label(&self, index: usize) -> String {
        self.cdns
            .and_then(|cdns| cdns.get(index))
            .map_or_else(|| "<default>".to_string(), |cdn| cdn.label().to_string())
    }

    /// Candidate indices from the most to the least prioritary.
    fn prioritized_indices(&self, prioritizer: Option<&CdnPrioritizer>) -> Vec<usize> {
        let (Some(cdns), Some(prioritizer)) = (self.cdns, prioritizer) else {
            return (0..self.attempts.len()).collect();
        };

        let ordered = prioritizer.get_cdn_preference_for_resource(cdns);
        let mut used = vec![false; cdns.len()];
        let mut indices = Vec::with_capacity(cdns.len());
        for cdn in ordered.iter() {
            if let Some(pos) = (0..cdns.len()).find(|&i| !used[i] && cdns[i] == *cdn) {
                used[pos] = true;
                indices.push(pos);
            }
        }
        indices
    }

    /// Most prioritary candidate that is not blacklisted.
    ///
    /// The first candidate which is not currently blocked wins. If every candidate is
    /// blocked, the one whose backoff window ends first is returned.
    fn next_candidate(&self, prioritizer: Option<&CdnPrioritizer>) -> Option<usize> {
        let now = Instant::now();
        let mut earliest: Option<(usize, Instant)> = None;

        for index in self.prioritized_indices(prioritizer) {
            let attempt = &self.attempts[index];
            if attempt.is_blacklisted {
                continue;
            }
            match attempt.blocked_until {
                None => return Some(index),
                Some(until) if until <= now => return Some(index),
                Some(until) => {
                    if earliest.is_none_or(|(_, best)| until < best) {
                        earliest = Some((index, until));
                    }
                }
            }
        }

        earliest.map(|(index, _)| index)
    }

    /// Updates the metadata of a failed candidate. Returns `true` if it was
    /// blacklisted for the rest of this request.
    fn record_failure(&mut self, index: usize, error: &DownloadError, backoff: &BackoffConfig) -> bool {
        let attempt = &mut self.attempts[index];

        if !error.is_retryable() {
            attempt.blocked_until = None;
            attempt.is_blacklisted = true;
            return true;
        }

        let previous_errors = attempt.error_counter;
        attempt.error_counter += 1;
        if previous_errors >= backoff.max_retry {
            attempt.blocked_until = None;
            attempt.is_blacklisted = true;
            return true;
        }

        let delay = fuzzed_delay(backoff_delay(backoff, attempt.error_counter));
        attempt.blocked_until = Some(Instant::now() + delay);
        false
    }
}

/// Resolves when the CDN priorities may have changed. Never resolves without a
/// prioritizer.
async fn next_priority_change(receiver: &mut Option<broadcast::Receiver<CdnPriorityChange>>) {
    let Some(receiver) = receiver.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.recv().await {
        Ok(_) | Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => std::future::pending().await,
    }
}

/// Waits for the backoff window of the candidate at `index`, switching source if the
/// priorities change meanwhile. Returns the candidate to request.
async fn wait_for_backoff(
    candidates: &CandidateSet<'_>,
    mut index: usize,
    prioritizer: Option<&CdnPrioritizer>,
    priority_changes: &mut Option<broadcast::Receiver<CdnPriorityChange>>,
    last_error: &mut Option<DownloadError>,
    token: &CancellationToken,
) -> Result<usize, DownloadError> {
    while let Some(blocked_until) = candidates.attempts[index]
        .blocked_until
        .filter(|until| *until > Instant::now())
    {
        trace!(
            cdn = %candidates.label(index),
            wait_ms = blocked_until.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Waiting for backoff before retrying"
        );
        tokio::select! {
            biased;

            _ = token.cancelled() => return Err(DownloadError::Cancelled),

            _ = next_priority_change(priority_changes) => {
                match candidates.next_candidate(prioritizer) {
                    None => {
                        return Err(last_error.take().unwrap_or_else(|| {
                            DownloadError::NoCdnAvailable {
                                resource: "resource without requestable CDN".to_string(),
                            }
                        }));
                    }
                    Some(updated) if updated != index => {
                        debug!(
                            from = %candidates.label(index),
                            to = %candidates.label(updated),
                            "CDN priorities changed during backoff, switching source"
                        );
                        index = updated;
                    }
                    Some(_) => {}
                }
            }

            _ = tokio::time::sleep_until(blocked_until) => break,
        }
    }
    Ok(index)
}

/// Performs one logical request, trying CDNs in priority order.
///
/// - Transient failures are retried with exponential backoff, at most
///   `backoff.max_retry` times per source.
/// - Fatal failures blacklist the source for the rest of this call.
/// - Every failed source is downgraded on the shared `prioritizer`, when present.
/// - `on_retry` is called each time another attempt is about to be scheduled.
///
/// Cancelling `token` aborts the current attempt or backoff wait immediately and
/// yields [`DownloadError::Cancelled`]; it never counts as a failure of the source.
/// When no candidate remains, the last encountered error is returned.
pub async fn schedule_request_with_cdns<T, F, Fut, R>(
    cdns: Option<&[CdnMetadata]>,
    prioritizer: Option<&CdnPrioritizer>,
    mut perform_request: F,
    backoff: &BackoffConfig,
    mut on_retry: R,
    token: &CancellationToken,
) -> Result<T, DownloadError>
where
    F: FnMut(Option<CdnMetadata>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
    R: FnMut(&DownloadError),
{
    if token.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let mut candidates = CandidateSet::new(cdns);
    if candidates.is_empty() {
        return Err(DownloadError::NoCdnAvailable {
            resource: "resource with an empty CDN list".to_string(),
        });
    }

    let prioritizer = if cdns.is_some() { prioritizer } else { None };
    let mut priority_changes = prioritizer.map(CdnPrioritizer::subscribe);
    let mut last_error: Option<DownloadError> = None;

    let Some(mut index) = candidates.next_candidate(prioritizer) else {
        return Err(DownloadError::NoCdnAvailable {
            resource: "resource without requestable CDN".to_string(),
        });
    };

    loop {
        index = wait_for_backoff(
            &candidates,
            index,
            prioritizer,
            &mut priority_changes,
            &mut last_error,
            token,
        )
        .await?;

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            result = perform_request(candidates.cdn(index), token.child_token()) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if token.is_cancelled() || error.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        if let (Some(prioritizer), Some(cdn)) = (prioritizer, candidates.cdn(index)) {
            prioritizer.downgrade_cdn(&cdn);
        }

        let blacklisted = candidates.record_failure(index, &error, backoff);
        warn!(
            cdn = %candidates.label(index),
            error = %error,
            errors = candidates.attempts[index].error_counter,
            blacklisted,
            "Request attempt failed"
        );

        match candidates.next_candidate(prioritizer) {
            None => return Err(error),
            Some(next) => {
                on_retry(&error);
                last_error = Some(error);
                index = next;
            }
        }
    }
}

/// Same as [`schedule_request_with_cdns`] for resources with a single implicit source
/// (manifests, license requests...).
pub async fn schedule_request<T, F, Fut, R>(
    mut perform_request: F,
    backoff: &BackoffConfig,
    on_retry: R,
    token: &CancellationToken,
) -> Result<T, DownloadError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
    R: FnMut(&DownloadError),
{
    schedule_request_with_cdns(
        None,
        None,
        |_, token| perform_request(token),
        backoff,
        on_retry,
        token,
    )
    .await
}

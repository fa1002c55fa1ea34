// CDN Prioritizer: Keeps track of recently failing content sources and moves them to
// the back of the candidate list for every resource request.

use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CdnConfig;

/// Identifies one content source able to serve a resource.
#[derive(Debug, Clone)]
pub struct CdnMetadata {
    pub id: Option<Arc<str>>,
    pub base_url: Arc<str>,
}

impl CdnMetadata {
    pub fn new(base_url: impl Into<Arc<str>>) -> Self {
        Self {
            id: None,
            base_url: base_url.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Identifier used in logs.
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.base_url)
    }
}

/// Two sources are the same when their ids match, or, lacking ids, their base URLs.
impl PartialEq for CdnMetadata {
    fn eq(&self, other: &Self) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.base_url == other.base_url,
            _ => false,
        }
    }
}

impl Eq for CdnMetadata {}

/// Emitted each time the relative order of CDNs may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdnPriorityChange {
    Downgraded(CdnMetadata),
    Restored(CdnMetadata),
}

struct DowngradedCdn {
    cdn: CdnMetadata,
    expires_at: Instant,
    generation: u64,
    timer: AbortHandle,
}

#[derive(Default)]
struct DowngradeList {
    entries: Vec<DowngradedCdn>,
}

impl DowngradeList {
    fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            entry.timer.abort();
        }
    }

    fn is_downgraded(&self, cdn: &CdnMetadata, now: Instant) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.cdn == *cdn && entry.expires_at > now)
    }
}

/// Shared registry of downgraded CDNs.
///
/// One instance is shared by every in-flight request of every track. It must be given
/// *all* candidate CDNs of a resource, even those which will end up unused, otherwise
/// later downgrade decisions are made on a partial view.
pub struct CdnPrioritizer {
    state: Arc<Mutex<DowngradeList>>,
    downgrade_time: Duration,
    events: broadcast::Sender<CdnPriorityChange>,
    token: CancellationToken,
    next_generation: AtomicU64,
}

impl CdnPrioritizer {
    /// Creates a prioritizer whose timers are all cleared once `token` is cancelled.
    pub fn new(config: CdnConfig, token: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            state: Arc::new(Mutex::new(DowngradeList::default())),
            downgrade_time: config.downgrade_time,
            events,
            token,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Subscribe to priority changes (downgrades and expiries).
    pub fn subscribe(&self) -> broadcast::Receiver<CdnPriorityChange> {
        self.events.subscribe()
    }

    /// Returns `all_cdns` with every currently downgraded source moved to the end.
    ///
    /// Relative order inside both groups is preserved. With zero or one candidate the
    /// input is handed back untouched.
    pub fn get_cdn_preference_for_resource<'a>(
        &self,
        all_cdns: &'a [CdnMetadata],
    ) -> Cow<'a, [CdnMetadata]> {
        if all_cdns.len() <= 1 {
            return Cow::Borrowed(all_cdns);
        }
        if self.token.is_cancelled() {
            self.state.lock().clear();
            return Cow::Borrowed(all_cdns);
        }

        let now = Instant::now();
        let state = self.state.lock();
        let (mut preferred, downgraded): (Vec<_>, Vec<_>) = all_cdns
            .iter()
            .cloned()
            .partition(|cdn| !state.is_downgraded(cdn, now));
        drop(state);

        if downgraded.is_empty() {
            return Cow::Borrowed(all_cdns);
        }
        preferred.extend(downgraded);
        Cow::Owned(preferred)
    }

    pub fn is_downgraded(&self, cdn: &CdnMetadata) -> bool {
        self.state.lock().is_downgraded(cdn, Instant::now())
    }

    /// Deprioritizes `cdn` for the configured duration, restarting its timer if it
    /// already was downgraded.
    pub fn downgrade_cdn(&self, cdn: &CdnMetadata) {
        if self.token.is_cancelled() {
            return;
        }

        let expires_at = Instant::now() + self.downgrade_time;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timer = self.spawn_expiry_timer(cdn.clone(), expires_at, generation);

        {
            let mut state = self.state.lock();
            if let Some(pos) = state.entries.iter().position(|entry| entry.cdn == *cdn) {
                let previous = state.entries.remove(pos);
                previous.timer.abort();
            }
            state.entries.push(DowngradedCdn {
                cdn: cdn.clone(),
                expires_at,
                generation,
                timer,
            });
        }

        warn!(
            cdn = cdn.label(),
            downgrade_secs = self.downgrade_time.as_secs_f64(),
            "Downgrading CDN"
        );
        let _ = self.events.send(CdnPriorityChange::Downgraded(cdn.clone()));
    }

    /// Stops every timer and forgets all downgrades.
    pub fn dispose(&self) {
        self.token.cancel();
        self.state.lock().clear();
    }

    fn spawn_expiry_timer(
        &self,
        cdn: CdnMetadata,
        expires_at: Instant,
        generation: u64,
    ) -> AbortHandle {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("CDN prioritizer disposed, clearing downgrades");
                    state.lock().clear();
                }
                _ = tokio::time::sleep_until(expires_at) => {
                    let removed = {
                        let mut state = state.lock();
                        match state
                            .entries
                            .iter()
                            .position(|entry| entry.generation == generation)
                        {
                            Some(pos) => {
                                state.entries.remove(pos);
                                true
                            }
                            None => false,
                        }
                    };
                    if removed {
                        info!(cdn = cdn.label(), "CDN downgrade expired");
                        let _ = events.send(CdnPriorityChange::Restored(cdn));
                    }
                }
            }
        })
        .abort_handle()
    }
}

impl Drop for CdnPrioritizer {
    fn drop(&mut self) {
        self.state.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cdn(id: &str) -> CdnMetadata {
        CdnMetadata::new(format!("https://{id}.example.com/")).with_id(id)
    }

    fn prioritizer(secs: u64) -> CdnPrioritizer {
        CdnPrioritizer::new(
            CdnConfig {
                downgrade_time: Duration::from_secs(secs),
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn equality_prefers_id_then_base_url() {
        let a = CdnMetadata::new("https://a/").with_id("x");
        let b = CdnMetadata::new("https://b/").with_id("x");
        assert_eq!(a, b);

        let c = CdnMetadata::new("https://a/");
        let d = CdnMetadata::new("https://a/");
        assert_eq!(c, d);
        assert_ne!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn single_candidate_is_returned_untouched() {
        let prio = prioritizer(10);
        let only = vec![cdn("a")];
        prio.downgrade_cdn(&only[0]);

        let ordered = prio.get_cdn_preference_for_resource(&only);
        assert!(matches!(ordered, Cow::Borrowed(_)));
        assert!(std::ptr::eq(ordered.as_ptr(), only.as_ptr()));

        let empty: Vec<CdnMetadata> = Vec::new();
        assert!(prio.get_cdn_preference_for_resource(&empty).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn downgraded_cdns_move_to_the_end_in_original_order() {
        let prio = prioritizer(10);
        let all = vec![cdn("a"), cdn("b"), cdn("c"), cdn("d")];
        prio.downgrade_cdn(&all[2]);
        prio.downgrade_cdn(&all[0]);

        let ordered = prio.get_cdn_preference_for_resource(&all);
        let ids: Vec<_> = ordered.iter().map(|c| c.label().to_string()).collect();
        assert_eq!(ids, ["b", "d", "a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn downgrade_expires_and_emits_priority_change() {
        let prio = prioritizer(10);
        let mut events = prio.subscribe();
        let all = vec![cdn("a"), cdn("b")];

        prio.downgrade_cdn(&all[0]);
        assert_eq!(
            events.recv().await.unwrap(),
            CdnPriorityChange::Downgraded(all[0].clone())
        );
        assert_eq!(prio.get_cdn_preference_for_resource(&all)[0], all[1]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            events.recv().await.unwrap(),
            CdnPriorityChange::Restored(all[0].clone())
        );
        let ordered = prio.get_cdn_preference_for_resource(&all);
        assert_eq!(ordered.as_ref(), all.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn downgrading_again_resets_the_timer() {
        let prio = prioritizer(10);
        let a = cdn("a");

        prio.downgrade_cdn(&a);
        tokio::time::advance(Duration::from_secs(6)).await;
        prio.downgrade_cdn(&a);
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(prio.is_downgraded(&a));

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(!prio.is_downgraded(&a));
    }

    #[tokio::test(start_paused = true)]
    async fn disposal_clears_every_downgrade() {
        let token = CancellationToken::new();
        let prio = CdnPrioritizer::new(CdnConfig::default(), token.clone());
        let all = vec![cdn("a"), cdn("b")];
        prio.downgrade_cdn(&all[0]);

        token.cancel();
        let ordered = prio.get_cdn_preference_for_resource(&all);
        assert_eq!(ordered.as_ref(), all.as_slice());

        // No longer accepts downgrades once disposed.
        prio.downgrade_cdn(&all[0]);
        assert!(!prio.is_downgraded(&all[0]));
    }
}

use bytes::Bytes;
use moka::sync::Cache;
use std::sync::Arc;

use crate::model::SegmentContext;

/// Bounded cache of loaded initialization segments, keyed by representation and
/// segment identity.
///
/// Stored data is immutable [`Bytes`], so concurrent readers share it safely.
#[derive(Clone)]
pub struct InitSegmentCache {
    cache: Cache<(Arc<str>, Arc<str>), Bytes>,
}

impl InitSegmentCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::new(capacity),
        }
    }

    fn key(context: &SegmentContext) -> (Arc<str>, Arc<str>) {
        (
            Arc::clone(&context.representation.id),
            Arc::clone(&context.segment.id),
        )
    }

    pub fn get(&self, context: &SegmentContext) -> Option<Bytes> {
        self.cache.get(&Self::key(context))
    }

    pub fn insert(&self, context: &SegmentContext, data: Bytes) {
        self.cache.insert(Self::key(context), data);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

impl std::fmt::Debug for InitSegmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitSegmentCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

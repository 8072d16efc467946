//! Per-caller bucket registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::bucket::{Limit, TokenBucket};

/// A caller's bucket and when the caller was last seen.
#[derive(Debug)]
struct Visitor {
    bucket: TokenBucket,
    /// Nanoseconds since the registry epoch.
    last_seen: AtomicU64,
}

/// Concurrent map from caller key to an independent token bucket.
///
/// Lookups of known keys only take a read lock on the key's shard and
/// refresh `last_seen` atomically; creating a key takes that shard's write
/// lock, so concurrent first sightings of a key produce a single bucket.
#[derive(Debug)]
pub struct KeyedRegistry {
    visitors: DashMap<String, Visitor>,
    /// Configuration handed to buckets created from now on.
    defaults: RwLock<(Limit, u32)>,
    epoch: Instant,
}

impl KeyedRegistry {
    /// Create an empty registry whose buckets use `limit` and `burst`.
    pub fn new(limit: Limit, burst: u32) -> Self {
        Self {
            visitors: DashMap::new(),
            defaults: RwLock::new((limit, burst)),
            epoch: Instant::now(),
        }
    }

    /// Change the configuration of buckets created after this call.
    ///
    /// Existing buckets keep the configuration they were created with.
    pub fn set_defaults(&self, limit: Limit, burst: u32) {
        *self.defaults.write() = (limit, burst);
    }

    /// Change the defaults in place, holding the write lock for the whole
    /// update so concurrent changes to rate and burst are not lost.
    pub fn update_defaults<F>(&self, update: F)
    where
        F: FnOnce(&mut Limit, &mut u32),
    {
        let mut defaults = self.defaults.write();
        let (limit, burst) = &mut *defaults;
        update(limit, burst);
    }

    pub fn defaults(&self) -> (Limit, u32) {
        *self.defaults.read()
    }

    /// Shorthand for `get_or_create_at(key, Instant::now())`.
    pub fn get_or_create(&self, key: &str) -> TokenBucket {
        self.get_or_create_at(key, Instant::now())
    }

    /// Return the bucket for `key`, creating it on first sight, and mark the
    /// key as seen at `now`.
    pub fn get_or_create_at(&self, key: &str, now: Instant) -> TokenBucket {
        let seen = self.nanos_since_epoch(now);

        if let Some(visitor) = self.visitors.get(key) {
            visitor.last_seen.fetch_max(seen, Ordering::Relaxed);
            trace!(key = %key, "Found visitor");
            return visitor.bucket.clone();
        }

        let visitor = self.visitors.entry(key.to_owned()).or_insert_with(|| {
            let (limit, burst) = self.defaults();
            debug!(key = %key, limit = %limit, burst = burst, "Creating visitor bucket");
            Visitor {
                bucket: TokenBucket::new(limit, burst),
                last_seen: AtomicU64::new(seen),
            }
        });
        // A racing creator may have won; refresh its entry too.
        visitor.last_seen.fetch_max(seen, Ordering::Relaxed);
        visitor.bucket.clone()
    }

    /// Remove every visitor not seen since `now - max_idle`.
    ///
    /// A visitor whose bucket is still held elsewhere (a caller mid-query or
    /// a pending reservation) or still owes tokens is kept, so eviction never
    /// hands its key a fresh bucket early. Returns the number of visitors
    /// removed. Each shard is locked only while it is being visited.
    pub fn sweep(&self, now: Instant, max_idle: Duration) -> usize {
        let Some(cutoff) = now.checked_sub(max_idle) else {
            return 0;
        };
        if cutoff <= self.epoch {
            return 0;
        }
        let cutoff = self.nanos_since_epoch(cutoff);

        let before = self.visitors.len();
        self.visitors.retain(|_, visitor| {
            visitor.last_seen.load(Ordering::Relaxed) >= cutoff
                || visitor.bucket.is_shared()
                || visitor.bucket.in_debt_at(now)
        });
        let removed = before.saturating_sub(self.visitors.len());

        if removed > 0 {
            debug!(removed = removed, remaining = self.visitors.len(), "Evicted idle visitors");
        }
        removed
    }

    /// When `key` was last seen, if it is tracked.
    pub fn last_seen(&self, key: &str) -> Option<Instant> {
        self.visitors.get(key).map(|visitor| {
            self.epoch + Duration::from_nanos(visitor.last_seen.load(Ordering::Relaxed))
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.visitors.contains_key(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }

    fn nanos_since_epoch(&self, t: Instant) -> u64 {
        let nanos = t.saturating_duration_since(self.epoch).as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

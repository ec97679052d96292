//! In-process local tier (L1).
//!
//! A sharded [`DashMap`] keyed by cache key. Every operation only locks the
//! shard that owns its key. Capacity is reserved through an atomic occupancy
//! counter, and admission order lives in a lock-free queue that evicting
//! writers pop oldest-first, so writers of distinct keys never wait on one
//! another.
//!
//! No operation here performs I/O or awaits.

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use super::pattern::GlobPattern;
use super::policy::{self, DEFAULT_OCCUPANCY_CEILING};
use crate::config::LocalTierConfig;
use crate::error::{CacheError, Result};
use crate::metrics::{self, OperationMetrics, OperationMetricsSnapshot, Tier};

/// A value held by the local tier.
///
/// The payload is wrapped in `Arc` so hits hand out a reference instead of
/// copying potentially large blobs.
#[derive(Clone, Debug)]
pub struct LocalEntry {
    pub value: Arc<Vec<u8>>,
    pub created_at: Instant,
    pub ttl: Duration,
    seq: u64,
}

impl LocalEntry {
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    pub fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }

    fn refresh(&mut self, value: Arc<Vec<u8>>, now: Instant, ttl: Duration) {
        self.value = value;
        self.created_at = now;
        self.ttl = ttl;
    }
}

/// Local tier settings.
#[derive(Debug, Clone)]
pub struct LocalTierSettings {
    pub max_keys: usize,
    pub max_value_bytes: usize,
    pub default_ttl: Duration,
    pub occupancy_ceiling: f64,
}

impl LocalTierSettings {
    pub fn from_config(config: &LocalTierConfig) -> Self {
        Self {
            max_keys: config.max_keys,
            max_value_bytes: config.max_value_bytes,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            occupancy_ceiling: config.promotion_occupancy_ratio,
        }
    }
}

impl Default for LocalTierSettings {
    fn default() -> Self {
        Self::from_config(&LocalTierConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Caller write: replaces existing values and evicts to make room.
    Write,
    /// Copy of a distributed hit: only fills free headroom and never
    /// overwrites a value already held.
    Promotion,
}

/// Capacity- and TTL-bounded key/value store.
pub struct LocalTierStore {
    entries: DashMap<String, LocalEntry>,
    /// Admitted keys plus in-flight reservations; never above `max_keys`.
    occupied: AtomicUsize,
    /// Admission order as `(seq, key)`. Stale pairs (deleted, expired or
    /// re-admitted keys) are skipped when popped and dropped on compaction.
    admission: SegQueue<(u64, String)>,
    compacting: AtomicBool,
    next_seq: AtomicU64,
    max_keys: usize,
    watermark: usize,
    eviction_target: usize,
    max_value_bytes: usize,
    default_ttl: Duration,
    metrics: OperationMetrics,
    evictions: AtomicU64,
    expirations: AtomicU64,
    rejections: AtomicU64,
    promotions: AtomicU64,
}

impl LocalTierStore {
    pub fn new(settings: LocalTierSettings) -> Self {
        let max_keys = settings.max_keys.max(1);
        let watermark = policy::eviction_watermark(max_keys, settings.occupancy_ceiling);
        Self {
            entries: DashMap::new(),
            occupied: AtomicUsize::new(0),
            admission: SegQueue::new(),
            compacting: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            max_keys,
            watermark,
            eviction_target: policy::eviction_target(max_keys, watermark),
            max_value_bytes: settings.max_value_bytes,
            default_ttl: settings.default_ttl,
            metrics: OperationMetrics::new(),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
        }
    }

    /// Store with the given limits, the default TTL and the default ceiling.
    pub fn with_capacity(max_keys: usize, max_value_bytes: usize) -> Self {
        Self::new(LocalTierSettings {
            max_keys,
            max_value_bytes,
            default_ttl: LocalTierSettings::default().default_ttl,
            occupancy_ceiling: DEFAULT_OCCUPANCY_CEILING,
        })
    }

    /// Get a live value. Expired entries are removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let started = Instant::now();
        let result = self.lookup(key, started);
        self.metrics.record_latency(started.elapsed());
        match result {
            Some(_) => self.metrics.record_hit(),
            None => self.metrics.record_miss(),
        }
        result
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<Arc<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired_at(now) {
                return Some(Arc::clone(&entry.value));
            }
            drop(entry);
            // Only remove if a concurrent set has not refreshed it meanwhile.
            if self
                .entries
                .remove_if(key, |_, e| e.is_expired_at(now))
                .is_some()
            {
                self.release(1);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                metrics::record_evictions("expired", 1);
            }
        }
        None
    }

    /// Insert or replace a value.
    ///
    /// `ttl` of `None` or zero means the store default. Values above the
    /// admission threshold, and new keys that no eviction can make room for,
    /// are rejected with [`CacheError::LocalCapacity`].
    pub fn set(&self, key: &str, value: Arc<Vec<u8>>, ttl: Option<Duration>) -> Result<()> {
        if value.len() > self.max_value_bytes {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                key = %key,
                size = value.len(),
                max_value_bytes = self.max_value_bytes,
                "value too large for local tier"
            );
            return Err(CacheError::LocalCapacity {
                key: key.to_string(),
                reason: format!(
                    "{} bytes exceeds admission threshold of {} bytes",
                    value.len(),
                    self.max_value_bytes
                ),
            });
        }

        let ttl = ttl
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.default_ttl);

        if !self.admit(key, value, ttl, Admission::Write) {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(key = %key, max_keys = self.max_keys, "local tier full, value not admitted");
            return Err(CacheError::LocalCapacity {
                key: key.to_string(),
                reason: format!("store holds {} keys and none could be evicted", self.max_keys),
            });
        }
        self.metrics.record_set();
        Ok(())
    }

    /// Copy a value read from the distributed tier into the store.
    ///
    /// Only free headroom below the eviction watermark is used, and a key
    /// already held locally is left alone. Returns whether the value was
    /// admitted. Promotions are counted apart from caller writes.
    pub fn promote(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration) -> bool {
        if value.len() > self.max_value_bytes || ttl.is_zero() {
            return false;
        }
        let admitted = self.admit(key, value, ttl, Admission::Promotion);
        if admitted {
            self.promotions.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    fn admit(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration, admission: Admission) -> bool {
        let now = Instant::now();

        // Replacement keeps the admission slot and never needs eviction.
        if let Some(mut existing) = self.entries.get_mut(key) {
            if admission == Admission::Promotion {
                return false;
            }
            existing.refresh(value, now, ttl);
            return true;
        }

        if !self.reserve_slot(admission) {
            return false;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        match self.entries.entry(key.to_string()) {
            // Another writer admitted the key after the check above.
            Entry::Occupied(mut occupied) => {
                if admission == Admission::Write {
                    occupied.get_mut().refresh(value, now, ttl);
                }
                drop(occupied);
                self.release(1);
                return admission == Admission::Write;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LocalEntry {
                    value,
                    created_at: now,
                    ttl,
                    seq,
                });
            }
        }

        self.admission.push((seq, key.to_string()));
        self.compact_admission();
        true
    }

    /// Reserve room for one new key.
    ///
    /// Writes reaching the watermark evict oldest-admitted entries in a batch
    /// down to the eviction target, which leaves headroom for promotions.
    /// Promotions never evict.
    fn reserve_slot(&self, admission: Admission) -> bool {
        loop {
            let current = self.occupied.load(Ordering::Acquire);
            if current >= self.watermark {
                if admission == Admission::Promotion {
                    return false;
                }
                if self.evict_to(self.eviction_target) > 0 {
                    continue;
                }
                // Nothing evictable; only the hard capacity is left.
                if current >= self.max_keys {
                    return false;
                }
            }
            if self
                .occupied
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Evict oldest-admitted entries until at most `target` keys are held.
    fn evict_to(&self, target: usize) -> u64 {
        let mut evicted = 0;
        while self.occupied.load(Ordering::Acquire) > target {
            let Some((seq, key)) = self.admission.pop() else {
                break;
            };
            if self.entries.remove_if(&key, |_, e| e.seq == seq).is_some() {
                self.release(1);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            metrics::record_evictions("capacity", evicted);
            tracing::debug!(evicted, "evicted oldest local entries to admit new key");
        }
        evicted
    }

    /// Drop admission records whose entries are gone once stale records
    /// dominate. One compaction runs at a time; records pushed while it runs
    /// may end up ahead of older live ones.
    fn compact_admission(&self) {
        if self.admission.len() <= self.max_keys.saturating_mul(2) + 16 {
            return;
        }
        if self.compacting.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.admission.len() {
            let Some((seq, key)) = self.admission.pop() else {
                break;
            };
            let live = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.seq == seq);
            if live {
                self.admission.push((seq, key));
            }
        }
        self.compacting.store(false, Ordering::Release);
    }

    fn release(&self, count: usize) {
        self.occupied.fetch_sub(count, Ordering::AcqRel);
    }

    /// Remove a key. Returns whether it was present; deleting twice is harmless.
    pub fn delete(&self, key: &str) -> bool {
        self.metrics.record_delete();
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.release(1);
        }
        removed
    }

    /// Live keys matching `pattern`.
    ///
    /// Each call starts a fresh walk over the shards. The iterator holds shard
    /// read guards while it runs, so collect it before deleting what it yields.
    pub fn keys<'a>(&'a self, pattern: &'a GlobPattern) -> impl Iterator<Item = String> + 'a {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(move |entry| !entry.is_expired_at(now) && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
    }

    /// Remove every entry. Leftover admission records go stale and are
    /// skipped.
    pub fn flush(&self) {
        let mut removed = 0;
        self.entries.retain(|_, _| {
            removed += 1;
            false
        });
        self.release(removed);
        tracing::info!(removed, "local tier flushed");
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            if entry.is_expired_at(now) {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.release(removed);
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            metrics::record_evictions("expired", removed as u64);
        }
        metrics::set_cache_entries(Tier::Local, self.entries.len());

        removed
    }

    /// Start the periodic expiry sweep.
    ///
    /// Returns a shutdown sender; sending `true` (or dropping it) stops the task.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let store = Arc::clone(self);

        tokio::spawn(async move {
            tracing::debug!(interval_ms = every.as_millis() as u64, "local tier sweeper started");
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired local entries");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::debug!("local tier sweeper stopped");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    pub fn max_value_bytes(&self) -> usize {
        self.max_value_bytes
    }

    /// Current fill ratio against `max_keys`, read without touching the shards.
    pub fn occupancy(&self) -> f64 {
        policy::occupancy(self.occupied.load(Ordering::Acquire), self.max_keys)
    }

    pub fn stats(&self) -> LocalTierStats {
        LocalTierStats {
            operations: self.metrics.snapshot(),
            entries: self.entries.len(),
            max_keys: self.max_keys,
            occupancy: self.occupancy(),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
        }
    }
}

/// Local tier statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTierStats {
    #[serde(flatten)]
    pub operations: OperationMetricsSnapshot,
    pub entries: usize,
    pub max_keys: usize,
    pub occupancy: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejections: u64,
    /// Distributed hits copied in; not counted in `sets`.
    pub promotions: u64,
}

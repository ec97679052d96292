//! Multi-tier cache coordinator.
//!
//! ## Read path
//!
//! ```text
//! get(key) → local tier ──hit──→ value
//!               │ miss
//!               ↓
//!          distributed tier ──hit──→ promote (policy permitting) → value
//!               │ miss / error
//!               ↓
//!             absent
//! ```
//!
//! Distributed failures never reach callers on the read path; they are
//! counted and reported through [`MultiTierCache::statistics`]. Writes report
//! per-tier outcomes in a [`WriteOutcome`] instead of failing as a whole.
//!
//! Entries expire strictly at their TTL. A local copy is never served past
//! its TTL, even while the distributed tier is unreachable, and a promoted
//! copy never outlives the distributed entry it was read from.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::codec::CacheCodec;
use super::invalidation::{InvalidationMessage, InvalidationReport, InvalidationTarget};
use super::local::{LocalTierStats, LocalTierStore};
use super::pattern::GlobPattern;
use super::policy::TierPolicy;
use crate::cluster::{
    CacheCommand, ClientError, ClusterManager, ClusterSnapshot, ClusterState, CommandReply,
    StoredValue,
};
use crate::error::{CacheError, Result};
use crate::metrics::{self, OperationMetrics, OperationMetricsSnapshot, Tier};

/// Per-call TTL overrides. `None` means the tier default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub local_ttl: Option<Duration>,
    pub distributed_ttl: Option<Duration>,
}

impl SetOptions {
    /// Same TTL on both tiers.
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            local_ttl: Some(ttl),
            distributed_ttl: Some(ttl),
        }
    }
}

/// Result of writing to one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TierWrite {
    Applied,
    /// Placement policy kept the value out of this tier.
    Skipped,
    Failed(String),
    /// Tier not configured.
    Disabled,
}

impl TierWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Per-tier outcome of a write or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub local: TierWrite,
    pub distributed: TierWrite,
}

/// Per-tier outcome of [`MultiTierCache::mset`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWriteOutcome {
    pub local_stored: usize,
    pub local_skipped: usize,
    pub distributed: TierWrite,
}

/// Combined statistics of both tiers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub local: LocalTierStats,
    pub distributed: DistributedStats,
    /// `(local hits + distributed hits) / requests`; every request reaches the
    /// local tier first.
    pub overall_hit_rate: f64,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedStats {
    pub enabled: bool,
    pub cluster_id: Option<String>,
    pub state: Option<ClusterState>,
    /// Enabled but not fully `ready`.
    pub degraded: bool,
    #[serde(flatten)]
    pub operations: OperationMetricsSnapshot,
    pub clusters: BTreeMap<String, ClusterSnapshot>,
}

struct DistributedTier {
    manager: ClusterManager,
    cluster_id: String,
    default_ttl: Duration,
    mset_concurrency: usize,
}

struct Broadcast {
    channel: String,
    origin: Uuid,
}

/// Local + distributed cache behind one API.
pub struct MultiTierCache {
    local: Arc<LocalTierStore>,
    distributed: Option<DistributedTier>,
    policy: TierPolicy,
    promotion_ttl: Duration,
    metrics: OperationMetrics,
    broadcast: Option<Broadcast>,
}

impl MultiTierCache {
    /// Local-only cache.
    pub fn new(local: Arc<LocalTierStore>, policy: TierPolicy, promotion_ttl: Duration) -> Self {
        Self {
            local,
            distributed: None,
            policy,
            promotion_ttl,
            metrics: OperationMetrics::new(),
            broadcast: None,
        }
    }

    /// Back the cache with a cluster owned by `manager`.
    pub fn with_distributed(
        mut self,
        manager: ClusterManager,
        cluster_id: impl Into<String>,
        default_ttl: Duration,
        mset_concurrency: usize,
    ) -> Self {
        self.distributed = Some(DistributedTier {
            manager,
            cluster_id: cluster_id.into(),
            default_ttl,
            mset_concurrency: mset_concurrency.max(1),
        });
        self
    }

    /// Publish deletes and pattern invalidations on `channel`.
    pub fn with_invalidation_broadcast(mut self, channel: impl Into<String>, origin: Uuid) -> Self {
        self.broadcast = Some(Broadcast {
            channel: channel.into(),
            origin,
        });
        self
    }

    pub fn local(&self) -> &Arc<LocalTierStore> {
        &self.local
    }

    pub fn policy(&self) -> TierPolicy {
        self.policy
    }

    pub fn distributed_cluster(&self) -> Option<&str> {
        self.distributed.as_ref().map(|d| d.cluster_id.as_str())
    }

    pub fn origin(&self) -> Option<Uuid> {
        self.broadcast.as_ref().map(|b| b.origin)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Raw bytes for `key`, or `None` on a miss in both tiers.
    pub async fn get_bytes(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(value) = self.local.get(key) {
            metrics::record_cache_hit(Tier::Local);
            tracing::debug!(key = %key, tier = "local", "cache hit");
            return Some(value);
        }
        metrics::record_cache_miss(Tier::Local);

        let tier = self.distributed.as_ref()?;
        let started = Instant::now();
        let result = tier
            .manager
            .execute(&tier.cluster_id, CacheCommand::Get { key: key.to_string() })
            .await
            .and_then(|reply| reply.into_value().map_err(|e| reply_error(tier, e)));
        self.metrics.record_latency(started.elapsed());

        match result {
            Ok(Some(stored)) => {
                self.metrics.record_hit();
                metrics::record_cache_hit(Tier::Distributed);
                tracing::debug!(key = %key, tier = "distributed", "cache hit");
                self.promote(key, &stored, started.elapsed());
                Some(stored.bytes)
            }
            Ok(None) => {
                self.metrics.record_miss();
                metrics::record_cache_miss(Tier::Distributed);
                tracing::debug!(key = %key, "cache miss");
                None
            }
            Err(e) => {
                self.record_distributed_error("GET", &e);
                None
            }
        }
    }

    /// Decoded value for `key`. Bytes that fail to decode are invalidated and
    /// reported as a miss.
    pub async fn get<V: CacheCodec>(&self, key: &str) -> Option<V> {
        let bytes = self.get_bytes(key).await?;
        match V::decode(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable cached value, invalidating");
                self.delete(key).await;
                None
            }
        }
    }

    /// Raw bytes for every key found in either tier.
    ///
    /// Local hits are served directly; all remaining keys go to the
    /// distributed tier in one batched request.
    pub async fn mget_bytes<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, Arc<Vec<u8>>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut remaining = Vec::new();
        let mut seen = HashSet::with_capacity(keys.len());

        for key in keys.iter().map(AsRef::as_ref) {
            if !seen.insert(key) {
                continue;
            }
            match self.local.get(key) {
                Some(value) => {
                    metrics::record_cache_hit(Tier::Local);
                    found.insert(key.to_string(), value);
                }
                None => {
                    metrics::record_cache_miss(Tier::Local);
                    remaining.push(key.to_string());
                }
            }
        }

        let Some(tier) = self.distributed.as_ref() else {
            return found;
        };
        if remaining.is_empty() {
            return found;
        }

        let started = Instant::now();
        let result = tier
            .manager
            .execute(
                &tier.cluster_id,
                CacheCommand::MGet {
                    keys: remaining.clone(),
                },
            )
            .await
            .and_then(|reply| reply.into_values().map_err(|e| reply_error(tier, e)));
        self.metrics.record_latency(started.elapsed());

        match result {
            Ok(values) => {
                let elapsed = started.elapsed();
                for (key, value) in remaining.into_iter().zip(values) {
                    match value {
                        Some(stored) => {
                            self.metrics.record_hit();
                            metrics::record_cache_hit(Tier::Distributed);
                            self.promote(&key, &stored, elapsed);
                            found.insert(key, stored.bytes);
                        }
                        None => {
                            self.metrics.record_miss();
                            metrics::record_cache_miss(Tier::Distributed);
                        }
                    }
                }
            }
            Err(e) => self.record_distributed_error("MGET", &e),
        }

        found
    }

    /// Decoded values for every key found in either tier.
    pub async fn mget<V: CacheCodec, K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, V> {
        let mut decoded = HashMap::new();
        for (key, bytes) in self.mget_bytes(keys).await {
            match V::decode(&bytes) {
                Ok(value) => {
                    decoded.insert(key, value);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "undecodable cached value, invalidating");
                    self.delete(&key).await;
                }
            }
        }
        decoded
    }

    /// Copy a distributed hit into the local tier for at most the time the
    /// distributed entry has left, less the read's round trip.
    fn promote(&self, key: &str, stored: &StoredValue, elapsed: Duration) {
        let size = stored.bytes.len();
        let occupancy = self.local.occupancy();
        if !self.policy.should_promote(size, occupancy) {
            tracing::debug!(key = %key, size, occupancy, "distributed hit not promoted");
            return;
        }

        let Some(ttl) = bounded_promotion_ttl(self.promotion_ttl, stored.remaining_ttl, elapsed) else {
            tracing::debug!(key = %key, "distributed hit has no remaining ttl, not promoted");
            return;
        };
        if !self.local.promote(key, Arc::clone(&stored.bytes), ttl) {
            tracing::debug!(key = %key, occupancy, "promotion declined by local tier");
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Encode and write `value` to both tiers.
    ///
    /// Fails only when the value cannot be encoded; tier failures are
    /// reported in the outcome.
    pub async fn set<V: CacheCodec>(
        &self,
        key: &str,
        value: &V,
        options: SetOptions,
    ) -> Result<WriteOutcome> {
        let bytes = Arc::new(value.encode()?);
        Ok(self.set_bytes(key, bytes, options).await)
    }

    pub async fn set_bytes(&self, key: &str, value: Arc<Vec<u8>>, options: SetOptions) -> WriteOutcome {
        let local = if self.policy.should_store_local(value.len()) {
            match self.local.set(key, Arc::clone(&value), options.local_ttl) {
                Ok(()) => TierWrite::Applied,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "local tier write failed");
                    TierWrite::Failed(e.to_string())
                }
            }
        } else {
            // A previous, smaller value must not shadow this one.
            self.local.delete(key);
            tracing::debug!(key = %key, size = value.len(), "value kept out of local tier");
            TierWrite::Skipped
        };

        let distributed = match &self.distributed {
            None => TierWrite::Disabled,
            Some(tier) => {
                let ttl = options
                    .distributed_ttl
                    .filter(|ttl| !ttl.is_zero())
                    .unwrap_or(tier.default_ttl);
                let started = Instant::now();
                let result = tier
                    .manager
                    .execute(
                        &tier.cluster_id,
                        CacheCommand::Set {
                            key: key.to_string(),
                            value,
                            ttl,
                        },
                    )
                    .await;
                self.metrics.record_latency(started.elapsed());
                match result {
                    Ok(_) => {
                        self.metrics.record_set();
                        TierWrite::Applied
                    }
                    Err(e) => {
                        self.record_distributed_error("SET", &e);
                        TierWrite::Failed(e.to_string())
                    }
                }
            }
        };

        WriteOutcome { local, distributed }
    }

    /// Write many values. Local writes are applied one by one; distributed
    /// writes go out as one pipelined request when the cluster supports it,
    /// otherwise as individual writes with bounded concurrency.
    pub async fn mset<K: AsRef<str>, V: CacheCodec>(
        &self,
        entries: &[(K, V)],
        ttl: Option<Duration>,
    ) -> Result<BatchWriteOutcome> {
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.as_ref().to_string(), Arc::new(value.encode()?))))
            .collect::<Result<Vec<(String, Arc<Vec<u8>>)>>>()?;

        let mut local_stored = 0;
        let mut local_skipped = 0;
        for (key, value) in &encoded {
            if !self.policy.should_store_local(value.len()) {
                self.local.delete(key);
                local_skipped += 1;
                continue;
            }
            match self.local.set(key, Arc::clone(value), ttl) {
                Ok(()) => local_stored += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "local tier write failed");
                    local_skipped += 1;
                }
            }
        }

        let distributed = match &self.distributed {
            None => TierWrite::Disabled,
            Some(_) if encoded.is_empty() => TierWrite::Applied,
            Some(tier) => self.mset_distributed(tier, encoded, ttl).await,
        };

        Ok(BatchWriteOutcome {
            local_stored,
            local_skipped,
            distributed,
        })
    }

    async fn mset_distributed(
        &self,
        tier: &DistributedTier,
        entries: Vec<(String, Arc<Vec<u8>>)>,
        ttl: Option<Duration>,
    ) -> TierWrite {
        let ttl = ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(tier.default_ttl);
        let total = entries.len();
        let started = Instant::now();

        if tier.manager.supports_pipeline(&tier.cluster_id) {
            let result = tier
                .manager
                .execute(&tier.cluster_id, CacheCommand::MSet { entries, ttl })
                .await;
            self.metrics.record_latency(started.elapsed());
            return match result {
                Ok(_) => {
                    self.metrics.record_set();
                    TierWrite::Applied
                }
                Err(e) => {
                    self.record_distributed_error("MSET", &e);
                    TierWrite::Failed(e.to_string())
                }
            };
        }

        let results: Vec<Result<CommandReply>> = stream::iter(entries)
            .map(|(key, value)| {
                tier.manager
                    .execute(&tier.cluster_id, CacheCommand::Set { key, value, ttl })
            })
            .buffer_unordered(tier.mset_concurrency)
            .collect()
            .await;
        self.metrics.record_latency(started.elapsed());

        let mut first_error = None;
        let mut failed = 0;
        for result in results {
            match result {
                Ok(_) => self.metrics.record_set(),
                Err(e) => {
                    failed += 1;
                    self.record_distributed_error("SET", &e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            None => TierWrite::Applied,
            Some(e) => TierWrite::Failed(format!("{failed} of {total} writes failed: {e}")),
        }
    }

    /// Remove `key` from both tiers. Both are attempted regardless of the
    /// other's outcome.
    pub async fn delete(&self, key: &str) -> WriteOutcome {
        self.local.delete(key);

        let distributed = match &self.distributed {
            None => TierWrite::Disabled,
            Some(tier) => {
                let result = tier
                    .manager
                    .execute(
                        &tier.cluster_id,
                        CacheCommand::Delete {
                            keys: vec![key.to_string()],
                        },
                    )
                    .await;
                match result {
                    Ok(_) => {
                        self.metrics.record_delete();
                        TierWrite::Applied
                    }
                    Err(e) => {
                        self.record_distributed_error("DEL", &e);
                        TierWrite::Failed(e.to_string())
                    }
                }
            }
        };

        if let Some(broadcast) = &self.broadcast {
            self.publish(InvalidationMessage::key(broadcast.origin, key))
                .await;
        }

        WriteOutcome {
            local: TierWrite::Applied,
            distributed,
        }
    }

    /// Delete every key matching a glob pattern (`*`, `?`) from both tiers.
    ///
    /// The two tiers are not cleared atomically; a concurrent reader may see
    /// a stale value for one round trip.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<InvalidationReport> {
        let glob = GlobPattern::new(pattern)?;

        let local_keys: Vec<String> = self.local.keys(&glob).collect();
        let local_removed = local_keys.iter().filter(|key| self.local.delete(key)).count();

        let (distributed_removed, distributed_error) = match &self.distributed {
            None => (None, None),
            Some(tier) => {
                let result = tier
                    .manager
                    .execute(
                        &tier.cluster_id,
                        CacheCommand::DeletePattern {
                            pattern: glob.clone(),
                        },
                    )
                    .await
                    .and_then(|reply| reply.into_count().map_err(|e| reply_error(tier, e)));
                match result {
                    Ok(removed) => {
                        self.metrics.record_delete();
                        (Some(removed), None)
                    }
                    Err(e) => {
                        self.record_distributed_error("DELPATTERN", &e);
                        (None, Some(e.to_string()))
                    }
                }
            }
        };

        if let Some(broadcast) = &self.broadcast {
            self.publish(InvalidationMessage::pattern(broadcast.origin, pattern))
                .await;
        }

        tracing::info!(
            pattern = %pattern,
            local_removed,
            distributed_removed = ?distributed_removed,
            "pattern invalidated"
        );

        Ok(InvalidationReport {
            pattern: pattern.to_string(),
            local_removed,
            distributed_removed,
            distributed_error,
        })
    }

    /// Apply an invalidation published by another instance to the local tier.
    ///
    /// Returns the number of local entries removed; self-originated messages
    /// are ignored.
    pub fn apply_invalidation(&self, message: &InvalidationMessage) -> Result<usize> {
        if self.origin() == Some(message.origin) {
            return Ok(0);
        }

        let removed = match &message.target {
            InvalidationTarget::Key(key) => usize::from(self.local.delete(key)),
            InvalidationTarget::Pattern(pattern) => {
                let glob = GlobPattern::new(pattern)?;
                let keys: Vec<String> = self.local.keys(&glob).collect();
                keys.iter().filter(|key| self.local.delete(key)).count()
            }
        };

        tracing::debug!(
            origin = %message.origin,
            target = ?message.target,
            removed,
            "applied remote invalidation"
        );
        Ok(removed)
    }

    async fn publish(&self, message: InvalidationMessage) {
        let (Some(tier), Some(broadcast)) = (&self.distributed, &self.broadcast) else {
            return;
        };

        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode invalidation message");
                return;
            }
        };

        let result = tier
            .manager
            .execute(
                &tier.cluster_id,
                CacheCommand::Publish {
                    channel: broadcast.channel.clone(),
                    payload,
                },
            )
            .await;
        match result {
            Ok(_) => tracing::debug!(channel = %broadcast.channel, "published cache invalidation"),
            Err(e) => tracing::warn!(
                channel = %broadcast.channel,
                error = %e,
                "failed to publish cache invalidation"
            ),
        }
    }

    fn record_distributed_error(&self, operation: &'static str, error: &CacheError) {
        self.metrics.record_error();
        if error.is_degradation() {
            tracing::warn!(operation, error = %error, "distributed tier unavailable, continuing with local tier");
        } else {
            tracing::warn!(operation, error = %error, "distributed operation failed");
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn statistics(&self) -> CacheStatistics {
        let local = self.local.stats();
        metrics::set_cache_entries(Tier::Local, local.entries);

        let operations = self.metrics.snapshot();
        let distributed = match &self.distributed {
            None => DistributedStats {
                enabled: false,
                cluster_id: None,
                state: None,
                degraded: false,
                operations,
                clusters: BTreeMap::new(),
            },
            Some(tier) => {
                let state = tier.manager.state(&tier.cluster_id);
                DistributedStats {
                    enabled: true,
                    cluster_id: Some(tier.cluster_id.clone()),
                    state,
                    degraded: state != Some(ClusterState::Ready),
                    operations,
                    clusters: tier.manager.get_cluster_statistics(),
                }
            }
        };

        let total_requests = local.operations.hits + local.operations.misses;
        let overall_hit_rate = metrics::hit_rate(
            local.operations.hits + distributed.operations.hits,
            total_requests,
        );

        CacheStatistics {
            local,
            distributed,
            overall_hit_rate,
            total_requests,
        }
    }
}

/// `min(ceiling, remaining - elapsed)`; `None` when nothing is left or the
/// remaining time is unknown.
fn bounded_promotion_ttl(ceiling: Duration, remaining: Option<Duration>, elapsed: Duration) -> Option<Duration> {
    remaining
        .map(|remaining| remaining.saturating_sub(elapsed).min(ceiling))
        .filter(|ttl| !ttl.is_zero())
}

fn reply_error(tier: &DistributedTier, error: ClientError) -> CacheError {
    CacheError::DistributedUnavailable {
        cluster_id: tier.cluster_id.clone(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::Json;
    use crate::cache::local::LocalTierStore;
    use crate::cache::policy::DEFAULT_OCCUPANCY_CEILING;
    use crate::cluster::{ClusterOptions, ErrorClass, MemoryConnector, NodeClient, NodeRole};
    use serde::Deserialize;

    fn local_only(max_keys: usize) -> MultiTierCache {
        MultiTierCache::new(
            Arc::new(LocalTierStore::with_capacity(max_keys, 1024)),
            TierPolicy::new(1024, DEFAULT_OCCUPANCY_CEILING),
            Duration::from_secs(60),
        )
    }

    async fn two_tier(max_keys: usize) -> (MultiTierCache, MemoryConnector) {
        let connector = MemoryConnector::new();
        connector.add_node("n1", NodeRole::Primary);
        let manager = ClusterManager::new(Arc::new(connector.clone()));
        manager
            .initialize_cluster(
                "main",
                &["n1".to_string()],
                ClusterOptions {
                    min_primaries: 1,
                    ..ClusterOptions::default()
                },
            )
            .await
            .unwrap();
        let cache = local_only(max_keys).with_distributed(manager, "main", Duration::from_secs(60), 4);
        (cache, connector)
    }

    #[tokio::test]
    async fn test_local_only_round_trip() {
        let cache = local_only(10);
        let outcome = cache
            .set("greeting", &"hello".to_string(), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.local, TierWrite::Applied);
        assert_eq!(outcome.distributed, TierWrite::Disabled);
        assert_eq!(cache.get::<String>("greeting").await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_promotion_serves_second_read_locally() {
        let (cache, connector) = two_tier(10).await;
        connector
            .node("n1")
            .unwrap()
            .execute(&CacheCommand::Set {
                key: "k".into(),
                value: Arc::new(b"remote".to_vec()),
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();

        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("remote"));
        let reads = connector.reads();
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("remote"));
        assert_eq!(connector.reads(), reads);
    }

    #[test]
    fn test_promotion_ttl_is_bounded_by_remaining_time() {
        let ceiling = Duration::from_secs(60);
        assert_eq!(
            bounded_promotion_ttl(ceiling, Some(Duration::from_secs(300)), Duration::ZERO),
            Some(ceiling)
        );
        assert_eq!(
            bounded_promotion_ttl(ceiling, Some(Duration::from_millis(300)), Duration::from_millis(100)),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            bounded_promotion_ttl(ceiling, Some(Duration::from_millis(50)), Duration::from_millis(80)),
            None
        );
        assert_eq!(bounded_promotion_ttl(ceiling, None, Duration::ZERO), None);
    }

    #[tokio::test]
    async fn test_promotion_is_not_counted_as_local_write() {
        let (cache, connector) = two_tier(10).await;
        connector
            .node("n1")
            .unwrap()
            .execute(&CacheCommand::Set {
                key: "k".into(),
                value: Arc::new(b"remote".to_vec()),
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();

        assert!(cache.get_bytes("k").await.is_some());
        let local = cache.statistics().local;
        assert_eq!(local.operations.sets, 0);
        assert_eq!(local.promotions, 1);
    }

    #[tokio::test]
    async fn test_oversized_value_skips_local_tier() {
        let (cache, connector) = two_tier(10).await;
        cache.set("big", &"small".to_string(), SetOptions::default()).await.unwrap();

        let big = vec![7u8; 4096];
        let outcome = cache.set("big", &big, SetOptions::default()).await.unwrap();
        assert_eq!(outcome.local, TierWrite::Skipped);
        assert_eq!(outcome.distributed, TierWrite::Applied);
        assert!(cache.local().get("big").is_none());
        assert_eq!(cache.get::<Vec<u8>>("big").await, Some(big));
        // Still too big to promote
        assert!(cache.local().get("big").is_none());
        assert!(connector.contains("big"));
    }

    #[tokio::test]
    async fn test_undecodable_value_is_invalidated() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Course {
            code: String,
        }

        let cache = local_only(10);
        cache
            .set("course", &"not json".to_string(), SetOptions::default())
            .await
            .unwrap();
        assert!(cache.get::<Json<Course>>("course").await.is_none());
        assert!(cache.local().get("course").is_none());
    }

    #[tokio::test]
    async fn test_distributed_failure_is_reported_not_raised() {
        let (cache, connector) = two_tier(10).await;
        connector.set_failure(Some(ErrorClass::Network));

        let outcome = cache
            .set("k", &"v".to_string(), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.local, TierWrite::Applied);
        assert!(matches!(outcome.distributed, TierWrite::Failed(_)));
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));
        assert!(cache.get::<String>("absent").await.is_none());

        let stats = cache.statistics();
        assert!(stats.distributed.degraded);
        assert!(stats.distributed.operations.errors >= 2);
    }

    #[tokio::test]
    async fn test_remote_invalidation_ignores_own_origin() {
        let origin = Uuid::new_v4();
        let cache = local_only(10).with_invalidation_broadcast("cache:invalidate", origin);
        cache.set("a", &"1".to_string(), SetOptions::default()).await.unwrap();

        let own = InvalidationMessage::key(origin, "a");
        assert_eq!(cache.apply_invalidation(&own).unwrap(), 0);
        assert!(cache.local().get("a").is_some());

        let remote = InvalidationMessage::key(Uuid::new_v4(), "a");
        assert_eq!(cache.apply_invalidation(&remote).unwrap(), 1);
        assert!(cache.local().get("a").is_none());
    }

    #[tokio::test]
    async fn test_deletes_are_broadcast() {
        let (cache, connector) = two_tier(10).await;
        let cache = cache.with_invalidation_broadcast("cache:invalidate", Uuid::new_v4());
        cache.delete("k").await;
        cache.invalidate_pattern("user:*").await.unwrap();

        let published = connector.node("n1").unwrap().published();
        assert_eq!(published.len(), 2);
        let message = InvalidationMessage::from_json(&published[1].1).unwrap();
        assert_eq!(message.target, InvalidationTarget::Pattern("user:*".into()));
    }

    #[tokio::test]
    async fn test_mset_without_pipeline_uses_individual_writes() {
        let (cache, connector) = two_tier(10).await;
        connector.node("n1").unwrap().set_pipeline_support(false);
        let before = connector.commands();

        let entries = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("c".to_string(), "3".to_string()),
        ];
        let outcome = cache.mset(&entries, None).await.unwrap();
        assert_eq!(outcome.local_stored, 3);
        assert_eq!(outcome.distributed, TierWrite::Applied);
        assert_eq!(connector.commands() - before, 3);
        assert!(connector.contains("c"));
    }
}

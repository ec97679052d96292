//! Caching facade: the one object the rest of the backend depends on.
//!
//! Construct it once at startup with [`CacheService::initialize`] and hand out
//! `Arc<CacheService>` to consumers. It holds no cache logic of its own.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::cache::{
    BatchWriteOutcome, CacheCodec, CacheStatistics, InvalidationListener, InvalidationReport,
    InvalidationRuleSource, LocalTierSettings, LocalTierStore, MultiTierCache, SetOptions,
    TierPolicy, WriteOutcome,
};
use crate::cluster::redis::node_url;
use crate::cluster::{ClusterManager, ClusterOptions, NodeConnector, RedisConnector, TopologyEvent};
use crate::config::CacheConfig;
use crate::error::Result;

pub struct CacheService {
    config: CacheConfig,
    cache: Arc<MultiTierCache>,
    manager: Option<ClusterManager>,
    /// Shutdown senders of every background task.
    background: Mutex<Vec<watch::Sender<bool>>>,
    ready: AtomicBool,
}

impl CacheService {
    /// Initialize against Redis clusters.
    ///
    /// ## Cache modes
    ///
    /// - **Distributed disabled**: local-only cache
    /// - **Distributed enabled**: connects every configured cluster; a cluster
    ///   that cannot be reached is logged and skipped (local-only for it)
    ///   unless `distributed.required` is set
    ///
    /// Only an invalid configuration is always fatal.
    pub async fn initialize(config: CacheConfig) -> Result<Self> {
        let service = Self::initialize_with_connector(config, Arc::new(RedisConnector)).await?;
        service.start_invalidation_listener();
        Ok(service)
    }

    /// Initialize with any node connector (Redis, in-memory, ...).
    pub async fn initialize_with_connector(
        config: CacheConfig,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self> {
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "invalid cache configuration");
            return Err(e);
        }

        let local = Arc::new(LocalTierStore::new(LocalTierSettings::from_config(
            &config.local,
        )));
        let mut background = vec![local.spawn_sweeper(config.local.sweep_interval())];

        let policy = TierPolicy::new(
            config.local.max_value_bytes,
            config.local.promotion_occupancy_ratio,
        );
        let mut cache = MultiTierCache::new(local, policy, config.local.promotion_ttl());
        let mut manager = None;

        let distributed = &config.distributed;
        if !distributed.enabled {
            tracing::info!("distributed tier disabled, using local cache only");
        } else {
            let clusters = ClusterManager::new(connector);
            let mut connected = Vec::new();

            for cluster in &distributed.clusters {
                tracing::info!(cluster_id = %cluster.id, nodes = ?cluster.nodes, "connecting to cluster");
                let options = ClusterOptions::from_config(distributed, cluster);
                match clusters
                    .initialize_cluster(&cluster.id, &cluster.nodes, options)
                    .await
                {
                    Ok(topology) => {
                        tracing::info!(
                            cluster_id = %cluster.id,
                            state = %topology.state,
                            healthy = topology.healthy_count(),
                            "connected to cluster"
                        );
                        connected.push(cluster.id.clone());
                    }
                    Err(e) if e.is_fatal() || distributed.required => {
                        tracing::error!(cluster_id = %cluster.id, error = %e, "required cluster unavailable");
                        clusters.shutdown();
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(
                            cluster_id = %cluster.id,
                            error = %e,
                            "failed to connect to cluster, falling back to local cache"
                        );
                    }
                }
            }

            match distributed.primary().map(|c| c.id.clone()) {
                Some(primary) if connected.contains(&primary) => {
                    cache = cache.with_distributed(
                        clusters.clone(),
                        primary,
                        distributed.default_ttl(),
                        distributed.mset_concurrency,
                    );
                    if distributed.broadcast_invalidations {
                        cache = cache.with_invalidation_broadcast(
                            distributed.invalidation_channel.clone(),
                            Uuid::new_v4(),
                        );
                    }
                }
                Some(primary) => {
                    tracing::warn!(cluster_id = %primary, "primary cluster unavailable, serving from local cache only");
                }
                None => {}
            }

            if !connected.is_empty() {
                background.push(clusters.start_health_monitoring(distributed.health_check_interval()));
                manager = Some(clusters);
            }
        }

        let service = Self {
            config,
            cache: Arc::new(cache),
            manager,
            background: Mutex::new(background),
            ready: AtomicBool::new(true),
        };
        tracing::info!(
            distributed = service.cache.distributed_cluster().unwrap_or("disabled"),
            "cache service ready"
        );
        Ok(service)
    }

    /// Subscribe to peer invalidations over Redis Pub/Sub when broadcasting.
    fn start_invalidation_listener(&self) {
        let distributed = &self.config.distributed;
        if !distributed.broadcast_invalidations || self.cache.origin().is_none() {
            return;
        }
        let Some(cluster) = distributed.primary() else {
            return;
        };
        let Some(node) = cluster.nodes.first() else {
            return;
        };

        let redis_url = match node_url(
            node,
            cluster.username.as_deref(),
            cluster.password.as_deref(),
            cluster.database,
        ) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "cannot start invalidation listener");
                return;
            }
        };

        let shutdown = InvalidationListener {
            redis_url,
            channel: distributed.invalidation_channel.clone(),
            cache: Arc::clone(&self.cache),
        }
        .start();
        self.background.lock().push(shutdown);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MultiTierCache> {
        &self.cache
    }

    pub fn cluster_manager(&self) -> Option<&ClusterManager> {
        self.manager.as_ref()
    }

    /// Topology change stream; `None` when no cluster is connected.
    pub fn subscribe_topology(&self) -> Option<mpsc::UnboundedReceiver<TopologyEvent>> {
        self.manager.as_ref().map(ClusterManager::subscribe)
    }

    pub async fn get<V: CacheCodec>(&self, key: &str) -> Option<V> {
        self.cache.get(key).await
    }

    /// Write to both tiers with the same TTL (`None` = tier defaults).
    pub async fn set<V: CacheCodec>(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<WriteOutcome> {
        let options = SetOptions {
            local_ttl: ttl,
            distributed_ttl: ttl,
        };
        self.cache.set(key, value, options).await
    }

    pub async fn set_with<V: CacheCodec>(
        &self,
        key: &str,
        value: &V,
        options: SetOptions,
    ) -> Result<WriteOutcome> {
        self.cache.set(key, value, options).await
    }

    pub async fn delete(&self, key: &str) -> WriteOutcome {
        self.cache.delete(key).await
    }

    pub async fn mget<V: CacheCodec, K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, V> {
        self.cache.mget(keys).await
    }

    pub async fn mset<K: AsRef<str>, V: CacheCodec>(
        &self,
        entries: &[(K, V)],
        ttl: Option<Duration>,
    ) -> Result<BatchWriteOutcome> {
        self.cache.mset(entries, ttl).await
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<InvalidationReport> {
        self.cache.invalidate_pattern(pattern).await
    }

    /// Invalidate every pattern the rule source maps `event_type` to.
    ///
    /// Invalid patterns are logged and skipped.
    pub async fn handle_event(
        &self,
        event_type: &str,
        rules: &dyn InvalidationRuleSource,
    ) -> Vec<InvalidationReport> {
        let patterns = rules.patterns_for(event_type);
        let mut reports = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match self.cache.invalidate_pattern(&pattern).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!(event_type, pattern = %pattern, error = %e, "skipping invalidation rule");
                }
            }
        }
        tracing::debug!(event_type, invalidated = reports.len(), "event invalidation applied");
        reports
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.cache.statistics()
    }

    /// Stop background tasks and close every cluster. The local tier keeps
    /// serving whatever it holds.
    pub fn shutdown(&self) {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return;
        }
        for signal in self.background.lock().drain(..) {
            let _ = signal.send(true);
        }
        if let Some(manager) = &self.manager {
            manager.shutdown();
        }
        tracing::info!("cache service shut down");
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TierWrite;
    use crate::cluster::{MemoryConnector, NodeRole};
    use crate::config::ClusterConfig;
    use crate::error::CacheError;
    use tokio_test::block_on;

    fn distributed_config(nodes: &[&str]) -> CacheConfig {
        let mut config = CacheConfig::default();
        config.distributed.enabled = true;
        config.distributed.max_connect_attempts = 1;
        config.distributed.reconnect_base_delay_ms = 10;
        config.distributed.min_primaries = 1;
        config.distributed.clusters = vec![ClusterConfig {
            id: "main".into(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            username: None,
            password: None,
            database: None,
            pool_size: 4,
        }];
        config
    }

    #[tokio::test]
    async fn test_local_only_service() {
        let service = CacheService::initialize_with_connector(
            CacheConfig::default(),
            Arc::new(MemoryConnector::new()),
        )
        .await
        .unwrap();

        assert!(service.is_ready());
        assert!(service.cluster_manager().is_none());

        let outcome = service.set("course:42", &"Algebra".to_string(), None).await.unwrap();
        assert_eq!(outcome.local, TierWrite::Applied);
        assert_eq!(outcome.distributed, TierWrite::Disabled);
        assert_eq!(
            service.get::<String>("course:42").await.as_deref(),
            Some("Algebra")
        );
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut config = CacheConfig::default();
        config.local.max_keys = 0;
        let result = block_on(CacheService::initialize_with_connector(
            config,
            Arc::new(MemoryConnector::new()),
        ));
        assert!(matches!(result, Err(e) if e.is_fatal()));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_falls_back_to_local() {
        let connector = MemoryConnector::new();
        let service = CacheService::initialize_with_connector(
            distributed_config(&["10.0.0.1:6379"]),
            Arc::new(connector),
        )
        .await
        .unwrap();

        assert!(service.cache().distributed_cluster().is_none());
        service.set("k", &"v".to_string(), None).await.unwrap();
        assert_eq!(service.get::<String>("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_required_cluster_unreachable_fails() {
        let mut config = distributed_config(&["10.0.0.1:6379"]);
        config.distributed.required = true;
        let result =
            CacheService::initialize_with_connector(config, Arc::new(MemoryConnector::new())).await;
        assert!(matches!(result, Err(CacheError::DistributedUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_distributed_service_writes_both_tiers() {
        let connector = MemoryConnector::new();
        connector.add_node("10.0.0.1:6379", NodeRole::Primary);
        let service = CacheService::initialize_with_connector(
            distributed_config(&["10.0.0.1:6379"]),
            Arc::new(connector.clone()),
        )
        .await
        .unwrap();

        assert_eq!(service.cache().distributed_cluster(), Some("main"));
        let outcome = service.set("student:7", &"Ada".to_string(), None).await.unwrap();
        assert!(outcome.distributed.is_applied());
        assert!(connector.contains("student:7"));

        let stats = service.statistics();
        assert!(stats.distributed.enabled);
        assert!(stats.distributed.clusters.contains_key("main"));
    }

    #[tokio::test]
    async fn test_handle_event_skips_invalid_patterns() {
        let service = CacheService::initialize_with_connector(
            CacheConfig::default(),
            Arc::new(MemoryConnector::new()),
        )
        .await
        .unwrap();
        for key in ["enrollment:1:list", "enrollment:2:list", "course:1"] {
            service.set(key, &"x".to_string(), None).await.unwrap();
        }

        let mut rules: HashMap<String, Vec<String>> = HashMap::new();
        rules.insert(
            "EnrollmentChanged".into(),
            vec!["enrollment:*".into(), String::new()],
        );

        let reports = service.handle_event("EnrollmentChanged", &rules).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].local_removed, 2);
        assert!(service.get::<String>("course:1").await.is_some());

        assert!(service.handle_event("Unrelated", &rules).await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_clusters() {
        let connector = MemoryConnector::new();
        connector.add_node("10.0.0.1:6379", NodeRole::Primary);
        let service = CacheService::initialize_with_connector(
            distributed_config(&["10.0.0.1:6379"]),
            Arc::new(connector),
        )
        .await
        .unwrap();

        service.shutdown();
        assert!(!service.is_ready());
        let manager = service.cluster_manager().unwrap();
        assert_eq!(manager.state("main"), Some(crate::cluster::ClusterState::Closed));

        // Local tier keeps serving.
        service.cache().local().set("k", Arc::new(b"v".to_vec()), None).unwrap();
        assert!(service.cache().local().get("k").is_some());
    }
}

//! Cluster connection manager.
//!
//! Owns every connection to every named distributed-cache cluster. Callers
//! go through [`ClusterManager::execute`]; topology and state are mutated only
//! by the manager itself (call outcomes, the health monitor, the reconnect
//! loop) and published as snapshots plus a [`TopologyEvent`] stream.
//!
//! Per-cluster state machine:
//!
//! - `initialize_cluster`: `disconnected → connecting → ready|degraded`
//! - node or protocol failure while `ready`: `→ degraded`
//! - health probe with every node healthy: `degraded → ready`
//! - `max_retries` consecutive failed calls or empty probes: `→ reconnecting`
//! - reconnect budget exhausted: `→ unreachable` (terminal until [`ClusterManager::reconnect`])

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};

use super::client::{CacheCommand, ClientError, CommandReply, NodeClient, NodeConnector};
use super::topology::{
    ClusterNode, ClusterState, ClusterTopology, NodeHealth, NodeRole, TopologyAnalysis,
    TopologyEvent,
};
use crate::config::{ClusterConfig, DistributedConfig};
use crate::error::{CacheError, Result};
use crate::metrics::{self, OperationMetrics, OperationMetricsSnapshot, Tier};

/// Connection and recovery settings for one cluster.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<u32>,
    /// Connections per node.
    pub pool_size: usize,
    /// Bound on connecting to, or probing, a single node.
    pub connect_timeout: Duration,
    /// Bound on a single command; the call is abandoned, not cancelled.
    pub command_timeout: Duration,
    /// Probe rounds at initialization before giving up.
    pub max_connect_attempts: u32,
    /// Consecutive failed calls tolerated before reconnecting.
    pub max_retries: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Consecutive failures after which a node is no longer routed to.
    pub node_failure_threshold: u32,
    /// Healthy primaries below this raise a topology alert.
    pub min_primaries: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            database: None,
            pool_size: 10,
            connect_timeout: Duration::from_millis(5000),
            command_timeout: Duration::from_millis(2000),
            max_connect_attempts: 3,
            max_retries: 3,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            node_failure_threshold: 3,
            min_primaries: 3,
        }
    }
}

impl ClusterOptions {
    pub fn from_config(distributed: &DistributedConfig, cluster: &ClusterConfig) -> Self {
        Self {
            username: cluster.username.clone(),
            password: cluster.password.clone(),
            database: cluster.database,
            pool_size: cluster.pool_size,
            connect_timeout: Duration::from_millis(distributed.connect_timeout_ms),
            command_timeout: Duration::from_millis(distributed.command_timeout_ms),
            max_connect_attempts: distributed.max_connect_attempts,
            max_retries: distributed.max_retries,
            reconnect_base_delay: Duration::from_millis(distributed.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(distributed.reconnect_max_delay_ms),
            max_reconnect_attempts: distributed.max_reconnect_attempts,
            node_failure_threshold: distributed.node_failure_threshold,
            min_primaries: distributed.min_primaries,
        }
    }
}

/// `base × 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Read-only view of one cluster for statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub cluster_id: String,
    pub state: ClusterState,
    pub nodes: Vec<ClusterNode>,
    pub analysis: TopologyAnalysis,
    pub metrics: OperationMetricsSnapshot,
    pub consecutive_failures: u32,
}

struct ClusterHandle {
    id: String,
    options: ClusterOptions,
    /// Readers load snapshots lock-free; writers clone, mutate and swap
    /// under `write_lock`.
    topology: ArcSwap<ClusterTopology>,
    write_lock: Mutex<()>,
    clients: DashMap<String, Arc<dyn NodeClient>>,
    metrics: OperationMetrics,
    consecutive_failures: AtomicU32,
    reconnecting: AtomicBool,
    last_alert: Mutex<Vec<String>>,
}

impl ClusterHandle {
    fn new(id: &str, addresses: &[String], options: ClusterOptions) -> Self {
        Self {
            id: id.to_string(),
            options,
            topology: ArcSwap::from_pointee(ClusterTopology::new(id, addresses)),
            write_lock: Mutex::new(()),
            clients: DashMap::new(),
            metrics: OperationMetrics::new(),
            consecutive_failures: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            last_alert: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> ClusterState {
        self.topology.load().state
    }

    fn update<R>(&self, f: impl FnOnce(&mut ClusterTopology) -> R) -> R {
        let _guard = self.write_lock.lock();
        let mut next = ClusterTopology::clone(&self.topology.load());
        let result = f(&mut next);
        self.topology.store(Arc::new(next));
        result
    }

    /// Pick a node for a call. Writes go to primaries only; reads prefer
    /// healthy primaries, then healthy replicas, then failing nodes.
    /// Unreachable nodes are never chosen.
    fn route(&self, read: bool) -> Option<(String, Arc<dyn NodeClient>)> {
        let topology = self.topology.load();
        topology
            .nodes
            .iter()
            .filter_map(|node| {
                let rank = match (node.health, node.role) {
                    (NodeHealth::Unreachable, _) => return None,
                    (_, NodeRole::Replica) if !read => return None,
                    (NodeHealth::Healthy, NodeRole::Primary) => 0,
                    (NodeHealth::Healthy, NodeRole::Replica) => 1,
                    (NodeHealth::Failing, NodeRole::Primary) => 2,
                    (NodeHealth::Failing, NodeRole::Replica) => 3,
                };
                let client = self.clients.get(&node.address)?;
                Some((rank, node.address.clone(), Arc::clone(client.value())))
            })
            .min_by_key(|(rank, _, _)| *rank)
            .map(|(_, address, client)| (address, client))
    }

    fn snapshot(&self) -> ClusterSnapshot {
        let topology = self.topology.load_full();
        ClusterSnapshot {
            cluster_id: self.id.clone(),
            state: topology.state,
            analysis: topology.analyze(),
            nodes: topology.nodes.clone(),
            metrics: self.metrics.snapshot(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

struct ProbeOutcome {
    client: Arc<dyn NodeClient>,
    role: NodeRole,
    latency: Duration,
}

struct ManagerInner {
    connector: Arc<dyn NodeConnector>,
    clusters: DashMap<String, Arc<ClusterHandle>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TopologyEvent>>>,
}

/// Cloneable handle to the manager; clones share all clusters.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ManagerInner>,
}

impl ClusterManager {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                clusters: DashMap::new(),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Receive every topology event emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TopologyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.clusters.iter().map(|c| c.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Connect to a cluster and probe every node.
    ///
    /// Probing is retried with exponential backoff up to
    /// `max_connect_attempts` rounds; fails if no node ever answers.
    pub async fn initialize_cluster(
        &self,
        cluster_id: &str,
        addresses: &[String],
        options: ClusterOptions,
    ) -> Result<ClusterTopology> {
        if cluster_id.trim().is_empty() {
            return Err(CacheError::Configuration("cluster id must not be empty".into()));
        }
        if addresses.is_empty() {
            return Err(CacheError::Configuration(format!(
                "cluster '{cluster_id}' has no node addresses"
            )));
        }
        if self.inner.clusters.contains_key(cluster_id) {
            return Err(CacheError::Configuration(format!(
                "cluster '{cluster_id}' is already initialized"
            )));
        }

        let cluster = Arc::new(ClusterHandle::new(cluster_id, addresses, options));
        self.transition(&cluster, ClusterState::Connecting, |_| true);

        let attempts = cluster.options.max_connect_attempts.max(1);
        let mut healthy = 0;
        for attempt in 0..attempts {
            healthy = self.probe_cluster(&cluster).await;
            if healthy > 0 {
                break;
            }
            if attempt + 1 < attempts {
                let delay = backoff_delay(
                    cluster.options.reconnect_base_delay,
                    cluster.options.reconnect_max_delay,
                    attempt,
                );
                tracing::warn!(
                    cluster_id = %cluster_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "no cluster node reachable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        if healthy == 0 {
            self.transition(&cluster, ClusterState::Disconnected, |_| true);
            tracing::error!(
                cluster_id = %cluster_id,
                attempts,
                "cluster unreachable at initialization"
            );
            return Err(CacheError::DistributedUnavailable {
                cluster_id: cluster_id.to_string(),
                reason: format!("none of {} node(s) reachable", addresses.len()),
            });
        }

        match self.inner.clusters.entry(cluster_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CacheError::Configuration(format!(
                    "cluster '{cluster_id}' is already initialized"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&cluster));
            }
        }

        let derived = cluster.topology.load().derived_state();
        self.transition(&cluster, derived, |s| s == ClusterState::Connecting);
        self.evaluate_alerts(&cluster);

        let topology = cluster.topology.load_full();
        tracing::info!(
            cluster_id = %cluster_id,
            healthy,
            total = topology.nodes.len(),
            state = %topology.state,
            "cluster initialized"
        );
        Ok(ClusterTopology::clone(&topology))
    }

    /// Run one command against a cluster.
    ///
    /// Reads are retried once on a node failure. Application errors come back
    /// as [`CacheError::Command`] and leave node health untouched.
    pub async fn execute(&self, cluster_id: &str, command: CacheCommand) -> Result<CommandReply> {
        let cluster = self.cluster(cluster_id)?;
        match cluster.state() {
            ClusterState::Ready | ClusterState::Degraded => {}
            ClusterState::Closed => return Err(CacheError::Closed(cluster_id.to_string())),
            other => {
                return Err(CacheError::DistributedUnavailable {
                    cluster_id: cluster_id.to_string(),
                    reason: format!("cluster is {other}"),
                });
            }
        }

        let command = Arc::new(command);
        let operation = command.name();
        let attempts = if command.is_read() { 2 } else { 1 };
        let mut last_error = None;

        for attempt in 0..attempts {
            let Some((address, client)) = cluster.route(command.is_read()) else {
                break;
            };

            let started = Instant::now();
            let call = {
                let command = Arc::clone(&command);
                tokio::spawn(async move { client.execute(&command).await })
            };
            let outcome = tokio::time::timeout(cluster.options.command_timeout, call).await;
            let elapsed = started.elapsed();
            cluster.metrics.record_latency(elapsed);
            metrics::record_operation_duration(Tier::Distributed, elapsed);

            let error = match outcome {
                Ok(Ok(Ok(reply))) => {
                    record_reply(&cluster.metrics, &command, &reply);
                    self.on_call_success(&cluster, &address, elapsed);
                    return Ok(reply);
                }
                Ok(Ok(Err(e))) if !e.affects_health() => {
                    cluster.metrics.record_error();
                    metrics::record_cache_error(Tier::Distributed, operation);
                    tracing::debug!(
                        cluster_id = %cluster_id,
                        address = %address,
                        operation,
                        error = %e,
                        "command rejected by node"
                    );
                    return Err(CacheError::Command {
                        cluster_id: cluster_id.to_string(),
                        operation,
                        message: e.message,
                    });
                }
                Ok(Ok(Err(e))) => e,
                Ok(Err(join_error)) => {
                    ClientError::protocol(format!("node call aborted: {join_error}"))
                }
                Err(_) => {
                    cluster.metrics.record_error();
                    metrics::record_cache_error(Tier::Distributed, operation);
                    let timeout_ms = cluster.options.command_timeout.as_millis() as u64;
                    self.on_call_failure(
                        &cluster,
                        &address,
                        &ClientError::network(format!("{operation} timed out after {timeout_ms}ms")),
                    );
                    return Err(CacheError::OperationTimeout {
                        cluster_id: cluster_id.to_string(),
                        operation,
                        timeout_ms,
                    });
                }
            };

            cluster.metrics.record_error();
            metrics::record_cache_error(Tier::Distributed, operation);
            tracing::warn!(
                cluster_id = %cluster_id,
                address = %address,
                operation,
                attempt = attempt + 1,
                error = %error,
                "distributed call failed"
            );
            self.on_call_failure(&cluster, &address, &error);
            last_error = Some(error);
        }

        Err(CacheError::DistributedUnavailable {
            cluster_id: cluster_id.to_string(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("no routable node for {operation}")),
        })
    }

    /// Whether batched writes go out as one pipelined request.
    pub fn supports_pipeline(&self, cluster_id: &str) -> bool {
        self.cluster(cluster_id)
            .ok()
            .and_then(|cluster| cluster.route(false))
            .is_some_and(|(_, client)| client.supports_pipeline())
    }

    /// Probe every cluster on a fixed period until `true` is sent on (or the
    /// caller drops) the returned sender.
    pub fn start_health_monitoring(&self, every: Duration) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; clusters were just probed.
            ticker.tick().await;

            tracing::info!(interval_ms = every.as_millis() as u64, "cluster health monitoring started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.check_health().await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("cluster health monitoring stopped");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    /// One health pass over every serving cluster.
    pub async fn check_health(&self) {
        let clusters: Vec<Arc<ClusterHandle>> = self
            .inner
            .clusters
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        join_all(clusters.iter().map(|cluster| self.check_cluster(cluster))).await;
    }

    async fn check_cluster(&self, cluster: &Arc<ClusterHandle>) {
        if !cluster.state().is_serving() {
            return;
        }

        let healthy = self.probe_cluster(cluster).await;
        if healthy == 0 {
            self.transition(cluster, ClusterState::Degraded, |s| s == ClusterState::Ready);
            let failures = cluster.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= cluster.options.max_retries {
                self.start_reconnect(Arc::clone(cluster));
            }
        } else {
            cluster.consecutive_failures.store(0, Ordering::Release);
            let derived = cluster.topology.load().derived_state();
            self.transition(cluster, derived, |s| s.is_serving());
        }

        self.evaluate_alerts(cluster);
    }

    /// Emit a topology alert when the set of alert reasons changes.
    fn evaluate_alerts(&self, cluster: &ClusterHandle) {
        let analysis = cluster.topology.load().analyze();
        let reasons = analysis.alerts(cluster.options.min_primaries);

        let mut last = cluster.last_alert.lock();
        if *last == reasons {
            return;
        }
        *last = reasons.clone();
        drop(last);

        if reasons.is_empty() {
            tracing::info!(cluster_id = %cluster.id, "topology alert cleared");
            return;
        }
        tracing::warn!(
            cluster_id = %cluster.id,
            healthy = analysis.healthy,
            primaries = analysis.primaries,
            failing = analysis.failing,
            reasons = ?reasons,
            "cluster topology alert"
        );
        self.emit(TopologyEvent::TopologyAlert {
            cluster_id: cluster.id.clone(),
            analysis,
            reasons,
        });
    }

    /// Fail with [`CacheError::ClusterTopology`] when too few primaries are
    /// healthy to serve safely.
    pub fn verify_topology(&self, cluster_id: &str) -> Result<TopologyAnalysis> {
        let cluster = self.cluster(cluster_id)?;
        let analysis = cluster.topology.load().analyze();
        if analysis.primaries < cluster.options.min_primaries {
            return Err(CacheError::ClusterTopology {
                cluster_id: cluster_id.to_string(),
                reason: format!(
                    "{} healthy primaries, minimum is {}",
                    analysis.primaries, cluster.options.min_primaries
                ),
            });
        }
        Ok(analysis)
    }

    /// Re-arm a cluster, typically one left `unreachable`.
    pub fn reconnect(&self, cluster_id: &str) -> Result<()> {
        let cluster = self.cluster(cluster_id)?;
        if cluster.state() == ClusterState::Closed {
            return Err(CacheError::Closed(cluster_id.to_string()));
        }
        cluster.consecutive_failures.store(0, Ordering::Release);
        self.start_reconnect(cluster);
        Ok(())
    }

    fn start_reconnect(&self, cluster: Arc<ClusterHandle>) {
        if cluster
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !self.transition(&cluster, ClusterState::Reconnecting, |s| s != ClusterState::Closed) {
            cluster.reconnecting.store(false, Ordering::Release);
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.reconnect_loop(&cluster).await;
            cluster.reconnecting.store(false, Ordering::Release);
        });
    }

    async fn reconnect_loop(&self, cluster: &ClusterHandle) {
        let options = &cluster.options;

        for attempt in 0..options.max_reconnect_attempts {
            let delay = backoff_delay(
                options.reconnect_base_delay,
                options.reconnect_max_delay,
                attempt,
            );
            tracing::info!(
                cluster_id = %cluster.id,
                attempt = attempt + 1,
                max_attempts = options.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to cluster"
            );
            tokio::time::sleep(delay).await;

            if cluster.state() != ClusterState::Reconnecting {
                return;
            }

            let healthy = self.probe_cluster(cluster).await;
            if healthy > 0 {
                cluster.consecutive_failures.store(0, Ordering::Release);
                let derived = cluster.topology.load().derived_state();
                self.transition(cluster, derived, |s| s == ClusterState::Reconnecting);
                tracing::info!(cluster_id = %cluster.id, healthy, "cluster reconnected");
                return;
            }
        }

        if self.transition(cluster, ClusterState::Unreachable, |s| {
            s == ClusterState::Reconnecting
        }) {
            // Re-armable as soon as the unreachable state is observable.
            cluster.reconnecting.store(false, Ordering::Release);
            tracing::error!(
                cluster_id = %cluster.id,
                attempts = options.max_reconnect_attempts,
                "cluster unreachable, reconnect attempts exhausted"
            );
            self.emit(TopologyEvent::ClusterUnreachable {
                cluster_id: cluster.id.clone(),
                attempts: options.max_reconnect_attempts,
            });
        }
    }

    /// Add a node to a running cluster and probe it.
    ///
    /// Returns `false` if the node was already known.
    pub async fn add_node(&self, cluster_id: &str, address: &str) -> Result<bool> {
        let cluster = self.cluster(cluster_id)?;
        if address.trim().is_empty() {
            return Err(CacheError::Configuration("node address must not be empty".into()));
        }

        let added = cluster.update(|t| {
            if t.node(address).is_some() {
                return false;
            }
            t.nodes.push(ClusterNode::new(address));
            true
        });
        if !added {
            return Ok(false);
        }

        tracing::info!(cluster_id = %cluster_id, address = %address, "node joined");
        self.emit(TopologyEvent::NodeJoined {
            cluster_id: cluster_id.to_string(),
            address: address.to_string(),
        });

        self.probe_nodes(&cluster, vec![address.to_string()]).await;
        let derived = cluster.topology.load().derived_state();
        self.transition(&cluster, derived, |s| s.is_serving());
        Ok(true)
    }

    /// Drop a node and its connections. Returns `false` if it was unknown.
    pub fn remove_node(&self, cluster_id: &str, address: &str) -> Result<bool> {
        let cluster = self.cluster(cluster_id)?;
        let removed = cluster.update(|t| {
            let before = t.nodes.len();
            t.nodes.retain(|n| n.address != address);
            t.nodes.len() != before
        });
        if !removed {
            return Ok(false);
        }
        cluster.clients.remove(address);

        tracing::info!(cluster_id = %cluster_id, address = %address, "node left");
        self.emit(TopologyEvent::NodeLeft {
            cluster_id: cluster_id.to_string(),
            address: address.to_string(),
        });

        let derived = cluster.topology.load().derived_state();
        self.transition(&cluster, derived, |s| s.is_serving());
        Ok(true)
    }

    pub fn topology(&self, cluster_id: &str) -> Option<ClusterTopology> {
        self.inner
            .clusters
            .get(cluster_id)
            .map(|c| ClusterTopology::clone(&c.topology.load()))
    }

    pub fn state(&self, cluster_id: &str) -> Option<ClusterState> {
        self.inner.clusters.get(cluster_id).map(|c| c.state())
    }

    pub fn cluster_statistics(&self, cluster_id: &str) -> Option<ClusterSnapshot> {
        self.inner.clusters.get(cluster_id).map(|c| c.snapshot())
    }

    /// Topology and metrics of every cluster. Never mutates state.
    pub fn get_cluster_statistics(&self) -> BTreeMap<String, ClusterSnapshot> {
        self.inner
            .clusters
            .iter()
            .map(|c| (c.key().clone(), c.snapshot()))
            .collect()
    }

    /// Close every cluster and release all node connections.
    pub fn shutdown(&self) {
        for cluster in self.inner.clusters.iter() {
            self.transition(cluster.value(), ClusterState::Closed, |_| true);
            cluster.clients.clear();
        }
        tracing::info!("cluster manager shut down");
    }

    fn cluster(&self, cluster_id: &str) -> Result<Arc<ClusterHandle>> {
        self.inner
            .clusters
            .get(cluster_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CacheError::ClusterNotFound(cluster_id.to_string()))
    }

    fn emit(&self, event: TopologyEvent) {
        tracing::debug!(cluster_id = %event.cluster_id(), event = ?event, "topology event");
        self.inner
            .subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Move a cluster to `to` if `allowed(current)`. Returns whether it moved.
    fn transition(
        &self,
        cluster: &ClusterHandle,
        to: ClusterState,
        allowed: impl Fn(ClusterState) -> bool,
    ) -> bool {
        let from = cluster.update(|t| {
            let from = t.state;
            if from == to || !allowed(from) {
                return None;
            }
            t.state = to;
            Some(from)
        });
        let Some(from) = from else {
            return false;
        };

        match to {
            ClusterState::Unreachable => {
                tracing::error!(cluster_id = %cluster.id, from = %from, to = %to, "cluster state changed")
            }
            ClusterState::Degraded | ClusterState::Reconnecting => {
                tracing::warn!(cluster_id = %cluster.id, from = %from, to = %to, "cluster state changed")
            }
            _ => tracing::info!(cluster_id = %cluster.id, from = %from, to = %to, "cluster state changed"),
        }
        metrics::set_cluster_state(&cluster.id, to);
        self.emit(TopologyEvent::StateChanged {
            cluster_id: cluster.id.clone(),
            from,
            to,
        });
        true
    }

    fn on_call_success(&self, cluster: &ClusterHandle, address: &str, elapsed: Duration) {
        cluster.consecutive_failures.store(0, Ordering::Release);

        let node_healthy = cluster
            .topology
            .load()
            .node(address)
            .is_some_and(ClusterNode::is_healthy);
        if node_healthy {
            return;
        }

        let recovered = cluster.update(|t| match t.node_mut(address) {
            Some(node) if !node.is_healthy() => {
                node.mark_healthy();
                true
            }
            _ => false,
        });
        if recovered {
            tracing::info!(cluster_id = %cluster.id, address = %address, "node recovered");
            self.emit(TopologyEvent::NodeRecovered {
                cluster_id: cluster.id.clone(),
                address: address.to_string(),
                latency_ms: elapsed.as_secs_f64() * 1000.0,
            });
        }

        if cluster.topology.load().derived_state() == ClusterState::Ready {
            self.transition(cluster, ClusterState::Ready, |s| s == ClusterState::Degraded);
        }
    }

    fn on_call_failure(&self, cluster: &Arc<ClusterHandle>, address: &str, error: &ClientError) {
        let threshold = cluster.options.node_failure_threshold;
        let change = cluster.update(|t| {
            t.node_mut(address).map(|node| {
                let before = node.health;
                node.record_failure(threshold, false);
                (before, node.health)
            })
        });
        if let Some((_, after)) = change.filter(|(before, after)| before != after) {
            self.emit(TopologyEvent::NodeFailed {
                cluster_id: cluster.id.clone(),
                address: address.to_string(),
                health: after,
                error: error.to_string(),
            });
        }

        self.transition(cluster, ClusterState::Degraded, |s| s == ClusterState::Ready);

        let failures = cluster.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= cluster.options.max_retries {
            self.start_reconnect(Arc::clone(cluster));
        }
    }

    /// Probe every node of a cluster. Returns the number of healthy nodes.
    async fn probe_cluster(&self, cluster: &ClusterHandle) -> usize {
        let addresses = cluster
            .topology
            .load()
            .nodes
            .iter()
            .map(|n| n.address.clone())
            .collect();
        self.probe_nodes(cluster, addresses).await;
        cluster.topology.load().healthy_count()
    }

    async fn probe_nodes(&self, cluster: &ClusterHandle, addresses: Vec<String>) {
        let probes = addresses.into_iter().map(|address| async move {
            let outcome = self.probe_node(cluster, &address).await;
            (address, outcome)
        });
        let results = join_all(probes).await;

        let threshold = cluster.options.node_failure_threshold;
        for (address, outcome) in results {
            match outcome {
                Ok(probe) => {
                    let recovered = cluster.update(|t| {
                        t.node_mut(&address).map(|node| {
                            let was_known = node.last_probe_at.is_some();
                            let was_healthy = node.is_healthy();
                            node.role = probe.role;
                            node.record_probe_success(probe.latency);
                            (was_known && !was_healthy, node.rolling_latency_ms)
                        })
                    });
                    // Node removed while being probed.
                    let Some((recovered, latency_ms)) = recovered else {
                        continue;
                    };
                    cluster.clients.insert(address.clone(), probe.client);
                    if recovered {
                        tracing::info!(cluster_id = %cluster.id, address = %address, "node recovered");
                        self.emit(TopologyEvent::NodeRecovered {
                            cluster_id: cluster.id.clone(),
                            address,
                            latency_ms,
                        });
                    }
                }
                Err(error) => {
                    let change = cluster.update(|t| {
                        t.node_mut(&address).map(|node| {
                            let first_contact = node.last_probe_at.is_none();
                            let before = node.health;
                            node.record_failure(threshold, true);
                            (first_contact, before, node.health)
                        })
                    });
                    let Some((first_contact, before, after)) = change else {
                        continue;
                    };
                    tracing::warn!(
                        cluster_id = %cluster.id,
                        address = %address,
                        health = ?after,
                        error = %error,
                        "node probe failed"
                    );
                    if !first_contact && before != after {
                        self.emit(TopologyEvent::NodeFailed {
                            cluster_id: cluster.id.clone(),
                            address,
                            health: after,
                            error: error.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Ping (connecting first if needed) and fetch the role of one node,
    /// bounded by `connect_timeout`.
    async fn probe_node(
        &self,
        cluster: &ClusterHandle,
        address: &str,
    ) -> std::result::Result<ProbeOutcome, ClientError> {
        let started = Instant::now();
        let existing = cluster.clients.get(address).map(|c| Arc::clone(c.value()));
        let probe = async {
            let client = match existing {
                Some(client) => {
                    client.ping().await?;
                    client
                }
                None => self.inner.connector.connect(address, &cluster.options).await?,
            };
            let role = client.role().await?;
            Ok::<_, ClientError>((client, role))
        };

        let timeout = cluster.options.connect_timeout;
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok((client, role))) => Ok(ProbeOutcome {
                client,
                role,
                latency: started.elapsed(),
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ClientError::network(format!(
                "probe of {address} timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

fn record_reply(metrics: &OperationMetrics, command: &CacheCommand, reply: &CommandReply) {
    match (command, reply) {
        (CacheCommand::Get { .. }, CommandReply::Value(Some(_))) => metrics.record_hit(),
        (CacheCommand::Get { .. }, CommandReply::Value(None)) => metrics.record_miss(),
        (CacheCommand::MGet { .. }, CommandReply::Values(values)) => {
            for value in values {
                if value.is_some() {
                    metrics.record_hit();
                } else {
                    metrics.record_miss();
                }
            }
        }
        (CacheCommand::Set { .. } | CacheCommand::MSet { .. }, _) => metrics.record_set(),
        (CacheCommand::Delete { .. } | CacheCommand::DeletePattern { .. }, _) => {
            metrics.record_delete()
        }
        _ => {}
    }
}

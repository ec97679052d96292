//! In-process distributed tier.
//!
//! All nodes registered on one [`MemoryConnector`] share a single dataset, the
//! way a primary and its replicas serve the same keys. Nodes can be made to
//! fail, slow down or refuse connections, and count the commands they serve,
//! which makes the connector useful for exercising the cluster manager and
//! the coordinator without a Redis server.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::client::{
    CacheCommand, ClientError, CommandReply, ErrorClass, NodeClient, NodeConnector, StoredValue,
};
use super::manager::ClusterOptions;
use super::topology::NodeRole;

type Dataset = DashMap<String, (Arc<Vec<u8>>, Instant)>;

/// Connector for in-process nodes sharing one dataset.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    data: Arc<Dataset>,
    nodes: Arc<DashMap<String, Arc<MemoryNode>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Unregistered addresses refuse connections.
    pub fn add_node(&self, address: &str, role: NodeRole) -> Arc<MemoryNode> {
        let node = Arc::new(MemoryNode {
            address: address.to_string(),
            role: Mutex::new(role),
            data: Arc::clone(&self.data),
            failure: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            pipeline: AtomicBool::new(true),
            commands: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            published: Mutex::new(Vec::new()),
        });
        self.nodes.insert(address.to_string(), Arc::clone(&node));
        node
    }

    pub fn node(&self, address: &str) -> Option<Arc<MemoryNode>> {
        self.nodes.get(address).map(|n| Arc::clone(n.value()))
    }

    /// Make every registered node fail with `class`, or recover with `None`.
    pub fn set_failure(&self, class: Option<ErrorClass>) {
        for node in self.nodes.iter() {
            node.set_failure(class);
        }
    }

    /// Commands served by all nodes (probes excluded).
    pub fn commands(&self) -> u64 {
        self.nodes.iter().map(|n| n.commands()).sum()
    }

    /// GET/MGET commands served by all nodes.
    pub fn reads(&self) -> u64 {
        self.nodes.iter().map(|n| n.reads()).sum()
    }

    /// Whether the shared dataset holds a live value for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.data
            .get(key)
            .is_some_and(|entry| entry.1 > Instant::now())
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| e.value().1 > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NodeConnector for MemoryConnector {
    async fn connect(
        &self,
        address: &str,
        _options: &ClusterOptions,
    ) -> Result<Arc<dyn NodeClient>, ClientError> {
        let node = self
            .node(address)
            .ok_or_else(|| ClientError::network(format!("connection refused: {address}")))?;
        node.check().await?;
        Ok(node)
    }
}

/// One in-process node.
pub struct MemoryNode {
    address: String,
    role: Mutex<NodeRole>,
    data: Arc<Dataset>,
    failure: Mutex<Option<ErrorClass>>,
    latency: Mutex<Duration>,
    pipeline: AtomicBool,
    commands: AtomicU64,
    reads: AtomicU64,
    published: Mutex<Vec<(String, String)>>,
}

impl MemoryNode {
    pub fn set_failure(&self, class: Option<ErrorClass>) {
        *self.failure.lock() = class;
    }

    /// Delay applied before every reply, probes included.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_role(&self, role: NodeRole) {
        *self.role.lock() = role;
    }

    pub fn set_pipeline_support(&self, enabled: bool) {
        self.pipeline.store(enabled, Ordering::Relaxed);
    }

    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Messages received through [`CacheCommand::Publish`], oldest first.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    async fn check(&self) -> Result<(), ClientError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failure = *self.failure.lock();
        match failure {
            None => Ok(()),
            Some(class) => Err(ClientError {
                class,
                message: format!("injected {class} failure on {}", self.address),
            }),
        }
    }

    fn live(&self, key: &str, now: Instant) -> Option<StoredValue> {
        self.data.get(key).filter(|entry| entry.1 > now).map(|entry| {
            StoredValue::new(
                Arc::clone(&entry.0),
                Some(entry.1.saturating_duration_since(now)),
            )
        })
    }
}

#[async_trait]
impl NodeClient for MemoryNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.check().await
    }

    async fn role(&self) -> Result<NodeRole, ClientError> {
        self.check().await?;
        Ok(*self.role.lock())
    }

    async fn execute(&self, command: &CacheCommand) -> Result<CommandReply, ClientError> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if command.is_read() {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        self.check().await?;

        let now = Instant::now();
        let reply = match command {
            CacheCommand::Get { key } => CommandReply::Value(self.live(key, now)),
            CacheCommand::MGet { keys } => {
                CommandReply::Values(keys.iter().map(|k| self.live(k, now)).collect())
            }
            CacheCommand::Set { key, value, ttl } => {
                self.data
                    .insert(key.clone(), (Arc::clone(value), now + *ttl));
                CommandReply::Done
            }
            CacheCommand::MSet { entries, ttl } => {
                for (key, value) in entries {
                    self.data
                        .insert(key.clone(), (Arc::clone(value), now + *ttl));
                }
                CommandReply::Done
            }
            CacheCommand::Delete { keys } => {
                let removed = keys
                    .iter()
                    .filter(|k| self.data.remove(k.as_str()).is_some())
                    .count();
                CommandReply::Count(removed as u64)
            }
            CacheCommand::DeletePattern { pattern } => {
                let mut removed = 0u64;
                self.data.retain(|key, _| {
                    if pattern.matches(key) {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                });
                CommandReply::Count(removed)
            }
            CacheCommand::Publish { channel, payload } => {
                self.published
                    .lock()
                    .push((channel.clone(), payload.clone()));
                CommandReply::Count(0)
            }
        };
        Ok(reply)
    }

    fn supports_pipeline(&self) -> bool {
        self.pipeline.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::pattern::GlobPattern;

    fn value(s: &str) -> Arc<Vec<u8>> {
        Arc::new(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_nodes_share_dataset() {
        let connector = MemoryConnector::new();
        connector.add_node("n1", NodeRole::Primary);
        connector.add_node("n2", NodeRole::Replica);
        let options = ClusterOptions::default();

        let primary = connector.connect("n1", &options).await.unwrap();
        let replica = connector.connect("n2", &options).await.unwrap();

        primary
            .execute(&CacheCommand::Set {
                key: "k".into(),
                value: value("v"),
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let stored = replica
            .execute(&CacheCommand::Get { key: "k".into() })
            .await
            .unwrap()
            .into_value()
            .unwrap()
            .unwrap();
        assert_eq!(stored.bytes, value("v"));
        let remaining = stored.remaining_ttl.unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
        assert_eq!(replica.role().await.unwrap(), NodeRole::Replica);
        assert_eq!(connector.reads(), 1);
        assert_eq!(connector.commands(), 2);
    }

    #[tokio::test]
    async fn test_unknown_address_refuses_connection() {
        let connector = MemoryConnector::new();
        let err = connector
            .connect("nowhere:6379", &ClusterOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.class, ErrorClass::Network);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let connector = MemoryConnector::new();
        let node = connector.add_node("n1", NodeRole::Primary);
        node.set_failure(Some(ErrorClass::Application));

        let err = node
            .execute(&CacheCommand::Get { key: "k".into() })
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Application);

        node.set_failure(None);
        assert!(node.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_pattern_delete_and_expiry() {
        let connector = MemoryConnector::new();
        let node = connector.add_node("n1", NodeRole::Primary);
        for key in ["user:1:profile", "user:1:settings", "user:2:profile"] {
            node.execute(&CacheCommand::Set {
                key: key.into(),
                value: value("x"),
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();
        }
        node.execute(&CacheCommand::Set {
            key: "short".into(),
            value: value("x"),
            ttl: Duration::from_millis(10),
        })
        .await
        .unwrap();

        let reply = node
            .execute(&CacheCommand::DeletePattern {
                pattern: GlobPattern::new("user:1:*").unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(reply, CommandReply::Count(2));
        assert!(connector.contains("user:2:profile"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!connector.contains("short"));
        assert_eq!(connector.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pattern_delete_counts_only_its_removals_under_concurrent_writes() {
        let connector = MemoryConnector::new();
        let node = connector.add_node("n1", NodeRole::Primary);
        for i in 0..200 {
            node.execute(&CacheCommand::Set {
                key: format!("course:{i}"),
                value: value("x"),
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();
        }

        let writer = {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                for i in 0..2_000 {
                    node.execute(&CacheCommand::Set {
                        key: format!("room:{i}"),
                        value: value("x"),
                        ttl: Duration::from_secs(60),
                    })
                    .await
                    .unwrap();
                }
            })
        };

        let reply = node
            .execute(&CacheCommand::DeletePattern {
                pattern: GlobPattern::new("course:*").unwrap(),
            })
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(reply, CommandReply::Count(200));
        assert_eq!(connector.len(), 2_000);
    }

    #[tokio::test]
    async fn test_reads_report_remaining_ttl() {
        let connector = MemoryConnector::new();
        let node = connector.add_node("n1", NodeRole::Primary);
        node.execute(&CacheCommand::Set {
            key: "k".into(),
            value: value("v"),
            ttl: Duration::from_millis(500),
        })
        .await
        .unwrap();

        let values = node
            .execute(&CacheCommand::MGet {
                keys: vec!["k".into(), "missing".into()],
            })
            .await
            .unwrap()
            .into_values()
            .unwrap();
        let remaining = values[0].as_ref().and_then(|v| v.remaining_ttl).unwrap();
        assert!(remaining <= Duration::from_millis(500));
        assert!(values[1].is_none());
    }
}

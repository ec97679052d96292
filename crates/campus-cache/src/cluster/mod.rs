//! Distributed tier: node clients and the cluster connection manager.
//!
//! ## Routing
//!
//! Each named cluster is a set of nodes sharing one keyspace (a primary and
//! its replicas, or a group of failover peers). Writes go to the first healthy
//! primary; reads may also be served by replicas.
//!
//! ```text
//! Coordinator → ClusterManager::execute → route → NodeClient (Redis / memory)
//!                     ↑                                   |
//!              health monitor  ← probes ←─────────────────┘
//! ```

pub mod client;
pub mod manager;
pub mod memory;
pub mod redis;
pub mod topology;

pub use client::{
    CacheCommand, ClientError, CommandReply, ErrorClass, NodeClient, NodeConnector, StoredValue,
};
pub use manager::{ClusterManager, ClusterOptions, ClusterSnapshot, backoff_delay};
pub use memory::{MemoryConnector, MemoryNode};
pub use redis::RedisConnector;
pub use topology::{
    ClusterNode, ClusterState, ClusterTopology, NodeHealth, NodeRole, TopologyAnalysis,
    TopologyEvent,
};

//! Two-tier cache for the campus administration backend.
//!
//! A per-instance local tier in front of one or more Redis clusters, with
//! cluster health tracking, failover and cross-instance invalidation.
//! [`CacheService`] is the entry point.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod service;

pub use cache::{
    CacheCodec, CacheStatistics, InvalidationReport, InvalidationRuleSource, Json, MsgPack,
    MultiTierCache, SetOptions, TierWrite, WriteOutcome,
};
pub use cluster::{ClusterManager, ClusterState, TopologyEvent};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use observability::init_tracing;
pub use service::CacheService;

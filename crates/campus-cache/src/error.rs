//! Error taxonomy for the caching layer.
//!
//! Only [`CacheError::Configuration`] is fatal. Every other variant describes a
//! degraded tier and is folded into a miss (reads) or a partial write by the
//! coordinator before it reaches callers.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by the cache tiers and the cluster connection manager.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Value rejected by the local tier (too large, or no room could be made).
    #[error("value for key '{key}' not admitted to local tier: {reason}")]
    LocalCapacity { key: String, reason: String },

    /// Cluster is degraded, reconnecting, unreachable, or a node call failed.
    #[error("distributed cluster '{cluster_id}' unavailable: {reason}")]
    DistributedUnavailable { cluster_id: String, reason: String },

    /// A distributed call exceeded its per-operation timeout.
    #[error("{operation} on cluster '{cluster_id}' timed out after {timeout_ms}ms")]
    OperationTimeout {
        cluster_id: String,
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Too few healthy primaries to serve safely.
    #[error("cluster '{cluster_id}' topology degraded: {reason}")]
    ClusterTopology { cluster_id: String, reason: String },

    /// Invalid node list, credentials or limits at startup.
    #[error("invalid cache configuration: {0}")]
    Configuration(String),

    /// Application-level rejection from the backing store (e.g. wrong type).
    #[error("cluster '{cluster_id}' rejected {operation}: {message}")]
    Command {
        cluster_id: String,
        operation: &'static str,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown cluster '{0}'")]
    ClusterNotFound(String),

    #[error("cluster '{0}' is closed")]
    Closed(String),
}

impl CacheError {
    /// Whether this error must stop the cache from reporting itself ready.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Whether this error reflects a degraded distributed tier rather than a
    /// caller mistake. Degradations are reported through statistics, never
    /// returned from the read path.
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            Self::DistributedUnavailable { .. }
                | Self::OperationTimeout { .. }
                | Self::ClusterTopology { .. }
                | Self::Closed(_)
        )
    }
}

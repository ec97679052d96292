//! Node-level client abstraction used by the cluster manager.
//!
//! A [`NodeConnector`] opens a [`NodeClient`] for one node address. The Redis
//! implementation lives in [`super::redis`]; [`super::memory`] provides an
//! in-process one.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::manager::ClusterOptions;
use super::topology::NodeRole;
use crate::cache::pattern::GlobPattern;

/// How a failed node call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection refused/dropped, I/O failure, pool exhaustion, timeout.
    Network,
    /// Unexpected reply shape, cluster redirections, auth/handshake failures.
    Protocol,
    /// The store understood and refused the command (e.g. WRONGTYPE).
    Application,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Protocol => write!(f, "protocol"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// A failed node call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class} error: {message}")]
pub struct ClientError {
    pub class: ErrorClass,
    pub message: String,
}

impl ClientError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Network,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Protocol,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Application,
            message: message.into(),
        }
    }

    /// Network and protocol failures feed the reconnection state machine;
    /// application errors go back to the caller untouched.
    pub fn affects_health(&self) -> bool {
        self.class != ErrorClass::Application
    }
}

/// A logical cache operation routed to one node.
#[derive(Debug, Clone)]
pub enum CacheCommand {
    Get {
        key: String,
    },
    MGet {
        keys: Vec<String>,
    },
    Set {
        key: String,
        value: Arc<Vec<u8>>,
        ttl: Duration,
    },
    /// Batched set; pipelined by clients that support it.
    MSet {
        entries: Vec<(String, Arc<Vec<u8>>)>,
        ttl: Duration,
    },
    Delete {
        keys: Vec<String>,
    },
    DeletePattern {
        pattern: GlobPattern,
    },
    Publish {
        channel: String,
        payload: String,
    },
}

impl CacheCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::MGet { .. } => "MGET",
            Self::Set { .. } => "SET",
            Self::MSet { .. } => "MSET",
            Self::Delete { .. } => "DEL",
            Self::DeletePattern { .. } => "DELPATTERN",
            Self::Publish { .. } => "PUBLISH",
        }
    }

    /// Idempotent reads, the only commands retried transparently.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get { .. } | Self::MGet { .. })
    }
}

/// A value read from a node together with the time it has left there.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub bytes: Arc<Vec<u8>>,
    /// `None` when the node holds the key without an expiry or cannot say.
    pub remaining_ttl: Option<Duration>,
}

impl StoredValue {
    pub fn new(bytes: Arc<Vec<u8>>, remaining_ttl: Option<Duration>) -> Self {
        Self {
            bytes,
            remaining_ttl,
        }
    }
}

/// Reply to a [`CacheCommand`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Value(Option<StoredValue>),
    Values(Vec<Option<StoredValue>>),
    Count(u64),
    Done,
}

impl CommandReply {
    pub fn into_value(self) -> Result<Option<StoredValue>, ClientError> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(unexpected("value", &other)),
        }
    }

    pub fn into_values(self) -> Result<Vec<Option<StoredValue>>, ClientError> {
        match self {
            Self::Values(values) => Ok(values),
            other => Err(unexpected("values", &other)),
        }
    }

    pub fn into_count(self) -> Result<u64, ClientError> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(unexpected("count", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &CommandReply) -> ClientError {
    ClientError::protocol(format!("expected {expected} reply, got {got:?}"))
}

/// Connection to a single node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn address(&self) -> &str;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Replication role as reported by the node itself.
    async fn role(&self) -> Result<NodeRole, ClientError>;

    async fn execute(&self, command: &CacheCommand) -> Result<CommandReply, ClientError>;

    /// Whether [`CacheCommand::MSet`] is sent as a single pipelined request.
    fn supports_pipeline(&self) -> bool {
        true
    }
}

/// Opens node clients. The cluster manager owns every client it opens.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        options: &ClusterOptions,
    ) -> Result<Arc<dyn NodeClient>, ClientError>;
}

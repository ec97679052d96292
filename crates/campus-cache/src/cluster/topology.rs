//! Cluster topology: nodes, their roles and health, and the derived cluster state.

use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;

/// Weight of the newest probe in a node's rolling latency.
const NODE_LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    /// Recent failures, still routed to when nothing healthier exists.
    Failing,
    /// Failed `node_failure_threshold` times in a row; never routed to.
    Unreachable,
}

/// Lifecycle of one named cluster.
///
/// ```text
/// disconnected → connecting → ready ⇄ degraded → reconnecting → unreachable
///                                                     ↓
///                                                   ready
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
    Reconnecting,
    /// Reconnection budget exhausted. Terminal until re-armed explicitly.
    Unreachable,
    Closed,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Unreachable => "unreachable",
            Self::Closed => "closed",
        }
    }

    /// States in which calls are routed to nodes.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    pub(crate) fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Ready => 2.0,
            Self::Degraded => 3.0,
            Self::Reconnecting => 4.0,
            Self::Unreachable => 5.0,
            Self::Closed => 6.0,
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One distributed-cache node as last observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub address: String,
    pub role: NodeRole,
    pub health: NodeHealth,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_probe_at: Option<OffsetDateTime>,
    pub rolling_latency_ms: f64,
    pub consecutive_failures: u32,
}

impl ClusterNode {
    /// A node that has not been contacted yet.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            role: NodeRole::Primary,
            health: NodeHealth::Unreachable,
            last_probe_at: None,
            rolling_latency_ms: 0.0,
            consecutive_failures: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }

    pub(crate) fn record_probe_success(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.rolling_latency_ms = if self.last_probe_at.is_none() {
            sample
        } else {
            self.rolling_latency_ms + NODE_LATENCY_ALPHA * (sample - self.rolling_latency_ms)
        };
        self.last_probe_at = Some(OffsetDateTime::now_utc());
        self.mark_healthy();
    }

    pub(crate) fn mark_healthy(&mut self) {
        self.health = NodeHealth::Healthy;
        self.consecutive_failures = 0;
    }

    pub(crate) fn record_failure(&mut self, threshold: u32, probed: bool) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if probed {
            self.last_probe_at = Some(OffsetDateTime::now_utc());
        }
        self.health = if self.consecutive_failures >= threshold.max(1) {
            NodeHealth::Unreachable
        } else {
            NodeHealth::Failing
        };
    }
}

/// Nodes of one named cluster plus its state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub cluster_id: String,
    pub nodes: Vec<ClusterNode>,
    pub state: ClusterState,
}

impl ClusterTopology {
    pub fn new(cluster_id: impl Into<String>, addresses: &[String]) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            nodes: addresses.iter().map(ClusterNode::new).collect(),
            state: ClusterState::Disconnected,
        }
    }

    pub fn node(&self, address: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.address == address)
    }

    pub fn node_mut(&mut self, address: &str) -> Option<&mut ClusterNode> {
        self.nodes.iter_mut().find(|n| n.address == address)
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_healthy()).count()
    }

    /// State implied by node health alone: `ready` only when every node is healthy.
    pub fn derived_state(&self) -> ClusterState {
        if !self.nodes.is_empty() && self.nodes.iter().all(ClusterNode::is_healthy) {
            ClusterState::Ready
        } else {
            ClusterState::Degraded
        }
    }

    pub fn analyze(&self) -> TopologyAnalysis {
        let mut analysis = TopologyAnalysis {
            total: self.nodes.len(),
            ..TopologyAnalysis::default()
        };
        for node in &self.nodes {
            match node.health {
                NodeHealth::Healthy => {
                    analysis.healthy += 1;
                    match node.role {
                        NodeRole::Primary => analysis.primaries += 1,
                        NodeRole::Replica => analysis.replicas += 1,
                    }
                }
                NodeHealth::Failing | NodeHealth::Unreachable => analysis.failing += 1,
            }
        }
        analysis
    }
}

/// Node counts from one topology pass. Only healthy nodes count as primaries
/// or replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyAnalysis {
    pub total: usize,
    pub healthy: usize,
    pub primaries: usize,
    pub replicas: usize,
    pub failing: usize,
}

impl TopologyAnalysis {
    /// Alert-worthy conditions; empty when the topology is sound.
    pub fn alerts(&self, min_primaries: usize) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.failing > 0 {
            reasons.push(format!("{} of {} node(s) failing", self.failing, self.total));
        }
        if self.primaries < min_primaries {
            reasons.push(format!(
                "{} healthy primar{} below safety minimum of {}",
                self.primaries,
                if self.primaries == 1 { "y" } else { "ies" },
                min_primaries
            ));
        }
        reasons
    }
}

/// Topology change notification delivered to every live subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TopologyEvent {
    StateChanged {
        cluster_id: String,
        from: ClusterState,
        to: ClusterState,
    },
    NodeJoined {
        cluster_id: String,
        address: String,
    },
    NodeLeft {
        cluster_id: String,
        address: String,
    },
    NodeFailed {
        cluster_id: String,
        address: String,
        health: NodeHealth,
        error: String,
    },
    NodeRecovered {
        cluster_id: String,
        address: String,
        latency_ms: f64,
    },
    TopologyAlert {
        cluster_id: String,
        analysis: TopologyAnalysis,
        reasons: Vec<String>,
    },
    ClusterUnreachable {
        cluster_id: String,
        attempts: u32,
    },
}

impl TopologyEvent {
    pub fn cluster_id(&self) -> &str {
        match self {
            Self::StateChanged { cluster_id, .. }
            | Self::NodeJoined { cluster_id, .. }
            | Self::NodeLeft { cluster_id, .. }
            | Self::NodeFailed { cluster_id, .. }
            | Self::NodeRecovered { cluster_id, .. }
            | Self::TopologyAlert { cluster_id, .. }
            | Self::ClusterUnreachable { cluster_id, .. } => cluster_id,
        }
    }
}

//! Cluster lifecycle tests: events, failover, reconnection and membership.

use std::sync::Arc;
use std::time::Duration;

use campus_cache::CacheError;
use campus_cache::cluster::{
    CacheCommand, ClusterManager, ClusterOptions, ClusterState, ErrorClass, MemoryConnector,
    NodeHealth, NodeRole, TopologyEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn options() -> ClusterOptions {
    ClusterOptions {
        connect_timeout: Duration::from_millis(200),
        command_timeout: Duration::from_millis(100),
        max_connect_attempts: 1,
        max_retries: 1,
        reconnect_base_delay: Duration::from_millis(5),
        reconnect_max_delay: Duration::from_millis(20),
        max_reconnect_attempts: 2,
        node_failure_threshold: 2,
        min_primaries: 1,
        ..ClusterOptions::default()
    }
}

fn addresses(list: &[&str]) -> Vec<String> {
    list.iter().map(|a| a.to_string()).collect()
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(
    events: &mut UnboundedReceiver<TopologyEvent>,
    pred: impl Fn(&TopologyEvent) -> bool,
) -> TopologyEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected topology event")
}

async fn wait_for_state(manager: &ClusterManager, cluster_id: &str, state: ClusterState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.state(cluster_id) != Some(state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cluster reached expected state");
}

#[tokio::test]
async fn test_initialization_emits_state_changes() {
    let connector = MemoryConnector::new();
    connector.add_node("p1:6379", NodeRole::Primary);
    connector.add_node("r1:6379", NodeRole::Replica);
    let manager = ClusterManager::new(Arc::new(connector));
    let mut events = manager.subscribe();

    let topology = manager
        .initialize_cluster("main", &addresses(&["p1:6379", "r1:6379"]), options())
        .await
        .unwrap();
    assert_eq!(topology.state, ClusterState::Ready);
    assert_eq!(topology.node("r1:6379").map(|n| n.role), Some(NodeRole::Replica));

    let first = events.recv().await.unwrap();
    assert_eq!(
        first,
        TopologyEvent::StateChanged {
            cluster_id: "main".into(),
            from: ClusterState::Disconnected,
            to: ClusterState::Connecting,
        }
    );
    let second = events.recv().await.unwrap();
    assert_eq!(
        second,
        TopologyEvent::StateChanged {
            cluster_id: "main".into(),
            from: ClusterState::Connecting,
            to: ClusterState::Ready,
        }
    );
}

#[tokio::test]
async fn test_unreachable_after_reconnect_exhausted_then_recovers() {
    let connector = MemoryConnector::new();
    let node = connector.add_node("p1:6379", NodeRole::Primary);
    let manager = ClusterManager::new(Arc::new(connector));
    let mut events = manager.subscribe();

    manager
        .initialize_cluster("main", &addresses(&["p1:6379"]), options())
        .await
        .unwrap();

    node.set_failure(Some(ErrorClass::Network));
    manager.check_health().await;

    let event = wait_for(&mut events, |e| {
        matches!(e, TopologyEvent::ClusterUnreachable { .. })
    })
    .await;
    assert_eq!(
        event,
        TopologyEvent::ClusterUnreachable {
            cluster_id: "main".into(),
            attempts: 2,
        }
    );
    assert_eq!(manager.state("main"), Some(ClusterState::Unreachable));

    let err = manager
        .execute("main", CacheCommand::Get { key: "k".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::DistributedUnavailable { .. }));

    node.set_failure(None);
    manager.reconnect("main").unwrap();
    wait_for_state(&manager, "main", ClusterState::Ready).await;

    let reply = manager
        .execute("main", CacheCommand::Get { key: "k".into() })
        .await
        .unwrap();
    assert_eq!(reply.into_value().unwrap(), None);
}

#[tokio::test]
async fn test_failed_node_is_reported_and_recovers() {
    let connector = MemoryConnector::new();
    connector.add_node("p1:6379", NodeRole::Primary);
    let replica = connector.add_node("r1:6379", NodeRole::Replica);
    let manager = ClusterManager::new(Arc::new(connector));
    let mut events = manager.subscribe();

    manager
        .initialize_cluster("main", &addresses(&["p1:6379", "r1:6379"]), options())
        .await
        .unwrap();

    replica.set_failure(Some(ErrorClass::Network));
    manager.check_health().await;

    let failed = wait_for(&mut events, |e| matches!(e, TopologyEvent::NodeFailed { .. })).await;
    match failed {
        TopologyEvent::NodeFailed { address, health, .. } => {
            assert_eq!(address, "r1:6379");
            assert_eq!(health, NodeHealth::Failing);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(manager.state("main"), Some(ClusterState::Degraded));

    let alert = wait_for(&mut events, |e| matches!(e, TopologyEvent::TopologyAlert { .. })).await;
    match alert {
        TopologyEvent::TopologyAlert { reasons, .. } => {
            assert!(reasons.iter().any(|r| r.contains("failing")));
        }
        other => panic!("unexpected event {other:?}"),
    }

    replica.set_failure(None);
    manager.check_health().await;

    wait_for(&mut events, |e| {
        matches!(e, TopologyEvent::NodeRecovered { address, .. } if address == "r1:6379")
    })
    .await;
    assert_eq!(manager.state("main"), Some(ClusterState::Ready));
}

#[tokio::test]
async fn test_node_membership_changes() {
    let connector = MemoryConnector::new();
    connector.add_node("p1:6379", NodeRole::Primary);
    connector.add_node("r1:6379", NodeRole::Replica);
    let manager = ClusterManager::new(Arc::new(connector));

    manager
        .initialize_cluster("main", &addresses(&["p1:6379"]), options())
        .await
        .unwrap();
    let mut events = manager.subscribe();

    assert!(manager.add_node("main", "r1:6379").await.unwrap());
    assert!(!manager.add_node("main", "r1:6379").await.unwrap());
    assert_eq!(
        events.recv().await.unwrap(),
        TopologyEvent::NodeJoined {
            cluster_id: "main".into(),
            address: "r1:6379".into(),
        }
    );

    let topology = manager.topology("main").unwrap();
    assert_eq!(topology.nodes.len(), 2);
    let replica = topology.node("r1:6379").unwrap();
    assert_eq!(replica.role, NodeRole::Replica);
    assert!(replica.is_healthy());

    assert!(manager.remove_node("main", "r1:6379").unwrap());
    assert!(!manager.remove_node("main", "r1:6379").unwrap());
    wait_for(&mut events, |e| matches!(e, TopologyEvent::NodeLeft { .. })).await;
    assert_eq!(manager.topology("main").unwrap().nodes.len(), 1);

    assert!(matches!(
        manager.add_node("sessions", "x:6379").await,
        Err(CacheError::ClusterNotFound(_))
    ));
}

#[tokio::test]
async fn test_too_few_primaries_raises_alert() {
    let connector = MemoryConnector::new();
    connector.add_node("p1:6379", NodeRole::Primary);
    let manager = ClusterManager::new(Arc::new(connector));
    let mut events = manager.subscribe();

    let cluster_options = ClusterOptions {
        min_primaries: 2,
        ..options()
    };
    manager
        .initialize_cluster("main", &addresses(&["p1:6379"]), cluster_options)
        .await
        .unwrap();

    let alert = wait_for(&mut events, |e| matches!(e, TopologyEvent::TopologyAlert { .. })).await;
    match alert {
        TopologyEvent::TopologyAlert {
            analysis, reasons, ..
        } => {
            assert_eq!(analysis.primaries, 1);
            assert!(reasons.iter().any(|r| r.contains("safety minimum")));
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(matches!(
        manager.verify_topology("main"),
        Err(CacheError::ClusterTopology { .. })
    ));
    // Still serving: the alert is advisory.
    assert!(manager
        .execute("main", CacheCommand::Get { key: "k".into() })
        .await
        .is_ok());
}

#[tokio::test]
async fn test_health_monitor_detects_failure() {
    let connector = MemoryConnector::new();
    let node = connector.add_node("p1:6379", NodeRole::Primary);
    let manager = ClusterManager::new(Arc::new(connector));
    manager
        .initialize_cluster(
            "main",
            &addresses(&["p1:6379"]),
            ClusterOptions {
                max_retries: 100,
                ..options()
            },
        )
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let monitor = manager.start_health_monitoring(Duration::from_millis(10));
    node.set_failure(Some(ErrorClass::Network));

    wait_for(&mut events, |e| {
        matches!(
            e,
            TopologyEvent::StateChanged {
                to: ClusterState::Degraded,
                ..
            }
        )
    })
    .await;

    node.set_failure(None);
    wait_for_state(&manager, "main", ClusterState::Ready).await;

    monitor.send(true).unwrap();

    let stats = manager.get_cluster_statistics();
    assert_eq!(stats["main"].state, ClusterState::Ready);
    assert_eq!(stats["main"].consecutive_failures, 0);
}

//! Bind/availability state machine and shutdown behavior, driven through
//! an in-process coordinator.

mod common;

use std::time::{Duration, Instant};

use shardrpc_common::cluster::{AvailabilityChange, ClusterClient, ClusterEvent};
use shardrpc_common::protocol::ShardRpcError;
use shardrpc_server::{NetworkServer, ServerConfig};

use common::{single_node_cluster, start_server, test_config};

#[tokio::test]
async fn test_bind_unknown_node_fails() {
    let cluster = single_node_cluster();
    cluster.start().unwrap();
    let server = NetworkServer::new(test_config(), cluster).unwrap();

    let err = server.bind(42, true, 0).await.unwrap_err();
    assert!(matches!(err, ShardRpcError::InvalidNode(_)));
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn test_second_bind_fails() {
    let (server, _cluster) = start_server(test_config()).await;
    let err = server.bind(1, true, 0).await.unwrap_err();
    assert!(matches!(err, ShardRpcError::AlreadyBound));
    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_by_url() {
    let cluster = single_node_cluster();
    cluster.start().unwrap();
    let server = NetworkServer::new(test_config(), cluster.clone()).unwrap();

    server.bind_by_url("127.0.0.1", 0, false, 0).await.unwrap();
    assert_eq!(server.bound_node().unwrap().id, 1);

    let other = NetworkServer::new(test_config(), cluster).unwrap();
    let err = other.bind_by_url("10.9.9.9", 1234, false, 0).await.unwrap_err();
    assert!(matches!(err, ShardRpcError::InvalidNode(_)));

    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_marks_available_through_connected_replay() {
    let (server, cluster) = start_server(test_config()).await;

    // The coordinator was already connected, so binding with
    // mark_available replays the unavailable/available pair that forces
    // watchers to observe a transition.
    assert_eq!(
        cluster.availability_changes(),
        vec![
            AvailabilityChange::Unavailable { node_id: 1 },
            AvailabilityChange::Available {
                node_id: 1,
                capability: 0
            },
        ]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_mark_unavailable_disarms_reconnect_replay() {
    let (server, cluster) = start_server(test_config()).await;

    server.mark_unavailable().unwrap();
    let baseline = cluster.availability_changes();
    assert_eq!(
        baseline.last(),
        Some(&AvailabilityChange::Unavailable { node_id: 1 })
    );

    // A session recovery must not re-advertise until mark_available is
    // called again.
    cluster.fire(ClusterEvent::Connected(cluster.nodes()));
    assert_eq!(cluster.availability_changes(), baseline);

    server.mark_available(0b101).unwrap();
    cluster.fire(ClusterEvent::Connected(cluster.nodes()));
    let changes = cluster.availability_changes();
    assert_eq!(
        &changes[baseline.len()..],
        &[
            AvailabilityChange::Available {
                node_id: 1,
                capability: 0b101
            },
            AvailabilityChange::Unavailable { node_id: 1 },
            AvailabilityChange::Available {
                node_id: 1,
                capability: 0b101
            },
        ]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_without_mark_available_stays_silent() {
    let cluster = single_node_cluster();
    cluster.start().unwrap();
    let server = NetworkServer::new(test_config(), cluster.clone()).unwrap();

    server.bind(1, false, 0).await.unwrap();
    assert!(cluster.availability_changes().is_empty());

    cluster.fire(ClusterEvent::Connected(cluster.nodes()));
    assert!(cluster.availability_changes().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_coordinator_failure_in_listener_is_swallowed() {
    let (server, cluster) = start_server(test_config()).await;
    let baseline = cluster.availability_changes().len();

    // The replay inside the listener callback fails; the callback must
    // survive and the server stays bound.
    cluster.set_failing(true);
    cluster.fire(ClusterEvent::Connected(cluster.nodes()));
    cluster.set_failing(false);

    assert_eq!(cluster.availability_changes().len(), baseline);
    assert!(server.local_addr().is_some());

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_fences_the_api() {
    let (server, cluster) = start_server(test_config()).await;

    server.shutdown().await;
    server.shutdown().await;
    assert!(server.is_shut_down());
    assert_eq!(cluster.listener_count(), 0);

    assert!(matches!(
        server.mark_available(0),
        Err(ShardRpcError::NetworkShutdown)
    ));
    assert!(matches!(
        server.bind(1, true, 0).await,
        Err(ShardRpcError::NetworkShutdown)
    ));
}

#[tokio::test]
async fn test_shutdown_pause_marks_unavailable_first() {
    let config = ServerConfig {
        coordinator_session_timeout_ms: 50,
        shutdown_pause_multiplier: 2,
        ..test_config()
    };
    let (server, cluster) = start_server(config).await;
    let baseline = cluster.availability_changes().len();

    let started = Instant::now();
    server.shutdown().await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    let changes = cluster.availability_changes();
    assert_eq!(
        changes[baseline],
        AvailabilityChange::Unavailable { node_id: 1 }
    );
}

#[tokio::test]
async fn test_cluster_initiated_shutdown_skips_coordinator_unregister() {
    let (server, cluster) = start_server(test_config()).await;
    let baseline = cluster.availability_changes().len();

    cluster.fire(ClusterEvent::Shutdown);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !server.is_shut_down() {
        assert!(Instant::now() < deadline, "server did not shut down");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // No unavailable call and no listener removal: the coordinator is
    // already gone.
    assert_eq!(cluster.availability_changes().len(), baseline);
    assert_eq!(cluster.listener_count(), 1);
}

#[tokio::test]
async fn test_mark_available_requires_bound_server() {
    let cluster = single_node_cluster();
    cluster.start().unwrap();
    let server = NetworkServer::new(test_config(), cluster).unwrap();

    assert!(matches!(
        server.mark_available(0),
        Err(ShardRpcError::NotBound)
    ));
    assert!(matches!(
        server.mark_unavailable(),
        Err(ShardRpcError::NotBound)
    ));
}

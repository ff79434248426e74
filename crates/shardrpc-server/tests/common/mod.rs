#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use shardrpc_common::cluster::{ClusterClient, Node, StaticClusterClient};
use shardrpc_common::protocol::{wire, RequestEnvelope};
use shardrpc_server::{NetworkServer, ServerConfig};
use tokio::net::TcpStream;

/// Config suitable for tests: tiny session timeout, no drain pause.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        service_name: "test-service".to_string(),
        client_name: "test".to_string(),
        coordinator_session_timeout_ms: 50,
        shutdown_pause_multiplier: 0,
        ..ServerConfig::default()
    }
}

/// A coordinator holding one node that serves partitions 0 and 1 on an
/// ephemeral port.
pub fn single_node_cluster() -> Arc<StaticClusterClient> {
    Arc::new(StaticClusterClient::new(vec![Node::new(
        1,
        "127.0.0.1:0",
        [0, 1],
    )]))
}

/// Starts a bound server over a fresh single-node cluster.
pub async fn start_server(config: ServerConfig) -> (NetworkServer, Arc<StaticClusterClient>) {
    let cluster = single_node_cluster();
    cluster.start().unwrap();
    let server = NetworkServer::new(config, cluster.clone()).unwrap();
    server.bind(1, true, 0).await.unwrap();
    (server, cluster)
}

/// Minimal framed-protocol client for driving a server under test.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        TestClient { stream }
    }

    pub async fn send(&mut self, envelope: &RequestEnvelope) {
        wire::write_envelope(&mut self.stream, envelope).await.unwrap();
    }

    pub async fn recv(&mut self) -> Option<RequestEnvelope> {
        wire::read_envelope(&mut self.stream).await.unwrap()
    }

    pub async fn call(&mut self, envelope: &RequestEnvelope) -> RequestEnvelope {
        self.send(envelope).await;
        self.recv().await.expect("connection closed without a reply")
    }
}

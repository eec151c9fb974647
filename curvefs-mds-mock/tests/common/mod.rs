//! Shared utilities for the mock MDS integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use curvefs_mds_mock::create_router;
use curvefs_topo::config::{Backoff, MdsConfig, RetryPolicy};
use curvefs_topo::{HttpTransport, MdsClient, MemoryMds, TopologyGraph};
use tokio::net::TcpListener;

/// Allocate an available port for testing.
pub fn allocate_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

/// Mock MDS bound to a local port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub mds: Arc<MemoryMds>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(TopologyGraph::new()).await
    }

    pub async fn spawn_with(graph: TopologyGraph) -> Self {
        let mds = Arc::new(MemoryMds::with_graph(graph));
        let router = create_router(mds.clone());

        let addr: SocketAddr = format!("127.0.0.1:{}", allocate_port()).parse().unwrap();
        let listener = TcpListener::bind(&addr).await.expect("Failed to bind");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            mds,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self, method: &str) -> String {
        format!("http://{}/TopologyService/{}", self.addr, method)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Client config with short deadlines for tests.
pub fn mds_config(addrs: Vec<String>) -> MdsConfig {
    MdsConfig {
        addrs,
        rpc_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_retries: 2,
            interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            backoff: Backoff::Fixed,
        },
    }
}

/// MDS client talking HTTP to `addrs`.
pub fn http_client(addrs: Vec<String>) -> Arc<MdsClient> {
    let config = mds_config(addrs);
    let transport = HttpTransport::new(config.rpc_timeout).expect("Failed to build HTTP client");
    Arc::new(MdsClient::new(Arc::new(transport), config))
}

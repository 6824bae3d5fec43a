//! Socket cache behavior against real loopback listeners.

mod helpers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use omnibus::directory::ServiceInfo;
use omnibus::transport::{TransportServer, TransportSocket};
use omnibus::{SocketCache, Url};

use helpers::configure_tracing;

async fn listener() -> (TransportServer, Url, mpsc::UnboundedReceiver<Arc<TransportSocket>>) {
    let server = TransportServer::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let endpoints = server
        .listen::<tokio::net::TcpListener>(&helpers::any_loopback(), HashMap::new(), tx)
        .await
        .expect("listen");
    let endpoint = endpoints.first().expect("endpoint").clone();
    (server, endpoint, rx)
}

fn info_for(machine: &str, endpoints: Vec<Url>) -> ServiceInfo {
    let mut info = ServiceInfo::new("target");
    info.machine_id = machine.to_string();
    info.endpoints = endpoints;
    info
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn concurrent_requesters_share_one_socket() {
    configure_tracing();
    let (_server, endpoint, _rx) = listener().await;
    let cache: Arc<SocketCache> = SocketCache::new("local-machine", HashMap::new());
    let info = info_for("local-machine", vec![endpoint]);

    let futures: Vec<_> = (0..10).map(|_| cache.socket(&info, None)).collect();
    let mut ids = Vec::new();
    for f in futures {
        let socket = tokio::time::timeout(Duration::from_secs(2), f)
            .await
            .expect("connect in time")
            .expect("connect");
        ids.push(socket.id());
    }
    // Winner-takes-all: every caller observes the same socket.
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(cache.slot_count(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unreachable_endpoint_rejects_every_waiter() {
    configure_tracing();
    // Bind-then-drop to get a port nothing listens on.
    let port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("probe bind");
        probe.local_addr().expect("addr").port()
    };
    let cache: Arc<SocketCache> = SocketCache::new("local-machine", HashMap::new());
    let info = info_for(
        "local-machine",
        vec![Url::parse(&format!("tcp://127.0.0.1:{}", port)).expect("url")],
    );
    let err = tokio::time::timeout(Duration::from_secs(5), cache.socket(&info, None))
        .await
        .expect("failure must be reported")
        .expect_err("connect must fail");
    assert!(
        err.to_string().contains("unavailable") || err.to_string().contains("Failed to connect"),
        "unexpected error: {}",
        err
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn closed_cache_rejects_requests_with_session_closed() {
    configure_tracing();
    let (_server, endpoint, _rx) = listener().await;
    let cache: Arc<SocketCache> = SocketCache::new("local-machine", HashMap::new());
    cache.close();
    let err = cache
        .socket(&info_for("local-machine", vec![endpoint]), None)
        .await
        .expect_err("closed cache must reject");
    assert!(err.to_string().contains("session closed"), "{}", err);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn close_errors_pending_attempts() {
    configure_tracing();
    let (_server, endpoint, _rx) = listener().await;
    let cache: Arc<SocketCache> = SocketCache::new("local-machine", HashMap::new());
    let socket = tokio::time::timeout(
        Duration::from_secs(2),
        cache.socket(&info_for("local-machine", vec![endpoint]), None),
    )
    .await
    .expect("in time")
    .expect("connect");
    assert!(socket.is_connected());

    cache.close();
    assert!(
        helpers::wait_until(Duration::from_secs(2), || !socket.is_connected()).await,
        "cached socket must be closed with the cache"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn evicted_slot_reconnects_after_remote_close() {
    configure_tracing();
    let (_server, endpoint, mut rx) = listener().await;
    let cache: Arc<SocketCache> = SocketCache::new("local-machine", HashMap::new());
    let info = info_for("local-machine", vec![endpoint]);

    let first = tokio::time::timeout(Duration::from_secs(2), cache.socket(&info, None))
        .await
        .expect("in time")
        .expect("connect");
    let accepted = rx.recv().await.expect("server side socket");
    accepted.close();
    assert!(
        helpers::wait_until(Duration::from_secs(2), || cache.slot_count() == 0).await,
        "slot must be evicted after the peer closed"
    );

    let second = tokio::time::timeout(Duration::from_secs(2), cache.socket(&info, None))
        .await
        .expect("in time")
        .expect("reconnect");
    assert_ne!(first.id(), second.id());
}

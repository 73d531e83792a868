//! Backend failure tests
//!
//! A failed sub-command turns the whole command into one error reply while
//! the client connection stays usable.

use crate::integration::{config_for, start_proxy, BackendMode, MockBackendBuilder, TestClient};
use std::time::Duration;

/// Address that refuses connections
async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

#[tokio::test]
async fn test_mget_with_dead_backend_is_single_error() {
    let live = MockBackendBuilder::new()
        .with_data(b"k1", b"one")
        .build()
        .await
        .unwrap();
    let dead = dead_address().await;

    let proxy = start_proxy(config_for(&[live.addr(), dead.as_str()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    let reply = client.command(&["MGET", "k1", "k2"]).await.unwrap();
    assert!(reply.starts_with("-ERR "), "{}", reply);
    assert!(reply.contains(&dead), "{}", reply);
    assert_eq!(reply.matches("\r\n").count(), 1);

    // Same connection, healthy backend
    assert_eq!(client.command(&["GET", "k1"]).await.unwrap(), "$3\r\none\r\n");

    // The healthy half went back to its pool
    let stats = proxy
        .server
        .pool()
        .unit_pool(live.addr())
        .unwrap()
        .stats();
    assert_eq!(stats.dials, 1);
    assert_eq!(stats.reused, 1);
}

#[tokio::test]
async fn test_dropped_backend_connection_is_replaced() {
    let b0 = MockBackendBuilder::new()
        .mode(BackendMode::DropConnection)
        .with_data(b"k1", b"one")
        .build()
        .await
        .unwrap();
    let b1 = MockBackendBuilder::new().build().await.unwrap();

    let proxy = start_proxy(config_for(&[b0.addr(), b1.addr()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    let reply = client.command(&["GET", "k1"]).await.unwrap();
    assert!(reply.starts_with("-ERR read from backend"), "{}", reply);

    b0.set_mode(BackendMode::Normal);
    assert_eq!(client.command(&["GET", "k1"]).await.unwrap(), "$3\r\none\r\n");

    // The broken connection was discarded, so the second request dialed fresh
    assert_eq!(b0.accepted_connections(), 2);
    let stats = proxy.server.pool().unit_pool(b0.addr()).unwrap().stats();
    assert_eq!(stats.discarded, 1);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let b0 = MockBackendBuilder::new()
        .latency(Duration::from_millis(500))
        .build()
        .await
        .unwrap();
    let b1 = MockBackendBuilder::new().build().await.unwrap();

    let mut config = config_for(&[b0.addr(), b1.addr()]);
    config.pool.read_timeout_ms = 100;
    let proxy = start_proxy(config).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    let reply = client.command(&["GET", "k1"]).await.unwrap();
    assert!(reply.contains("did not reply within"), "{}", reply);

    // k2 is on the other backend
    assert_eq!(client.command(&["GET", "k2"]).await.unwrap(), "$-1\r\n");
}

#[tokio::test]
async fn test_unmapped_bucket_is_error_reply() {
    let b0 = MockBackendBuilder::new().build().await.unwrap();

    let mut config = config_for(&[b0.addr()]);
    config.buckets = 2;
    let proxy = start_proxy(config).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    // "a" (97) lands in unmapped bucket 1
    let reply = client.command(&["GET", "a"]).await.unwrap();
    assert_eq!(reply, "-ERR no backend configured for bucket 1\r\n");
    assert_eq!(client.command(&["GET", "b"]).await.unwrap(), "$-1\r\n");
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let b0 = MockBackendBuilder::new().build().await.unwrap();

    let proxy = start_proxy(config_for(&[b0.addr()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    client.send_raw(b"*2\r\n$3\r\nget\r\n:oops\r\n").await.unwrap();
    let reply = client.read_reply().await.unwrap();
    assert!(reply.starts_with("-ERR bad request format"), "{}", reply);
    assert!(client.is_closed().await);
    assert!(b0.requests().is_empty());
}

#[tokio::test]
async fn test_arity_error_keeps_connection_open() {
    let b0 = MockBackendBuilder::new().build().await.unwrap();

    let proxy = start_proxy(config_for(&[b0.addr()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    let reply = client.command(&["GET"]).await.unwrap();
    assert!(reply.starts_with("-ERR wrong number of arguments"), "{}", reply);
    assert_eq!(client.command(&["SET", "x", "1"]).await.unwrap(), "+OK\r\n");
}

#[tokio::test]
async fn test_deeply_nested_frame_closes_only_that_client() {
    let b0 = MockBackendBuilder::new().build().await.unwrap();

    let proxy = start_proxy(config_for(&[b0.addr()])).await;
    let mut attacker = TestClient::connect(&proxy.addr).await.unwrap();

    let mut frame = b"*2\r\n$3\r\nGET\r\n".to_vec();
    frame.extend_from_slice(&b"*1\r\n".repeat(64));
    frame.extend_from_slice(b"$1\r\nk\r\n");
    attacker.send_raw(&frame).await.unwrap();

    let reply = attacker.read_reply().await.unwrap();
    assert!(reply.starts_with("-ERR bad request format"), "{}", reply);
    assert!(attacker.is_closed().await);

    // The proxy keeps serving other clients
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();
    assert_eq!(client.command(&["SET", "x", "1"]).await.unwrap(), "+OK\r\n");
}

//! Multi-key fan-out tests
//!
//! With two buckets "k1" (156) lands on backend 0, "k2" (157) on backend 1
//! and "k3" (158) on backend 0.

use crate::integration::{config_for, start_proxy, MockBackendBuilder, TestClient};

#[tokio::test]
async fn test_mset_splits_across_backends() {
    let b0 = MockBackendBuilder::new().build().await.unwrap();
    let b1 = MockBackendBuilder::new().build().await.unwrap();

    let proxy = start_proxy(config_for(&[b0.addr(), b1.addr()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    let reply = client
        .command(&["MSET", "k1", "v1", "k2", "v2"])
        .await
        .unwrap();
    assert_eq!(reply, "*2\r\n+OK\r\n+OK\r\n");

    assert_eq!(b0.get_stored_value(b"k1"), Some(b"v1".to_vec()));
    assert_eq!(b1.get_stored_value(b"k2"), Some(b"v2".to_vec()));
    assert_eq!(b0.get_stored_value(b"k2"), None);

    // Each backend saw a plain single-key set
    let sent = b0.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, "set");
    assert_eq!(sent[0].args, vec![b"set".to_vec(), b"k1".to_vec(), b"v1".to_vec()]);
}

#[tokio::test]
async fn test_mget_merges_in_request_order() {
    let b0 = MockBackendBuilder::new()
        .with_data(b"k1", b"one")
        .build()
        .await
        .unwrap();
    let b1 = MockBackendBuilder::new()
        .with_data(b"k2", b"two")
        .build()
        .await
        .unwrap();

    let proxy = start_proxy(config_for(&[b0.addr(), b1.addr()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    let reply = client.command(&["mget", "k2", "k1", "k3"]).await.unwrap();
    assert_eq!(reply, "*3\r\n$3\r\ntwo\r\n$3\r\none\r\n$-1\r\n");
}

#[tokio::test]
async fn test_single_key_mget_is_not_wrapped() {
    let b0 = MockBackendBuilder::new()
        .with_data(b"k1", b"one")
        .build()
        .await
        .unwrap();
    let b1 = MockBackendBuilder::new().build().await.unwrap();

    let proxy = start_proxy(config_for(&[b0.addr(), b1.addr()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    assert_eq!(client.command(&["MGET", "k1"]).await.unwrap(), "$3\r\none\r\n");
}

#[tokio::test]
async fn test_hash_tag_colocates_keys() {
    let b0 = MockBackendBuilder::new().build().await.unwrap();
    let b1 = MockBackendBuilder::new().build().await.unwrap();

    let proxy = start_proxy(config_for(&[b0.addr(), b1.addr()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    // Both keys route on the tag "k2"
    let reply = client
        .command(&["MSET", "user{k2}", "a", "order{k2,7}", "b"])
        .await
        .unwrap();
    assert_eq!(reply, "*2\r\n+OK\r\n+OK\r\n");

    assert!(b0.requests().is_empty());
    assert_eq!(b1.get_stored_value(b"user{k2}"), Some(b"a".to_vec()));
    assert_eq!(b1.get_stored_value(b"order{k2,7}"), Some(b"b".to_vec()));
}

#[tokio::test]
async fn test_mset_with_dangling_key_is_arity_error() {
    let b0 = MockBackendBuilder::new().build().await.unwrap();
    let b1 = MockBackendBuilder::new().build().await.unwrap();

    let proxy = start_proxy(config_for(&[b0.addr(), b1.addr()])).await;
    let mut client = TestClient::connect(&proxy.addr).await.unwrap();

    let reply = client.command(&["MSET", "k1", "v1", "k2"]).await.unwrap();
    assert!(reply.starts_with("-ERR wrong number of arguments"), "{}", reply);
    assert!(b0.requests().is_empty());
    assert!(b1.requests().is_empty());

    // Connection is still usable
    assert_eq!(client.command(&["GET", "k1"]).await.unwrap(), "$-1\r\n");
}

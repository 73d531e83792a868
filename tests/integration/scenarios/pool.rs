//! Unit pool tests against a live mock backend

use crate::integration::{MockBackend, MockBackendBuilder};
use futures::future::join_all;
use keyshard::core::connection_pool::{ConnectionPool, TcpConnector, UnitPool};
use keyshard::core::PoolError;
use std::sync::Arc;
use std::time::Duration;

async fn ping_roundtrip(pool: &UnitPool) {
    let mut conn = pool.get().await.unwrap();
    conn.send(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
    assert_eq!(conn.read_reply().await.unwrap(), b"+PONG\r\n".to_vec());
    pool.put(Some(conn));
}

fn unit_pool(backend: &MockBackend, size: usize) -> Arc<UnitPool> {
    Arc::new(
        UnitPool::new(
            backend.addr(),
            size,
            Duration::from_millis(500),
            1,
            Arc::new(TcpConnector),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_steady_state_never_exceeds_pool_size() {
    let backend = MockBackendBuilder::new().build().await.unwrap();
    let pool = unit_pool(&backend, 3);

    for _ in 0..10 {
        join_all((0..3).map(|_| ping_roundtrip(&pool))).await;
    }

    let stats = pool.stats();
    assert_eq!(stats.dials, 3);
    assert_eq!(stats.reused, 27);
    assert_eq!(stats.overflow_closed, 0);
    assert_eq!(pool.idle(), 3);
    assert_eq!(backend.accepted_connections(), 3);
}

#[tokio::test]
async fn test_burst_over_capacity_dials_then_closes_extras() {
    let backend = MockBackendBuilder::new().build().await.unwrap();
    let pool = unit_pool(&backend, 3);

    // More callers than slots: the pool dials instead of waiting
    let held = join_all((0..5).map(|_| pool.get())).await;
    assert!(held.iter().all(|c| c.is_ok()));
    assert_eq!(pool.stats().dials, 5);
    assert_eq!(pool.free_slots(), 0);

    for conn in held {
        pool.put(Some(conn.unwrap()));
    }

    let stats = pool.stats();
    assert_eq!(stats.returned, 3);
    assert_eq!(stats.overflow_closed, 2);
    assert_eq!(pool.idle(), 3);
}

#[tokio::test]
async fn test_concurrent_tasks_share_registry() {
    let backend = MockBackendBuilder::new().build().await.unwrap();
    let registry = Arc::new(ConnectionPool::new());
    registry
        .new_unit_pool(backend.addr(), 3, Duration::from_millis(500), 2)
        .unwrap();

    let addr = backend.addr().to_string();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let registry = Arc::clone(&registry);
        let addr = addr.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let mut conn = registry.get(&addr).await.unwrap();
                conn.send(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
                conn.read_reply().await.unwrap();
                registry.put(&addr, Some(conn));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = registry.unit_pool(&addr).unwrap().stats();
    assert!(stats.dials <= 3, "dialed {} times", stats.dials);
    assert_eq!(stats.dials + stats.reused, 15);
}

#[tokio::test]
async fn test_get_unregistered_address() {
    let registry = ConnectionPool::new();
    assert!(matches!(
        registry.get("127.0.0.1:1").await,
        Err(PoolError::UnknownAddress(_))
    ));
}

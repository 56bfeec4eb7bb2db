//! # Aggregation over HTTP
//!
//! Fleet documents served by a local mock server; partial failure must be
//! tolerated and total failure reported.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde_yml::Value;

use lib_unlock::checker::aggregator::ConfigAggregator;
use lib_unlock::checker::error::AggregateError;

const DOC1: &str = r#"
proxies:
  - { name: us-1, type: ss, server: 198.51.100.1, port: 8388, cipher: aes-256-gcm, password: a }
  - { name: jp-1, type: vmess, server: 198.51.100.2, port: 443, uuid: 11111111-2222-4333-8444-555555555555 }
proxy-groups:
  - { name: Proxy, type: select, proxies: [us-1, jp-1] }
rules:
  - MATCH,Proxy
dns:
  enable: true
"#;

const DOC3: &str = r#"
proxies:
  - { name: sg-1, type: trojan, server: 198.51.100.3, port: 443, password: c }
rules:
  - MATCH,DIRECT
"#;

fn mock_fleet() -> Router {
    Router::new()
        .route("/doc1.yaml", get(|| async { DOC1 }))
        .route(
            "/doc2.yaml",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
        )
        .route("/doc3.yaml", get(|| async { DOC3 }))
        .route("/garbage.yaml", get(|| async { "- just\n- a list\n" }))
}

#[tokio::test]
async fn failed_document_is_skipped_and_base_comes_from_first() {
    let addr = common::serve(mock_fleet()).await;
    let urls: Vec<String> = ["doc1", "doc2", "doc3"]
        .iter()
        .map(|d| format!("http://{}/{}.yaml", addr, d))
        .collect();

    let aggregator = ConfigAggregator::new(Duration::from_secs(5));
    let merged = aggregator.aggregate(&urls).await.unwrap();

    let names: Vec<&str> = merged.endpoints().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["us-1", "jp-1", "sg-1"]);
    assert_eq!(merged.sources_ok, 2);
    assert_eq!(merged.sources_failed, 1);

    let rules = merged.base().get("rules").and_then(Value::as_sequence).unwrap();
    assert_eq!(rules[0].as_str(), Some("MATCH,Proxy"));
    assert!(merged.base().contains_key("dns"));
    assert!(merged.base().contains_key("proxy-groups"));
}

#[tokio::test]
async fn non_mapping_document_is_skipped() {
    let addr = common::serve(mock_fleet()).await;
    let urls = vec![
        format!("http://{}/garbage.yaml", addr),
        format!("http://{}/doc3.yaml", addr),
    ];

    let merged = ConfigAggregator::new(Duration::from_secs(5))
        .aggregate(&urls)
        .await
        .unwrap();
    assert_eq!(merged.endpoints().len(), 1);
    assert_eq!(merged.endpoints()[0].name, "sg-1");
    let rules = merged.base().get("rules").and_then(Value::as_sequence).unwrap();
    assert_eq!(rules[0].as_str(), Some("MATCH,DIRECT"));
}

#[tokio::test]
async fn zero_usable_documents_is_fatal() {
    let addr = common::serve(mock_fleet()).await;
    let closed = common::closed_addr().await;
    let urls = vec![
        format!("http://{}/doc2.yaml", addr),
        format!("http://{}/missing.yaml", addr),
        format!("http://{}/doc1.yaml", closed),
    ];

    let err = ConfigAggregator::new(Duration::from_secs(5))
        .aggregate(&urls)
        .await
        .unwrap_err();
    assert!(matches!(err, AggregateError::NoConfigAvailable { attempted: 3 }));
}

#[tokio::test]
async fn slow_document_hits_the_fetch_timeout() {
    let app = Router::new().route(
        "/slow.yaml",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            DOC1
        }),
    );
    let addr = common::serve(app).await;

    let aggregator = ConfigAggregator::new(Duration::from_millis(300));
    let err = aggregator
        .fetch_document(&format!("http://{}/slow.yaml", addr))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("slow.yaml"));
}

//! Integration tests for the CLB client
//!
//! These tests require a reachable CLB endpoint and an existing load balancer.
//! Set CLB_API_URL, CLB_API_TOKEN, CLB_REGION and CLB_TEST_LB_ID to run.

use std::sync::Arc;

use clb_client::{ClbApi, ClbClient, ClbClientConfig, HttpClbApi, ListenerExtra};
use tokio_util::sync::CancellationToken;

fn api() -> HttpClbApi {
    let url = std::env::var("CLB_API_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let token = std::env::var("CLB_API_TOKEN").expect("CLB_API_TOKEN environment variable must be set");
    HttpClbApi::new(url, token).expect("Failed to create client")
}

fn region() -> String {
    std::env::var("CLB_REGION").unwrap_or_else(|_| "ap-guangzhou".to_string())
}

#[tokio::test]
#[ignore] // Requires a CLB endpoint
async fn test_describe_quota() {
    let quotas = api().describe_quota(&region()).await.expect("Failed to describe quota");
    println!("Found {} quota entries", quotas.len());
}

#[tokio::test]
#[ignore]
async fn test_listener_round_trip() {
    let lb_id = std::env::var("CLB_TEST_LB_ID").expect("CLB_TEST_LB_ID environment variable must be set");
    let region = region();
    let clb = ClbClient::new(Arc::new(api()), ClbClientConfig::default(), CancellationToken::new());

    let listener_id = clb
        .allocate_create_listener(&region, &lb_id, 65000, None, "UDP", &ListenerExtra::default())
        .await
        .expect("Failed to create listener");
    let found = clb
        .get_listener_by_port(&region, &lb_id, 65000, "UDP")
        .await
        .expect("Failed to describe listeners");
    assert_eq!(found.map(|l| l.listener_id), Some(listener_id.clone()));

    clb.delete_listener(&region, &lb_id, &listener_id)
        .await
        .expect("Failed to delete listener");
}

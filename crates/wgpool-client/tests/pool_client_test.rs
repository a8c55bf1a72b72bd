//! Pool client tests against a local pool server

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use wgpool_client::{KeyPool, KeyPoolClient, PoolClientConfig, PoolError, ReleaseOutcome};

const EXHAUSTED_SERVER: &str = "198.51.100.9";

async fn allocate(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let server_ip = params
        .get("ip")
        .cloned()
        .unwrap_or_else(|| "203.0.113.7".to_string());

    if server_ip == EXHAUSTED_SERVER {
        return Json(json!({ "success": false, "error": "No available keys" }));
    }

    Json(json!({
        "success": true,
        "server_ip": server_ip,
        "server_port": 51820,
        "server_pubkey": "SERVERKEY",
        "private_key": "PRIVATE",
        "public_key": "PKabc",
        "internal_ip": "10.8.0.21",
        "gateway": "10.8.0.1",
        "config": "[Interface]\nPrivateKey = PRIVATE\nDNS = 1.1.1.1\n"
    }))
}

async fn release(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    match body.get("public_key").and_then(Value::as_str) {
        Some("PKabc") => (StatusCode::OK, Json(json!({ "success": true }))),
        Some("PKgone") => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "Key not found" })),
        ),
        Some("PK404") => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "no such key" })),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "database unavailable" })),
        ),
    }
}

async fn status(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let total = if params.contains_key("ip") { 10 } else { 100 };
    Json(json!({
        "success": true,
        "statistics": {
            "total_keys": total,
            "keys_in_use": 3,
            "keys_available": total - 3
        },
        "active_connections": [{ "internal_ip": "10.8.0.21" }]
    }))
}

async fn list_bare() -> Json<Value> {
    Json(json!(["203.0.113.7", "203.0.113.8"]))
}

async fn list_envelope() -> Json<Value> {
    Json(json!({ "success": true, "servers": ["203.0.113.9"] }))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({ "success": true }))
}

/// Start a pool server on an ephemeral port and return its base URL
async fn spawn_pool_server(routes: Router) -> String {
    let app = Router::new().nest("/vpn_api", routes);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}/vpn_api", addr)
}

fn pool_routes() -> Router {
    Router::new()
        .route("/allocate", get(allocate))
        .route("/release", post(release))
        .route("/status", get(status))
        .route("/list", get(list_bare))
}

fn client_for(base_url: String) -> KeyPoolClient {
    KeyPoolClient::new(PoolClientConfig {
        base_url,
        timeout: Duration::from_millis(500),
    })
    .unwrap()
}

#[tokio::test]
async fn test_lease_success() {
    let client = client_for(spawn_pool_server(pool_routes()).await);

    let lease = client.lease(None).await.unwrap();
    assert_eq!(lease.endpoint_address, "203.0.113.7");
    assert_eq!(lease.endpoint_port, 51820);
    assert_eq!(lease.endpoint_public_key, "SERVERKEY");
    assert_eq!(lease.public_key, "PKabc");
    assert_eq!(lease.internal_address, "10.8.0.21");
    assert_eq!(lease.gateway.as_deref(), Some("10.8.0.1"));
}

#[tokio::test]
async fn test_lease_passes_endpoint_hint() {
    let client = client_for(spawn_pool_server(pool_routes()).await);

    let lease = client.lease(Some("203.0.113.44")).await.unwrap();
    assert_eq!(lease.endpoint_address, "203.0.113.44");
}

#[tokio::test]
async fn test_lease_rejected_envelope() {
    let client = client_for(spawn_pool_server(pool_routes()).await);

    match client.lease(Some(EXHAUSTED_SERVER)).await {
        Err(PoolError::Rejected(message)) => assert_eq!(message, "No available keys"),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_lease_timeout_is_distinct() {
    let client = client_for(spawn_pool_server(Router::new().route("/allocate", get(slow))).await);

    assert!(matches!(client.lease(None).await, Err(PoolError::Timeout)));
}

#[tokio::test]
async fn test_lease_unreachable_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(format!("http://{}/vpn_api", addr));
    assert!(matches!(
        client.lease(None).await,
        Err(PoolError::Transport(_))
    ));
}

#[tokio::test]
async fn test_release_outcomes() {
    let client = client_for(spawn_pool_server(pool_routes()).await);

    assert_eq!(
        client.release("PKabc").await.unwrap(),
        ReleaseOutcome::Released
    );
    assert_eq!(
        client.release("PKgone").await.unwrap(),
        ReleaseOutcome::NotLeased
    );
    assert_eq!(
        client.release("PK404").await.unwrap(),
        ReleaseOutcome::NotLeased
    );
    assert!(matches!(
        client.release("PKboom").await,
        Err(PoolError::Http { status: 500, .. })
    ));
}

#[tokio::test]
async fn test_status_reads_legacy_counters() {
    let client = client_for(spawn_pool_server(pool_routes()).await);

    let status = client.status(None).await.unwrap();
    assert_eq!(status.statistics.total, 100);
    assert_eq!(status.statistics.in_use, 3);
    assert_eq!(status.statistics.available, 97);
    assert_eq!(status.active_connections.len(), 1);

    let scoped = client.status(Some("203.0.113.7")).await.unwrap();
    assert_eq!(scoped.statistics.total, 10);
}

#[tokio::test]
async fn test_list_accepts_both_shapes() {
    let bare = client_for(spawn_pool_server(pool_routes()).await);
    assert_eq!(
        bare.list().await.unwrap(),
        vec!["203.0.113.7".to_string(), "203.0.113.8".to_string()]
    );

    let envelope =
        client_for(spawn_pool_server(Router::new().route("/list", get(list_envelope))).await);
    assert_eq!(envelope.list().await.unwrap(), vec!["203.0.113.9".to_string()]);
}

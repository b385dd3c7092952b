//! HttpTransport against a real HTTP server
//!
//! A small warp app stands in for the backend: it checks the bearer token,
//! serves `_changes` per partition and answers with configurable statuses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use warp::http::StatusCode;
use warp::Filter;

use fieldsync::protocol;
use fieldsync::transport::{SharedToken, StaticToken};
use fieldsync::{BearerAuth, HttpTransport, PartitionId, Transport, TransportError};

const TOKEN: &str = "field-token";

/// Serve the fake backend on an ephemeral port.
fn spawn_backend() -> SocketAddr {
    let changes = warp::path!("api" / "couchdb" / String / "_changes")
        .and(warp::get())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<HashMap<String, String>>())
        .map(|partition: String, auth: Option<String>, query: HashMap<String, String>| {
            let reply = |body: serde_json::Value, status: StatusCode| {
                warp::reply::with_status(warp::reply::json(&body), status)
            };
            if auth.as_deref() != Some(format!("Bearer {}", TOKEN).as_str()) {
                return reply(json!({"error": "unauthorized"}), StatusCode::UNAUTHORIZED);
            }
            match partition.as_str() {
                "db_ws_busy" => reply(json!({}), StatusCode::SERVICE_UNAVAILABLE),
                "db_ws_gone" => reply(json!({"error": "not_found"}), StatusCode::NOT_FOUND),
                _ => {
                    let since: u64 = query.get("since").and_then(|s| s.parse().ok()).unwrap_or(0);
                    reply(json!({"results": [], "last_seq": since}), StatusCode::OK)
                }
            }
        });

    let reference = warp::path!("api" / "master-data")
        .and(warp::get())
        .map(|| {
            warp::reply::json(&json!({
                "languages": [{"language_id": 1, "language_short": "en", "language_common": "English"}]
            }))
        });

    let (addr, server) = warp::serve(changes.or(reference)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn transport(addr: SocketAddr) -> HttpTransport {
    HttpTransport::new(format!("http://{}", addr), "/api/couchdb", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_changes_with_bearer_token() {
    let addr = spawn_backend();
    let client = BearerAuth::new(transport(addr), Arc::new(StaticToken::new(TOKEN)));
    let ws = PartitionId::for_tenant("db", "1").unwrap();

    let page = protocol::fetch_changes(&client, &ws, 42, 25).await.unwrap();
    assert!(page.results.is_empty());
    assert_eq!(page.last_seq, 42);
}

#[tokio::test]
async fn test_status_classification() {
    let addr = spawn_backend();
    let token = SharedToken::default();
    let client = BearerAuth::new(transport(addr), Arc::new(token.clone()));
    let ws = PartitionId::for_tenant("db", "1").unwrap();

    let err = protocol::fetch_changes(&client, &ws, 0, 25).await.unwrap_err();
    assert_eq!(err, TransportError::AuthRejected(401));

    // A rotated credential applies to the next request
    token.set(TOKEN);
    assert!(protocol::fetch_changes(&client, &ws, 0, 25).await.is_ok());

    let busy = PartitionId::new("db_ws_busy").unwrap();
    let err = protocol::fetch_changes(&client, &busy, 0, 25).await.unwrap_err();
    assert!(err.is_transient());

    let gone = PartitionId::new("db_ws_gone").unwrap();
    let err = protocol::fetch_changes(&client, &gone, 0, 25).await.unwrap_err();
    assert!(matches!(err, TransportError::Rejected { status: 404, .. }));
}

#[tokio::test]
async fn test_unscoped_reference_request() {
    let addr = spawn_backend();
    let client = transport(addr);
    let data = protocol::fetch_reference(&client, "/api/master-data").await.unwrap();
    assert_eq!(data["languages"][0]["language_short"], "en");
}

#[tokio::test]
async fn test_unreachable_backend_is_transient() {
    // Nothing listens on the discard port
    let client = HttpTransport::new("http://127.0.0.1:9", "/api/couchdb", Duration::from_millis(500)).unwrap();
    let ws = PartitionId::for_tenant("db", "1").unwrap();
    let err = client
        .send(fieldsync::transport::PeerRequest::get(&ws, protocol::CHANGES_PATH))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

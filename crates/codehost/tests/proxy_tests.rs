//! Data-plane proxy integration tests.
//!
//! Each test spins up tiny loopback backends and asserts that the proxy
//! resolves, rewrites and forwards against them.

use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

mod common;
use common::test_broker;

/// Spawn a backend that echoes what it received.
async fn spawn_backend(marker: &'static str) -> u16 {
    let app = Router::new().fallback(move |req: Request<Body>| async move {
        Json(json!({
            "backend": marker,
            "path": req.uri().path(),
            "query": req.uri().query(),
            "host": req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok()),
            "origin": req
                .headers()
                .get(header::ORIGIN)
                .and_then(|v| v.to_str().ok()),
            "cache_control": req
                .headers()
                .get(header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok()),
            "has_if_none_match": req.headers().contains_key(header::IF_NONE_MATCH),
        }))
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .body(Body::empty())
        .unwrap()
}

/// The session-creation endpoint must not be reachable through the proxy.
#[tokio::test]
async fn test_proxy_rejects_start_path() {
    let broker = test_broker().await;
    let proxy = broker.proxy_router(3000);

    let response = proxy.oneshot(get("/start")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Static-convention paths route to the static backend with no token at all.
#[tokio::test]
async fn test_static_path_bypasses_token() {
    let broker = test_broker().await;
    let static_port = spawn_backend("static").await;
    let proxy = broker.proxy_router(static_port);

    for path in ["/vendor/app.js", "/theme/app.css", "/_static/logo.png"] {
        let response = proxy.clone().oneshot(get(path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "path {path}");
        let json = json_body(response).await;
        assert_eq!(json["backend"], "static");
    }
}

/// An invalid token on a static path is still served.
#[tokio::test]
async fn test_static_path_ignores_bad_token() {
    let broker = test_broker().await;
    let static_port = spawn_backend("static").await;
    let proxy = broker.proxy_router(static_port);

    let response = proxy
        .oneshot(get("/vendor/app.js?token=garbage"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["backend"], "static");
}

/// A missing or invalid token on a session path is an authorization failure.
#[tokio::test]
async fn test_session_path_requires_valid_token() {
    let broker = test_broker().await;
    let proxy = broker.proxy_router(3000);

    let missing = proxy.clone().oneshot(get("/workbench")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let garbage = proxy
        .oneshot(get("/workbench?token=garbage"))
        .await
        .unwrap();
    assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);
}

/// A valid token with no live session is an authorization failure too.
#[tokio::test]
async fn test_token_without_session_unauthorized() {
    let broker = test_broker().await;
    let proxy = broker.proxy_router(3000);

    let token = broker.tokens.issue("ghost").unwrap();
    let response = proxy
        .oneshot(get(&format!("/workbench?token={token}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// An expired session is treated the same as no session.
#[tokio::test]
async fn test_expired_session_unauthorized() {
    let broker = test_broker().await;
    let proxy = broker.proxy_router(3000);

    broker
        .store
        .create_session("u1", "c1", 3001, Duration::ZERO)
        .await
        .unwrap();

    let token = broker.tokens.issue("u1").unwrap();
    let response = proxy
        .oneshot(get(&format!("/workbench?token={token}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// A valid token routes to the owning session's backend with rewritten
/// headers.
#[tokio::test]
async fn test_valid_token_routes_to_session_backend() {
    let broker = test_broker().await;
    let session_port = spawn_backend("session").await;
    let proxy = broker.proxy_router(3000);

    broker
        .store
        .create_session("u1", "c1", session_port, Duration::from_secs(900))
        .await
        .unwrap();
    let token = broker.tokens.issue("u1").unwrap();

    let request = Request::builder()
        .uri(format!("/workbench?token={token}"))
        .method(Method::GET)
        .header(header::IF_NONE_MATCH, "\"etag\"")
        .header(header::IF_MODIFIED_SINCE, "Mon, 01 Jan 2024 00:00:00 GMT")
        .body(Body::empty())
        .unwrap();

    let response = proxy.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["backend"], "session");
    assert_eq!(json["path"], "/workbench");

    // Conditional caching is stripped, cache disabled, origin rewritten.
    assert_eq!(json["has_if_none_match"], false);
    assert_eq!(json["cache_control"], "no-cache");
    let authority = format!("127.0.0.1:{session_port}");
    assert_eq!(json["host"], authority.as_str());
    assert_eq!(json["origin"], format!("http://{authority}").as_str());
}

/// The token is appended to the forwarded URL when the path carries none.
#[tokio::test]
async fn test_token_preserved_in_forwarded_query() {
    let broker = test_broker().await;
    let session_port = spawn_backend("session").await;
    let proxy = broker.proxy_router(3000);

    broker
        .store
        .create_session("u1", "c1", session_port, Duration::from_secs(900))
        .await
        .unwrap();
    let token = broker.tokens.issue("u1").unwrap();

    let response = proxy
        .oneshot(get(&format!("/workbench?token={token}")))
        .await
        .unwrap();
    let json = json_body(response).await;

    let query = json["query"].as_str().unwrap();
    assert!(query.contains("token="), "query was {query}");
    // Not duplicated either.
    assert_eq!(query.matches("token=").count(), 1);
}

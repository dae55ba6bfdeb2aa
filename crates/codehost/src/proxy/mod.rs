//! Token-routed data-plane proxy.
//!
//! Every inbound request resolves the caller's token to a session and is
//! rewritten to target that session's backend. Paths matching the
//! static-asset convention bypass the token check and go to the shared
//! static backend. The proxy never writes to the session store; liveness
//! extension belongs to the idle monitor and the admission path.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{
        FromRequestParts, State, WebSocketUpgrade,
        ws::{Message as ClientMessage, WebSocket},
    },
    http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as UpstreamMessage,
    tungstenite::client::IntoClientRequest,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::auth::TokenCodec;
use crate::store::SessionStore;

/// Data-plane settings.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Host the session backends listen on.
    pub target_host: String,
    /// Fixed port of the shared static-asset backend.
    pub static_asset_port: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            target_host: "localhost".to_string(),
            static_asset_port: 3000,
        }
    }
}

/// State shared across proxy requests.
#[derive(Clone)]
pub struct ProxyState {
    /// Session store, read-only from here.
    pub store: SessionStore,
    /// Token verifier.
    pub tokens: Arc<TokenCodec>,
    /// HTTP client for forwarding requests to backends.
    pub http_client: Client<HttpConnector, Body>,
    /// Proxy settings.
    pub settings: Arc<ProxySettings>,
}

impl ProxyState {
    /// Create new proxy state.
    pub fn new(store: SessionStore, tokens: Arc<TokenCodec>, settings: ProxySettings) -> Self {
        let http_client: Client<HttpConnector, Body> =
            Client::builder(TokioExecutor::new()).build_http();

        Self {
            store,
            tokens,
            http_client,
            settings: Arc::new(settings),
        }
    }
}

/// Create the data-plane router: one catch-all route.
pub fn create_router(state: ProxyState) -> Router {
    Router::new()
        .fallback(route_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Does this path match the static-asset convention?
pub fn is_static_path(path: &str) -> bool {
    path.starts_with("/_static")
        || path.starts_with("/stable-")
        || path.ends_with("/manifest.json")
        || path.ends_with(".css")
        || path.ends_with(".js")
}

/// Pull the `token` query parameter out of a query string.
fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" && !value.is_empty() {
            urlencoding::decode(value)
                .ok()
                .map(|decoded| decoded.into_owned())
        } else {
            None
        }
    })
}

fn query_has_token(query: &str) -> bool {
    query
        .split('&')
        .any(|pair| pair == "token" || pair.starts_with("token="))
}

/// Append the token to a path-and-query unless one is already present, so a
/// backend that re-derives identity from the URL still finds it.
fn append_token_if_missing(path_and_query: &str, token: &str) -> String {
    let encoded = urlencoding::encode(token);
    match path_and_query.split_once('?') {
        Some((_, query)) if query_has_token(query) => path_and_query.to_string(),
        Some((_, "")) => format!("{path_and_query}token={encoded}"),
        Some(_) => format!("{path_and_query}&token={encoded}"),
        None => format!("{path_and_query}?token={encoded}"),
    }
}

struct Target {
    port: u16,
    path_and_query: String,
}

fn unauthorized(message: &'static str) -> Response {
    (StatusCode::UNAUTHORIZED, message).into_response()
}

/// Resolve a request URI to a backend target, or produce the rejection.
async fn resolve_target(state: &ProxyState, uri: &Uri) -> Result<Target, Response> {
    let path = uri.path();
    let query = uri.query().unwrap_or("");
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.to_string());

    // Shared assets need no token.
    if is_static_path(path) {
        return Ok(Target {
            port: state.settings.static_asset_port,
            path_and_query,
        });
    }

    let Some(token) = token_from_query(query) else {
        return Err(unauthorized("Unauthorized: invalid or missing token"));
    };

    let user_id = match state.tokens.verify(&token) {
        Ok(user_id) => user_id,
        Err(err) => {
            debug!(error = %err, "token rejected");
            return Err(unauthorized("Unauthorized: invalid or missing token"));
        }
    };

    let session = match state.store.get_by_user(&user_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            debug!(user = %user_id, "no live session for token");
            return Err(unauthorized("Unauthorized: invalid or missing token"));
        }
        Err(err) => {
            error!(error = ?err, "session lookup failed");
            return Err(
                (StatusCode::INTERNAL_SERVER_ERROR, "session lookup failed").into_response(),
            );
        }
    };

    Ok(Target {
        port: session.port(),
        path_and_query: append_token_if_missing(&path_and_query, &token),
    })
}

fn is_websocket_handshake(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Route one inbound request or WebSocket handshake.
async fn route_request(State(state): State<ProxyState>, req: Request<Body>) -> Response {
    // The admission surface is not reachable through the data plane.
    if req.uri().path() == "/start" {
        return unauthorized("not available on this endpoint");
    }

    let target = match resolve_target(&state, req.uri()).await {
        Ok(target) => target,
        Err(rejection) => return rejection,
    };

    if is_websocket_handshake(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => proxy_websocket(state, upgrade, target).await,
            Err(rejection) => rejection.into_response(),
        }
    } else {
        proxy_http(state, req, target).await
    }
}

/// Forward a plain HTTP request to the resolved backend.
async fn proxy_http(state: ProxyState, mut req: Request<Body>, target: Target) -> Response {
    let authority = format!("{}:{}", state.settings.target_host, target.port);
    let uri_string = format!("http://{}{}", authority, target.path_and_query);

    let uri: Uri = match uri_string.parse() {
        Ok(uri) => uri,
        Err(err) => {
            error!(uri = %uri_string, error = %err, "invalid rewritten uri");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    debug!("proxying request to {uri}");
    *req.uri_mut() = uri;
    rewrite_headers(req.headers_mut(), &authority);

    match state.http_client.request(req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(err) => {
            warn!(authority = %authority, error = %err, "proxy request failed");
            if err.is_connect() {
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            } else {
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

/// Point caching and origin headers at the backend.
///
/// Conditional-caching headers are dropped so stale per-session UI assets
/// are never served from a shared cache. The backend does not know it sits
/// behind a proxy and may reject mismatched origins.
fn rewrite_headers(headers: &mut HeaderMap, authority: &str) {
    headers.remove(header::IF_MODIFIED_SINCE);
    headers.remove(header::IF_NONE_MATCH);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    if let Ok(host) = HeaderValue::from_str(authority) {
        headers.insert(header::HOST, host);
    }
    if let Ok(origin) = HeaderValue::from_str(&format!("http://{authority}")) {
        headers.insert(header::ORIGIN, origin);
    }
    if let Ok(referer) = HeaderValue::from_str(&format!("http://{authority}/")) {
        headers.insert(header::REFERER, referer);
    }
}

/// Bridge a WebSocket handshake to the resolved backend.
///
/// Only the handshake is authenticated; subsequent messages pass through
/// unmodified in both directions.
async fn proxy_websocket(state: ProxyState, upgrade: WebSocketUpgrade, target: Target) -> Response {
    let upstream_url = format!(
        "ws://{}:{}{}",
        state.settings.target_host, target.port, target.path_and_query
    );

    upgrade.on_upgrade(move |client| async move {
        if let Err(err) = bridge_websocket(client, &upstream_url).await {
            warn!(upstream = %upstream_url, error = ?err, "websocket proxy ended with error");
        }
    })
}

async fn bridge_websocket(client: WebSocket, upstream_url: &str) -> anyhow::Result<()> {
    debug!("connecting to upstream websocket at {upstream_url}");
    let request = upstream_url.into_client_request()?;
    let (upstream, _) = connect_async(request).await?;

    let (mut upstream_write, mut upstream_read) = upstream.split();
    let (mut client_write, mut client_read) = client.split();

    let client_to_upstream = async {
        while let Some(message) = client_read.next().await {
            let message = match message {
                Ok(ClientMessage::Text(text)) => UpstreamMessage::Text(text.to_string().into()),
                Ok(ClientMessage::Binary(data)) => UpstreamMessage::Binary(data),
                Ok(ClientMessage::Ping(data)) => UpstreamMessage::Ping(data),
                Ok(ClientMessage::Pong(data)) => UpstreamMessage::Pong(data),
                Ok(ClientMessage::Close(_)) | Err(_) => break,
            };
            if upstream_write.send(message).await.is_err() {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_read.next().await {
            let message = match message {
                Ok(UpstreamMessage::Text(text)) => ClientMessage::Text(text.to_string().into()),
                Ok(UpstreamMessage::Binary(data)) => ClientMessage::Binary(data),
                Ok(UpstreamMessage::Ping(data)) => ClientMessage::Ping(data),
                Ok(UpstreamMessage::Pong(data)) => ClientMessage::Pong(data),
                Ok(UpstreamMessage::Frame(_)) => continue,
                Ok(UpstreamMessage::Close(_)) | Err(_) => break,
            };
            if client_write.send(message).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    Ok(())
}

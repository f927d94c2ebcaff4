//! HTTP routes of the host.
//!
//! # Endpoints
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | `POST` | `/v1/auth/{mount}/login` | none |
//! | `GET` `POST` `PUT` `DELETE` | `/v1/auth/{mount}/config` | admin |
//! | `GET ?list=true`, `LIST` | `/v1/auth/{mount}/role` | admin |
//! | `GET` `POST` `PUT` `DELETE` | `/v1/auth/{mount}/role/{name}` | admin |
//! | `POST` | `/v1/auth/token/renew-self` | client token |
//! | `GET` | `/v1/auth/token/lookup-self` | client token |
//! | `GET` | `/health` | none |
//!
//! Admin and client tokens travel in `X-Vault-Token`. Validation failures
//! answer `400 {errors: [msg]}`; environment failures answer
//! `500 {errors: ["internal error"]}`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{HeaderMap, Method, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, warn};

use super::lease::{LeaseRecord, LeaseStore};
use crate::agent::client::TOKEN_HEADER;
use crate::backend::{self, Operation, ProxyBackend, Request};

/// Shared state of the host.
pub struct AppState {
    /// The proxy backend
    pub backend: ProxyBackend,
    /// Issued leases
    pub leases: Arc<LeaseStore>,
    /// Mount of the backend under `/v1/auth/`
    pub mount: String,
    /// Token guarding config and role endpoints; `None` disables them
    pub admin_token: Option<String>,
}

/// Build the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mount = state.mount.trim_matches('/').to_string();

    Router::new()
        .route("/health", get(health_handler))
        .route(&format!("/v1/auth/{mount}/login"), post(login_handler))
        .route(
            &format!("/v1/auth/{mount}/config"),
            get(read_config)
                .post(write_config)
                .put(write_config)
                .delete(delete_config),
        )
        .route(
            &format!("/v1/auth/{mount}/role"),
            get(list_roles).fallback(list_roles),
        )
        .route(
            &format!("/v1/auth/{mount}/role/{{name}}"),
            get(read_role)
                .post(write_role)
                .put(write_role)
                .delete(delete_role),
        )
        .route("/v1/auth/token/renew-self", post(renew_self))
        .route("/v1/auth/token/lookup-self", get(lookup_self))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Extractors ────────────────────────────────────────────────────────────

/// Peer address when the server was started with connect info.
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let addr = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|ConnectInfo(addr)| addr);
        Ok(Self(addr))
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    list: Option<String>,
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn errors(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "errors": [message.into()] }))).into_response()
}

fn internal_error(err: &crate::Error) -> Response {
    error!(error = %err, "Request failed");
    errors(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Translate a backend answer into HTTP.
fn backend_response(result: crate::Result<backend::Response>) -> Response {
    match result {
        Err(e) => internal_error(&e),
        Ok(backend::Response::Error(message)) => errors(StatusCode::BAD_REQUEST, message),
        Ok(backend::Response::NotFound) => {
            (StatusCode::NOT_FOUND, Json(json!({ "errors": [] }))).into_response()
        }
        Ok(backend::Response::Data(data)) => Json(json!({ "data": data })).into_response(),
        Ok(backend::Response::List(keys)) => Json(json!({ "data": { "keys": keys } })).into_response(),
        Ok(backend::Response::Written { warnings }) if warnings.is_empty() => {
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(backend::Response::Written { warnings }) => {
            Json(json!({ "warnings": warnings })).into_response()
        }
        Ok(backend::Response::Alias(alias)) => Json(json!({ "data": { "alias": alias } })).into_response(),
        Ok(backend::Response::Auth(auth)) => Json(json!({ "auth": auth })).into_response(),
    }
}

/// Request headers as `name → values`.
fn header_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

fn parse_body(body: &Bytes) -> Result<Value, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body)
        .map_err(|e| errors(StatusCode::BAD_REQUEST, format!("failed to parse JSON input: {e}")))
}

fn client_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Check `X-Vault-Token` against the admin token in constant time.
#[allow(clippy::result_large_err)]
fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    use subtle::ConstantTimeEq;

    let Some(admin_token) = &state.admin_token else {
        return Err(errors(
            StatusCode::SERVICE_UNAVAILABLE,
            "admin token not configured; config and role endpoints are disabled",
        ));
    };
    let matches = client_token(headers).is_some_and(|t| t.as_bytes().ct_eq(admin_token.as_bytes()).into());
    if matches {
        Ok(())
    } else {
        Err(errors(StatusCode::FORBIDDEN, "permission denied"))
    }
}

fn backend_request(
    operation: Operation,
    path: impl Into<String>,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Request {
    let req = Request::new(operation, path).with_headers(header_map(headers));
    match peer {
        Some(addr) => req.with_remote_addr(addr.to_string()),
        None => req,
    }
}

/// Resolve a client token to its live lease, honouring the lease's bound CIDRs.
#[allow(clippy::result_large_err)]
fn caller_lease(state: &AppState, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<LeaseRecord, Response> {
    let denied = || errors(StatusCode::FORBIDDEN, "permission denied");
    let record = client_token(headers)
        .and_then(|token| state.leases.get(token))
        .ok_or_else(denied)?;
    let cidrs = &record.auth.bound_cidrs;
    if !cidrs.is_empty() {
        let allowed = peer.is_some_and(|addr| backend::authorize::source_allowed(cidrs, &addr.to_string()));
        if !allowed {
            warn!(accessor = %record.accessor, "Token used from outside its bound CIDRs");
            return Err(denied());
        }
    }
    Ok(record)
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// `POST /v1/auth/{mount}/login`
async fn login_handler(
    State(state): State<Arc<AppState>>,
    PeerAddr(peer): PeerAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let data = match parse_body(&body) {
        Ok(data) => data,
        Err(resp) => return resp,
    };
    let req = backend_request(Operation::Update, "login", &headers, peer).with_data(data);
    match state.backend.handle_request(&req).await {
        Ok(backend::Response::Auth(auth)) => {
            let record = LeaseRecord::issue(*auth, &state.backend.settings());
            let secret = record.to_secret();
            state.leases.insert(record);
            Json(secret).into_response()
        }
        other => backend_response(other),
    }
}

/// `GET /v1/auth/{mount}/config`
async fn read_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin(&state, &headers) {
        return resp;
    }
    backend_response(
        state
            .backend
            .handle_request(&Request::new(Operation::Read, "config"))
            .await,
    )
}

/// Pick create or update through the backend's existence check.
async fn write_operation(state: &AppState, path: &str) -> crate::Result<Operation> {
    let lookup = Request::new(Operation::Read, path);
    Ok(if state.backend.exists(&lookup).await? {
        Operation::Update
    } else {
        Operation::Create
    })
}

/// `POST|PUT /v1/auth/{mount}/config`
async fn write_config(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(resp) = check_admin(&state, &headers) {
        return resp;
    }
    let data = match parse_body(&body) {
        Ok(data) => data,
        Err(resp) => return resp,
    };
    let operation = match write_operation(&state, "config").await {
        Ok(op) => op,
        Err(e) => return internal_error(&e),
    };
    let req = Request::new(operation, "config").with_data(data);
    backend_response(state.backend.handle_request(&req).await)
}

/// `DELETE /v1/auth/{mount}/config`
async fn delete_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin(&state, &headers) {
        return resp;
    }
    backend_response(
        state
            .backend
            .handle_request(&Request::new(Operation::Delete, "config"))
            .await,
    )
}

/// `GET /v1/auth/{mount}/role?list=true` or `LIST /v1/auth/{mount}/role`
async fn list_roles(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    let listing = method.as_str() == "LIST"
        || (method == Method::GET
            && query
                .list
                .as_deref()
                .is_some_and(|v| matches!(v, "true" | "1")));
    if !listing {
        return errors(StatusCode::METHOD_NOT_ALLOWED, "use LIST or GET with ?list=true");
    }
    if let Err(resp) = check_admin(&state, &headers) {
        return resp;
    }
    backend_response(
        state
            .backend
            .handle_request(&Request::new(Operation::List, "role"))
            .await,
    )
}

/// `GET /v1/auth/{mount}/role/{name}`
async fn read_role(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_admin(&state, &headers) {
        return resp;
    }
    let req = Request::new(Operation::Read, format!("role/{name}"));
    backend_response(state.backend.handle_request(&req).await)
}

/// `POST|PUT /v1/auth/{mount}/role/{name}`
async fn write_role(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = check_admin(&state, &headers) {
        return resp;
    }
    let data = match parse_body(&body) {
        Ok(data) => data,
        Err(resp) => return resp,
    };
    let path = format!("role/{name}");
    let operation = match write_operation(&state, &path).await {
        Ok(op) => op,
        Err(e) => return internal_error(&e),
    };
    let req = Request::new(operation, path).with_data(data);
    backend_response(state.backend.handle_request(&req).await)
}

/// `DELETE /v1/auth/{mount}/role/{name}`
async fn delete_role(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_admin(&state, &headers) {
        return resp;
    }
    let req = Request::new(Operation::Delete, format!("role/{name}"));
    backend_response(state.backend.handle_request(&req).await)
}

/// `POST /v1/auth/token/renew-self`
async fn renew_self(
    State(state): State<Arc<AppState>>,
    PeerAddr(peer): PeerAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let record = match caller_lease(&state, &headers, peer) {
        Ok(record) => record,
        Err(resp) => return resp,
    };
    let increment = match parse_body(&body) {
        Ok(data) => data.get("increment").and_then(Value::as_u64),
        Err(resp) => return resp,
    };

    let req = backend_request(Operation::Renew, "login", &headers, peer).with_auth(record.auth.clone());
    match state.backend.handle_request(&req).await {
        Ok(backend::Response::Auth(auth)) => {
            match state
                .leases
                .renew(&record.token, *auth, &state.backend.settings(), increment)
            {
                Some(renewed) => Json(renewed.to_secret()).into_response(),
                None => errors(StatusCode::FORBIDDEN, "permission denied"),
            }
        }
        other => backend_response(other),
    }
}

/// `GET /v1/auth/token/lookup-self`
async fn lookup_self(
    State(state): State<Arc<AppState>>,
    PeerAddr(peer): PeerAddr,
    headers: HeaderMap,
) -> Response {
    match caller_lease(&state, &headers, peer) {
        Ok(record) => Json(json!({ "data": record.lookup_data() })).into_response(),
        Err(resp) => resp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn header_map_keeps_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-req", HeaderValue::from_static("a"));
        headers.append("x-req", HeaderValue::from_static("b"));
        headers.insert("remote_user", HeaderValue::from_static("alice"));

        let map = header_map(&headers);

        assert_eq!(map["x-req"], vec!["a", "b"]);
        assert_eq!(map["remote_user"], vec!["alice"]);
    }

    #[test]
    fn empty_body_is_an_empty_object() {
        assert_eq!(parse_body(&Bytes::new()).unwrap(), json!({}));
        assert_eq!(parse_body(&Bytes::from_static(b" \n")).unwrap(), json!({}));
        assert!(parse_body(&Bytes::from_static(b"{nope")).is_err());
    }

    #[test]
    fn client_token_ignores_blank_values() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_token(&headers), None);
        headers.insert("x-vault-token", HeaderValue::from_static("  "));
        assert_eq!(client_token(&headers), None);
        headers.insert("x-vault-token", HeaderValue::from_static("pxa_x"));
        assert_eq!(client_token(&headers), Some("pxa_x"));
    }
}

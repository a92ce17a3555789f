//! HTTP surface
//!
//! One axum router serves the data plane (`/write`, `/query`, flux,
//! prometheus read) and the admin plane (`/health`, `/transfer/*`).
//! Errors render as `{"error": "..."}` JSON envelopes; basic auth is
//! enforced when proxy credentials are configured.

mod admin;
mod prom;

use crate::config::{decode_credential, ProxyConfig};
use crate::proxy::Proxy;
use crate::query::QueryRequest;
use crate::transfer::Transfer;
use crate::Error;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::io::Read as _;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub proxy: Arc<Proxy>,
    pub transfer: Arc<Transfer>,
    username: String,
    password: String,
    auth_required: bool,
    ping_auth_enabled: bool,
}

impl ApiState {
    pub fn new(cfg: &ProxyConfig, proxy: Arc<Proxy>, transfer: Arc<Transfer>) -> Self {
        Self {
            proxy,
            transfer,
            username: decode_credential(&cfg.username, cfg.auth_encrypt),
            password: decode_credential(&cfg.password, cfg.auth_encrypt),
            auth_required: cfg.auth_required(),
            ping_auth_enabled: cfg.ping_auth_enabled,
        }
    }
}

/// Build the HTTP router
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ping", get(ping).post(ping).head(ping))
        .route("/health", get(health))
        .route("/query", get(query).post(query))
        .route("/write", post(write))
        .route("/api/v2/query", post(query_flux))
        .route("/api/v1/prom/read", post(prom_read))
        .route("/transfer/rebalance", post(admin::rebalance))
        .route("/transfer/recovery", post(admin::recovery))
        .route("/transfer/resync", post(admin::resync))
        .route("/transfer/cleanup", post(admin::cleanup))
        .route(
            "/transfer/state",
            get(admin::transfer_state).post(admin::set_transfer_state),
        )
        .route("/transfer/stats", get(admin::transfer_stats))
        .with_state(state)
        .layer(cors)
}

/// JSON error envelope with an appropriate status
pub(crate) fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::EmptyQuery
        | Error::IllegalQl
        | Error::DatabaseNotFound
        | Error::DatabaseForbidden(_)
        | Error::GetMeasurement
        | Error::GetBucket
        | Error::InvalidCircleId(_)
        | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::BackendsUnavailable | Error::BackendUnavailable { .. } | Error::GetBackends => {
            StatusCode::BAD_GATEWAY
        }
        Error::UpstreamStatus { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

async fn ping(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Some(denied) = check_auth(&state, &headers, true) {
        return denied;
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn health(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let stats = params.get("stats") == "true";
    let circles = state.proxy.get_health(stats).await;
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "message": "ready for queries and writes",
        "resyncing": state.transfer.is_resyncing(),
        "circles": circles,
    }))
    .into_response()
}

async fn query(
    State(state): State<ApiState>,
    method: Method,
    headers: HeaderMap,
    params: RawParams,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let mut form = params.0;
    if is_form_urlencoded(&headers) {
        for (k, v) in parse_params(&body) {
            form.insert(k, v);
        }
    }
    let qr = QueryRequest {
        method: method.to_string(),
        form,
        origin_parallel: false,
        accept_gzip: accepts_gzip(&headers),
    };
    match state.proxy.query(&qr).await {
        Ok(result) => {
            body_response(result.status, &result.content_type, result.body, qr.accept_gzip)
        }
        Err(e) => error_response(&e),
    }
}

async fn write(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let db = params.get("db");
    if db.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "database is required"})),
        )
            .into_response();
    }
    let rp = params.get("rp");
    let precision = match params.get("precision") {
        "" => "ns",
        p => p,
    };

    let payload = if content_encoding_gzip(&headers) {
        let mut decoder = GzDecoder::new(&body[..]);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_err() {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "unable to decode gzip body"})),
            )
                .into_response();
        }
        out
    } else {
        body.to_vec()
    };

    state.proxy.write(&payload, db, rp, precision).await;
    StatusCode::NO_CONTENT.into_response()
}

#[derive(serde::Deserialize)]
struct FluxBody {
    query: String,
}

async fn query_flux(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*")
        .to_string();
    let flux_src = if content_type.starts_with("application/json") {
        match serde_json::from_slice::<FluxBody>(&body) {
            Ok(parsed) => parsed.query,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": e.to_string()})),
                )
                    .into_response()
            }
        }
    } else {
        String::from_utf8_lossy(&body).to_string()
    };
    match state
        .proxy
        .query_flux(&flux_src, body, &content_type, &accept)
        .await
    {
        Ok(result) => body_response(result.status, &result.content_type, result.body, false),
        Err(e) => error_response(&e),
    }
}

async fn prom_read(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let db = params.get("db");
    if db.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "database is required"})),
        )
            .into_response();
    }
    let metric = match prom::metric_from_read_request(&body) {
        Some(metric) => metric,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "can't get metric name"})),
            )
                .into_response()
        }
    };
    match state.proxy.read_prom(db, &metric, body).await {
        Ok(result) => body_response(result.status, &result.content_type, result.body, false),
        Err(e) => error_response(&e),
    }
}

/// Render a backend/merged body, re-encoding with gzip when accepted
fn body_response(status: u16, content_type: &str, body: Bytes, gzip: bool) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    if gzip {
        if let Ok(compressed) = gzip_bytes(&body) {
            return (
                status,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_ENCODING, "gzip".to_string()),
                ],
                compressed,
            )
                .into_response();
        }
    }
    (
        status,
        [(header::CONTENT_TYPE, content_type.to_string())],
        body,
    )
        .into_response()
}

fn gzip_bytes(body: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write as _;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false)
}

fn content_encoding_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

fn is_form_urlencoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Query-string parameters with percent decoding
pub(crate) struct RawParams(pub BTreeMap<String, String>);

impl RawParams {
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }
}

#[axum::async_trait]
impl<S: Send + Sync> axum::extract::FromRequestParts<S> for RawParams {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let raw = parts.uri.query().unwrap_or("");
        Ok(RawParams(parse_params(raw.as_bytes())))
    }
}

/// Parse `k=v&k2=v2` pairs with percent and `+` decoding
pub(crate) fn parse_params(raw: &[u8]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for pair in raw.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let mut halves = pair.splitn(2, |&b| b == b'=');
        let k = halves.next().unwrap_or_default();
        let v = halves.next().unwrap_or_default();
        out.insert(percent_decode(k), percent_decode(v));
    }
    out
}

fn percent_decode(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let pair = (
                    raw.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    raw.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                );
                if let (Some(h), Some(l)) = pair {
                    out.push((h * 16 + l) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Validate basic auth when configured. `is_ping` relaxes the check
/// unless `ping_auth_enabled` is set.
pub(crate) fn check_auth(state: &ApiState, headers: &HeaderMap, is_ping: bool) -> Option<Response> {
    if !state.auth_required || (is_ping && !state.ping_auth_enabled) {
        return None;
    }
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v).ok())
        .and_then(|v| String::from_utf8(v).ok())
        .map(|creds| creds == format!("{}:{}", state.username, state.password))
        .unwrap_or(false);
    if authorized {
        None
    } else {
        Some(
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "authentication failed"})),
            )
                .into_response(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_params_decodes_pairs() {
        let params = parse_params(b"q=show+measurements&db=my%2Fdb&pretty=true");
        assert_eq!(params["q"], "show measurements");
        assert_eq!(params["db"], "my/db");
        assert_eq!(params["pretty"], "true");
    }

    #[test]
    fn percent_decode_handles_truncated_escape() {
        assert_eq!(percent_decode(b"a%2"), "a%2");
        assert_eq!(percent_decode(b"a%zz"), "a%zz");
        assert_eq!(percent_decode(b"%41"), "A");
    }

    #[test]
    fn gzip_bytes_round_trip() {
        let body = b"{\"results\":[]}";
        let compressed = gzip_bytes(body).unwrap();
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, body.to_vec());
    }
}

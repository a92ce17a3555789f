//! Admin surface: transfer operations, state and progress
//!
//! The operation endpoints validate their arguments, set the transfer
//! parameters, then run the operation in the background and answer 202.
//! `/transfer/state` doubles as the peer-broadcast receiver.

use super::{check_auth, error_response, parse_params, ApiState, RawParams};
use crate::backend::Backend;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::error;

/// Merge URL and form parameters for an admin POST
fn admin_params(params: RawParams, headers: &HeaderMap, body: &Bytes) -> BTreeMap<String, String> {
    let mut merged = params.0;
    if super::is_form_urlencoded(headers) {
        for (k, v) in parse_params(body) {
            merged.insert(k, v);
        }
    }
    merged
}

fn bad_request(msg: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": msg})),
    )
        .into_response()
}

fn accepted(msg: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"message": msg})),
    )
        .into_response()
}

/// Comma-separated list parameter
fn list_param(params: &BTreeMap<String, String>, key: &str) -> Vec<String> {
    params
        .get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Apply optional worker/batch/tick overrides before an operation
fn set_basic_params(state: &ApiState, params: &BTreeMap<String, String>) {
    if let Some(worker) = params.get("worker").and_then(|v| v.parse().ok()) {
        state.transfer.worker.store(worker, Ordering::Release);
    }
    if let Some(batch) = params.get("batch").and_then(|v| v.parse().ok()) {
        state.transfer.batch.store(batch, Ordering::Release);
    }
    if let Some(tick) = params.get("tick").and_then(|v| v.parse().ok()) {
        state.transfer.tick.store(tick, Ordering::Release);
    }
}

/// Refuse to start an operation while another is moving data
fn check_idle(state: &ApiState) -> Option<Response> {
    if state.transfer.is_resyncing() {
        return Some(bad_request("proxy is resyncing"));
    }
    if state
        .transfer
        .circle_states()
        .iter()
        .any(|cs| cs.is_transferring())
    {
        return Some(bad_request("circle is transferring"));
    }
    None
}

pub async fn rebalance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let params = admin_params(params, &headers, &body);
    let circle_id = match params.get("circle_id").and_then(|v| v.parse().ok()) {
        Some(id) => id,
        None => return bad_request("circle_id is required"),
    };
    let cs = match state.transfer.circle_state(circle_id) {
        Ok(cs) => cs,
        Err(e) => return error_response(&e),
    };
    if let Some(busy) = check_idle(&state) {
        return busy;
    }
    let urls = list_param(&params, "backends");
    let sources: Vec<Arc<Backend>> = if urls.is_empty() {
        cs.backends().to_vec()
    } else {
        cs.backends()
            .iter()
            .filter(|be| urls.iter().any(|u| *u == be.url))
            .cloned()
            .collect()
    };
    if sources.is_empty() {
        return bad_request("invalid backends");
    }
    set_basic_params(&state, &params);
    let dbs = list_param(&params, "db");
    let tx = state.transfer.clone();
    tokio::spawn(async move {
        if let Err(e) = tx.rebalance(circle_id, sources, dbs).await {
            error!("rebalance error: {}", e);
        }
    });
    accepted("rebalance started")
}

pub async fn recovery(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let params = admin_params(params, &headers, &body);
    let from_circle_id: usize = match params.get("from_circle_id").and_then(|v| v.parse().ok()) {
        Some(id) => id,
        None => return bad_request("from_circle_id is required"),
    };
    let to_circle_id: usize = match params.get("to_circle_id").and_then(|v| v.parse().ok()) {
        Some(id) => id,
        None => return bad_request("to_circle_id is required"),
    };
    if from_circle_id == to_circle_id {
        return bad_request("from_circle_id and to_circle_id must differ");
    }
    for id in [from_circle_id, to_circle_id] {
        if let Err(e) = state.transfer.circle_state(id) {
            return error_response(&e);
        }
    }
    if let Some(busy) = check_idle(&state) {
        return busy;
    }
    set_basic_params(&state, &params);
    let backend_urls = list_param(&params, "backends");
    let dbs = list_param(&params, "db");
    let tx = state.transfer.clone();
    tokio::spawn(async move {
        if let Err(e) = tx
            .recovery(from_circle_id, to_circle_id, backend_urls, dbs)
            .await
        {
            error!("recovery error: {}", e);
        }
    });
    accepted("recovery started")
}

pub async fn resync(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let params = admin_params(params, &headers, &body);
    if let Some(busy) = check_idle(&state) {
        return busy;
    }
    set_basic_params(&state, &params);
    let dbs = list_param(&params, "db");
    let tx = state.transfer.clone();
    tokio::spawn(async move {
        if let Err(e) = tx.resync(dbs).await {
            error!("resync error: {}", e);
        }
    });
    accepted("resync started")
}

pub async fn cleanup(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let params = admin_params(params, &headers, &body);
    let circle_id = match params.get("circle_id").and_then(|v| v.parse().ok()) {
        Some(id) => id,
        None => return bad_request("circle_id is required"),
    };
    if let Err(e) = state.transfer.circle_state(circle_id) {
        return error_response(&e);
    }
    if let Some(busy) = check_idle(&state) {
        return busy;
    }
    set_basic_params(&state, &params);
    let tx = state.transfer.clone();
    tokio::spawn(async move {
        if let Err(e) = tx.cleanup(circle_id).await {
            error!("cleanup error: {}", e);
        }
    });
    accepted("cleanup started")
}

/// Current transferring/resyncing flags
pub async fn transfer_state(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let circles: Vec<serde_json::Value> = state
        .transfer
        .circle_states()
        .iter()
        .map(|cs| {
            serde_json::json!({
                "circle_id": cs.circle_id,
                "transferring": cs.is_transferring(),
            })
        })
        .collect();
    Json(serde_json::json!({
        "resyncing": state.transfer.is_resyncing(),
        "circles": circles,
    }))
    .into_response()
}

/// Peer-broadcast receiver: flip the advisory flags
pub async fn set_transfer_state(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let params = admin_params(params, &headers, &body);
    if let Some(resyncing) = params.get("resyncing").and_then(|v| v.parse().ok()) {
        state.transfer.set_resyncing(resyncing);
        return Json(serde_json::json!({"resyncing": resyncing})).into_response();
    }
    if let (Some(circle_id), Some(transferring)) = (
        params.get("circle_id").and_then(|v| v.parse::<usize>().ok()),
        params.get("transferring").and_then(|v| v.parse::<bool>().ok()),
    ) {
        return match state.transfer.circle_state(circle_id) {
            Ok(cs) => {
                cs.set_transferring(transferring);
                Json(serde_json::json!({
                    "circle_id": circle_id,
                    "transferring": transferring,
                }))
                .into_response()
            }
            Err(e) => error_response(&e),
        };
    }
    bad_request("resyncing or circle_id with transferring is required")
}

/// Per-backend progress counters for one circle
pub async fn transfer_stats(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: RawParams,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers, false) {
        return denied;
    }
    let circle_id = match params.get("circle_id").parse::<usize>() {
        Ok(id) => id,
        Err(_) => return bad_request("circle_id is required"),
    };
    match state.transfer.stats_json(circle_id) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(&e),
    }
}

//! Shared test harness: a mock upstream backend
//!
//! Serves just enough of the upstream HTTP surface for proxy tests:
//! `/ping`, `/query` with canned metadata answers, and `/write` capture.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Read as _;
use std::sync::Arc;

/// One captured `/write` request
#[derive(Debug, Clone)]
pub struct CapturedWrite {
    pub db: String,
    pub rp: String,
    pub lines: Vec<String>,
}

#[derive(Default)]
pub struct MockState {
    /// Measurements returned for `show measurements`
    pub measurements: Vec<String>,
    /// Retention policies returned for `show retention policies`
    pub retention_policies: Vec<String>,
    /// Tag keys for `show tag keys`
    pub tag_keys: Vec<String>,
    /// `(field, type)` pairs for `show field keys`
    pub field_keys: Vec<(String, String)>,
    /// Rows streamed for `select *`: `(time, tags/fields per column)`
    pub select_columns: Vec<String>,
    pub select_values: Vec<Vec<serde_json::Value>>,
    /// Captured writes
    pub writes: Mutex<Vec<CapturedWrite>>,
    /// Captured queries
    pub queries: Mutex<Vec<String>>,
}

/// A running mock backend
pub struct MockBackend {
    pub url: String,
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start(state: MockState) -> Self {
        let state = Arc::new(state);
        let app = Router::new()
            .route("/ping", get(ping).post(ping).head(ping))
            .route("/query", get(query).post(query))
            .route("/write", post(write))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    pub async fn with_measurements(measurements: &[&str]) -> Self {
        Self::start(MockState {
            measurements: measurements.iter().map(|s| s.to_string()).collect(),
            retention_policies: vec!["autogen".to_string()],
            ..Default::default()
        })
        .await
    }

    pub fn captured_lines(&self) -> Vec<String> {
        self.state
            .writes
            .lock()
            .iter()
            .flat_map(|w| w.lines.clone())
            .collect()
    }
}

async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn values_response(name: &str, columns: &[&str], values: Vec<Vec<serde_json::Value>>) -> String {
    json!({
        "results": [{
            "statement_id": 0,
            "series": if values.is_empty() { json!([]) } else {
                json!([{"name": name, "columns": columns, "values": values}])
            }
        }]
    })
    .to_string()
}

async fn query(
    State(state): State<Arc<MockState>>,
    Query(params): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let mut q = params.get("q").cloned().unwrap_or_default();
    if q.is_empty() {
        // form-encoded POST
        for pair in String::from_utf8_lossy(&body).split('&') {
            if let Some(value) = pair.strip_prefix("q=") {
                q = value.replace('+', " ").replace("%20", " ");
            }
        }
    }
    state.queries.lock().push(q.clone());
    let lq = q.to_ascii_lowercase();

    let body = if lq.starts_with("show measurements") {
        values_response(
            "measurements",
            &["name"],
            state.measurements.iter().map(|m| vec![json!(m)]).collect(),
        )
    } else if lq.starts_with("show retention policies") {
        values_response(
            "retention policies",
            &["name"],
            state
                .retention_policies
                .iter()
                .map(|rp| vec![json!(rp)])
                .collect(),
        )
    } else if lq.starts_with("show tag keys") {
        values_response(
            "cpu",
            &["tagKey"],
            state.tag_keys.iter().map(|k| vec![json!(k)]).collect(),
        )
    } else if lq.starts_with("show field keys") {
        values_response(
            "cpu",
            &["fieldKey", "fieldType"],
            state
                .field_keys
                .iter()
                .map(|(k, t)| vec![json!(k), json!(t)])
                .collect(),
        )
    } else if lq.starts_with("show databases") {
        values_response("databases", &["name"], vec![vec![json!("db")]])
    } else if lq.starts_with("select") {
        let columns: Vec<&str> = state.select_columns.iter().map(String::as_str).collect();
        let mut out = values_response("cpu", &columns, state.select_values.clone());
        out.push('\n');
        return (StatusCode::OK, out);
    } else {
        // create database / drop measurement / ddl
        json!({"results": [{"statement_id": 0}]}).to_string()
    };
    (StatusCode::OK, body)
}

async fn write(
    State(state): State<Arc<MockState>>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> StatusCode {
    let payload = if headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
    {
        let mut decoder = flate2::read::GzDecoder::new(&body[..]);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_err() {
            return StatusCode::BAD_REQUEST;
        }
        out
    } else {
        body.to_vec()
    };
    let lines = String::from_utf8_lossy(&payload)
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    state.writes.lock().push(CapturedWrite {
        db: params.get("db").cloned().unwrap_or_default(),
        rp: params.get("rp").cloned().unwrap_or_default(),
        lines,
    });
    StatusCode::NO_CONTENT
}

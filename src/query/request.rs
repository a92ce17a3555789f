//! Inbound query request and per-backend result types

use std::collections::BTreeMap;

/// Marker header set on parallel fan-out requests so backends can
/// short-circuit behaviors that must not re-enter the fleet.
pub const HEADER_QUERY_ORIGIN: &str = "X-Query-Origin";
pub const QUERY_PARALLEL: &str = "parallel";

/// A normalized `/query` request, cloneable per fan-out task.
///
/// Carries the form parameters (`q`, `db`, `epoch`, `pretty`, ...) and the
/// subset of request state the upstream cares about.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub method: String,
    pub form: BTreeMap<String, String>,
    /// Set on requests that are part of an all-backends fan-out
    pub origin_parallel: bool,
    /// Client sent `Accept-Encoding: gzip`; merged bodies re-encode
    pub accept_gzip: bool,
}

impl QueryRequest {
    pub fn new(method: &str, db: &str, q: &str, epoch: &str) -> Self {
        let mut form = BTreeMap::new();
        if !db.is_empty() {
            form.insert("db".to_string(), db.to_string());
        }
        if !q.is_empty() {
            form.insert("q".to_string(), q.to_string());
        }
        if !epoch.is_empty() {
            form.insert("epoch".to_string(), epoch.to_string());
        }
        Self {
            method: method.to_string(),
            form,
            origin_parallel: false,
            accept_gzip: false,
        }
    }

    pub fn get(&self, key: &str) -> &str {
        self.form.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.form.insert(key.to_string(), value.to_string());
    }

    pub fn del(&mut self, key: &str) {
        self.form.remove(key);
    }

    pub fn pretty(&self) -> bool {
        self.get("pretty") == "true"
    }
}

/// Response captured from one backend.
///
/// Bodies are held identity-encoded; the client-facing handler re-encodes
/// with gzip when the inbound request advertised `Accept-Encoding: gzip`.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub status: u16,
    pub body: bytes::Bytes,
    pub content_type: String,
}

//! Backend handle: per-upstream state and I/O primitives
//!
//! Each backend owns a pooled HTTP client, three dynamic flags (`active`,
//! `rewriting`, `write_only`), and a durable write buffer. Worker loops
//! probe health, flush batches on a timer, and drain the rewrite log.

mod buffer;

pub use buffer::{LinePoint, WriteBuffer};

use crate::config::{decode_credential, BackendConfig, ProxyConfig};
use crate::query::chunk::ChunkedResponse;
use crate::query::request::{QueryRequest, QueryResult, HEADER_QUERY_ORIGIN, QUERY_PARALLEL};
use crate::query::response::{series_from_response_bytes, Response};
use crate::{Error, Result};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// One upstream database instance
pub struct Backend {
    pub name: String,
    pub url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    buffer: WriteBuffer,
    active: AtomicBool,
    rewriting: AtomicBool,
    write_only: AtomicBool,
    transfer_in: AtomicBool,
    closed: AtomicBool,
    check_interval: u64,
    flush_time: u64,
    rewrite_interval: u64,
    rewrite_threads: usize,
}

impl Backend {
    pub fn new(bcfg: &BackendConfig, pcfg: &ProxyConfig) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(pcfg.conn_pool_size)
            .timeout(Duration::from_secs(pcfg.write_timeout))
            .build()?;
        let data_dir = std::path::Path::new(&pcfg.data_dir).join(&bcfg.name);
        let buffer = WriteBuffer::new(data_dir, pcfg.flush_size)?;
        Ok(Arc::new(Self {
            name: bcfg.name.clone(),
            url: bcfg.url.trim_end_matches('/').to_string(),
            username: decode_credential(&bcfg.username, bcfg.auth_encrypt),
            password: decode_credential(&bcfg.password, bcfg.auth_encrypt),
            client,
            buffer,
            active: AtomicBool::new(true),
            rewriting: AtomicBool::new(false),
            write_only: AtomicBool::new(bcfg.write_only),
            transfer_in: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            check_interval: pcfg.check_interval,
            flush_time: pcfg.flush_time,
            rewrite_interval: pcfg.rewrite_interval,
            rewrite_threads: pcfg.rewrite_threads,
        }))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_rewriting(&self) -> bool {
        self.rewriting.load(Ordering::Acquire)
    }

    pub fn is_write_only(&self) -> bool {
        self.write_only.load(Ordering::Acquire)
    }

    pub fn is_transfer_in(&self) -> bool {
        self.transfer_in.load(Ordering::Acquire)
    }

    pub fn set_transfer_in(&self, on: bool) {
        self.transfer_in.store(on, Ordering::Release);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Spawn the health, flush and rewrite worker loops
    pub fn start_workers(self: Arc<Self>) {
        let be = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(be.check_interval));
            loop {
                tick.tick().await;
                if be.closed.load(Ordering::Acquire) {
                    break;
                }
                let up = be.ping().await;
                if up != be.is_active() {
                    info!("backend {}({}) active: {}", be.name, be.url, up);
                }
                be.active.store(up, Ordering::Release);
            }
        });
        let be = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(be.flush_time));
            loop {
                tick.tick().await;
                if be.closed.load(Ordering::Acquire) {
                    break;
                }
                for (db, rp, payload) in be.buffer.drain() {
                    be.write_or_persist(&db, &rp, &payload).await;
                }
            }
        });
        let be = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(be.rewrite_interval));
            loop {
                tick.tick().await;
                if be.closed.load(Ordering::Acquire) {
                    break;
                }
                be.clone().rewrite_pass().await;
            }
        });
    }

    /// Probe `/ping`; any 2xx answer counts as alive
    pub async fn ping(&self) -> bool {
        let req = self.with_auth(self.client.get(format!("{}/ping", self.url)));
        matches!(req.send().await, Ok(rsp) if rsp.status().is_success())
    }

    /// Enqueue a normalized line on the durable buffer
    pub fn write_point(&self, point: &LinePoint) -> Option<(String, String, Vec<u8>)> {
        self.buffer.push(point)
    }

    /// Deliver a payload upstream, falling back to the rewrite log
    pub async fn write_or_persist(&self, db: &str, rp: &str, payload: &[u8]) {
        if let Err(e) = self.write(db, rp, payload).await {
            warn!(
                "write to backend failed: {}, url: {}, db: {}, rp: {}",
                e, self.url, db, rp
            );
            self.buffer.persist(db, rp, payload);
        }
    }

    /// POST a line-protocol payload to `/write`, gzip-compressed
    pub async fn write(&self, db: &str, rp: &str, payload: &[u8]) -> Result<()> {
        let mut url = format!("{}/write?db={}&precision=ns", self.url, urlencode(db));
        if !rp.is_empty() {
            url.push_str("&rp=");
            url.push_str(&urlencode(rp));
        }
        let body = gzip_compress(payload)?;
        let req = self
            .with_auth(self.client.post(url))
            .header(reqwest::header::CONTENT_ENCODING, "gzip")
            .body(body);
        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let reason = rsp.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                reason,
            });
        }
        Ok(())
    }

    /// Forward a `/query` request and capture the response
    pub async fn query(&self, qr: &QueryRequest) -> Result<QueryResult> {
        let url = format!("{}/query", self.url);
        let mut req = if qr.method.eq_ignore_ascii_case("GET") {
            self.client.get(url).query(&qr.form)
        } else {
            self.client.post(url).form(&qr.form)
        };
        req = self.with_auth(req);
        if qr.origin_parallel {
            req = req.header(HEADER_QUERY_ORIGIN, QUERY_PARALLEL);
        }
        let rsp = req.send().await?;
        let status = rsp.status();
        let content_type = rsp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = rsp.bytes().await?;
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                reason: String::from_utf8_lossy(&body).to_string(),
            });
        }
        Ok(QueryResult {
            status: status.as_u16(),
            body,
            content_type,
        })
    }

    /// Open a chunked bulk read over `/query`
    pub async fn query_chunk(
        &self,
        method: &str,
        db: &str,
        q: &str,
        epoch: &str,
        chunk_size: usize,
    ) -> Result<ChunkedResponse> {
        let mut qr = QueryRequest::new(method, db, q, epoch);
        qr.set("chunked", "true");
        qr.set("chunk_size", &chunk_size.to_string());
        let url = format!("{}/query", self.url);
        let mut req = if method.eq_ignore_ascii_case("GET") {
            self.client.get(url).query(&qr.form)
        } else {
            self.client.post(url).form(&qr.form)
        };
        req = self.with_auth(req);
        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let reason = rsp.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                reason,
            });
        }
        Ok(ChunkedResponse::new(rsp.bytes_stream().boxed()))
    }

    /// Forward a flux request to `/api/v2/query`
    pub async fn query_flux(
        &self,
        body: Bytes,
        content_type: &str,
        accept: &str,
    ) -> Result<QueryResult> {
        let req = self
            .with_auth(self.client.post(format!("{}/api/v2/query", self.url)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::ACCEPT, accept)
            .body(body);
        let rsp = req.send().await?;
        let status = rsp.status();
        let content_type = rsp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/csv")
            .to_string();
        let body = rsp.bytes().await?;
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                reason: String::from_utf8_lossy(&body).to_string(),
            });
        }
        Ok(QueryResult {
            status: status.as_u16(),
            body,
            content_type,
        })
    }

    /// Forward a prometheus remote-read request to `/api/v1/prom/read`
    pub async fn read_prom(&self, db: &str, body: Bytes) -> Result<QueryResult> {
        let req = self
            .with_auth(
                self.client
                    .post(format!("{}/api/v1/prom/read?db={}", self.url, urlencode(db))),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/x-protobuf")
            .header(reqwest::header::CONTENT_ENCODING, "snappy")
            .body(body);
        let rsp = req.send().await?;
        let status = rsp.status();
        let content_type = rsp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/x-protobuf")
            .to_string();
        let body = rsp.bytes().await?;
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                reason: String::from_utf8_lossy(&body).to_string(),
            });
        }
        Ok(QueryResult {
            status: status.as_u16(),
            body,
            content_type,
        })
    }

    /// First-column values of a `SHOW ...` statement
    async fn show_values(&self, db: &str, q: &str) -> Vec<String> {
        let qr = QueryRequest::new("GET", db, q, "");
        let result = match self.query(&qr).await {
            Ok(result) => result,
            Err(e) => {
                debug!("show query failed: {}, url: {}, q: {}", e, self.url, q);
                return Vec::new();
            }
        };
        let series = match series_from_response_bytes(&result.body) {
            Ok(series) => series,
            Err(_) => return Vec::new(),
        };
        let mut values = Vec::new();
        for row in series {
            for value in row.values {
                if let Some(first) = value.first().and_then(|v| v.as_str()) {
                    values.push(first.to_string());
                }
            }
        }
        values
    }

    pub async fn get_databases(&self) -> Vec<String> {
        self.show_values("", "show databases")
            .await
            .into_iter()
            .filter(|db| db != "_internal")
            .collect()
    }

    pub async fn get_measurements(&self, db: &str) -> Vec<String> {
        self.show_values(db, "show measurements").await
    }

    pub async fn get_retention_policies(&self, db: &str) -> Vec<String> {
        let q = format!(
            "show retention policies on \"{}\"",
            crate::lineproto::escape_identifier(db)
        );
        self.show_values("", &q).await
    }

    pub async fn get_tag_keys(&self, db: &str, rp: &str, meas: &str) -> Vec<String> {
        let q = format!(
            "show tag keys from \"{}\".\"{}\"",
            crate::lineproto::escape_identifier(rp),
            crate::lineproto::escape_identifier(meas)
        );
        self.show_values(db, &q).await
    }

    /// Field name → reported types, one entry per shard-reported type
    pub async fn get_field_keys(&self, db: &str, rp: &str, meas: &str) -> HashMap<String, Vec<String>> {
        let q = format!(
            "show field keys from \"{}\".\"{}\"",
            crate::lineproto::escape_identifier(rp),
            crate::lineproto::escape_identifier(meas)
        );
        let qr = QueryRequest::new("GET", db, &q, "");
        let mut fields: HashMap<String, Vec<String>> = HashMap::new();
        let result = match self.query(&qr).await {
            Ok(result) => result,
            Err(e) => {
                debug!("field keys query failed: {}, url: {}", e, self.url);
                return fields;
            }
        };
        if let Ok(series) = series_from_response_bytes(&result.body) {
            for row in series {
                for value in row.values {
                    if let (Some(key), Some(vtype)) = (
                        value.first().and_then(|v| v.as_str()),
                        value.get(1).and_then(|v| v.as_str()),
                    ) {
                        fields
                            .entry(key.to_string())
                            .or_default()
                            .push(vtype.to_string());
                    }
                }
            }
        }
        fields
    }

    pub async fn drop_measurement(&self, db: &str, meas: &str) -> Result<Response> {
        let q = format!(
            "drop measurement \"{}\"",
            crate::lineproto::escape_identifier(meas)
        );
        let qr = QueryRequest::new("POST", db, &q, "");
        let result = self.query(&qr).await?;
        Ok(Response::from_bytes(&result.body)?)
    }

    /// Health summary; `stats` adds the in-memory backlog
    pub async fn health(&self, stats: bool) -> serde_json::Value {
        let mut health = serde_json::json!({
            "name": self.name,
            "url": self.url,
            "active": self.is_active(),
            "rewriting": self.is_rewriting(),
            "write_only": self.is_write_only(),
        });
        if stats {
            health["backlog"] = serde_json::json!(self.buffer.backlog());
        }
        health
    }

    /// One pass over the rewrite log, bounded by `rewrite_threads`
    async fn rewrite_pass(self: Arc<Self>) {
        if !self.is_active() {
            return;
        }
        let files = self.buffer.rewrite_files();
        if files.is_empty() {
            return;
        }
        self.rewriting.store(true, Ordering::Release);
        let sem = Arc::new(Semaphore::new(self.rewrite_threads));
        let mut tasks = Vec::with_capacity(files.len());
        for (db, rp, path) in files {
            let be = self.clone();
            let sem = sem.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire().await;
                let payload = match std::fs::read(&path) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("rewrite log read failed: {}, path: {}", e, path.display());
                        return;
                    }
                };
                match be.write(&db, &rp, &payload).await {
                    Ok(()) => {
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!("rewrite log remove failed: {}, path: {}", e, path.display());
                        } else {
                            info!(
                                "rewrite done, url: {}, db: {}, rp: {}, bytes: {}",
                                be.url,
                                db,
                                rp,
                                payload.len()
                            );
                        }
                    }
                    Err(e) => {
                        warn!("rewrite failed: {}, url: {}, db: {}, rp: {}", e, be.url, db, rp);
                    }
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        self.rewriting.store(false, Ordering::Release);
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() && self.password.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }
}

fn gzip_compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

//! Proxy front-end
//!
//! Owns the circles, the compiled shard template and the database
//! allow-list. Entry points classify queries, route writes to every
//! replica's durable buffer, and delegate reads to the executor.

use crate::backend::{Backend, LinePoint};
use crate::config::{ProxyConfig, SHARD_KEY_VAR_DB, SHARD_KEY_VAR_MM};
use crate::lineproto;
use crate::query::executor;
use crate::query::flux;
use crate::query::tokens;
use crate::query::{QueryRequest, QueryResult};
use crate::sharding::{Circle, ShardTemplate};
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

pub struct Proxy {
    circles: Vec<Arc<Circle>>,
    db_set: HashSet<String>,
    stpl: ShardTemplate,
}

impl Proxy {
    pub fn new(cfg: &ProxyConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.data_dir)?;
        let mut circles = Vec::with_capacity(cfg.circles.len());
        for (idx, circfg) in cfg.circles.iter().enumerate() {
            circles.push(Arc::new(Circle::new(circfg, cfg, idx)?));
        }
        if circles.is_empty() {
            return Err(Error::EmptyCircles);
        }
        Ok(Arc::new(Self {
            circles,
            db_set: cfg.db_list.iter().cloned().collect(),
            stpl: ShardTemplate::compile(&cfg.shard_key, &[SHARD_KEY_VAR_DB, SHARD_KEY_VAR_MM]),
        }))
    }

    /// Spawn the per-backend health/flush/rewrite workers
    pub fn start_workers(&self) {
        for be in self.get_all_backends() {
            be.start_workers();
        }
    }

    /// Render the shard key for a routing tuple
    pub fn get_key(&self, db: &str, mm: &str) -> String {
        self.stpl.render(&[db, mm])
    }

    pub fn circles(&self) -> &[Arc<Circle>] {
        &self.circles
    }

    pub fn circle(&self, id: usize) -> Result<&Arc<Circle>> {
        self.circles.get(id).ok_or(Error::InvalidCircleId(id))
    }

    /// The replica set for a key: one backend per circle
    pub fn get_backends(&self, key: &str) -> Vec<Arc<Backend>> {
        self.circles.iter().map(|c| c.get_backend(key)).collect()
    }

    /// Union of all backends, circle-major order
    pub fn get_all_backends(&self) -> Vec<Arc<Backend>> {
        self.circles
            .iter()
            .flat_map(|c| c.backends().iter().cloned())
            .collect()
    }

    pub fn is_forbidden_db(&self, db: &str) -> bool {
        !self.db_set.is_empty() && !self.db_set.contains(db)
    }

    /// Per-circle health, gathered concurrently
    pub async fn get_health(&self, stats: bool) -> Vec<serde_json::Value> {
        let tasks: Vec<_> = self
            .circles
            .iter()
            .map(|c| {
                let c = c.clone();
                tokio::spawn(async move { c.get_health(stats).await })
            })
            .collect();
        let mut health = Vec::with_capacity(tasks.len());
        for task in tasks {
            health.push(task.await.unwrap_or(serde_json::Value::Null));
        }
        health
    }

    /// Classify and dispatch an InfluxQL request
    pub async fn query(&self, qr: &QueryRequest) -> Result<QueryResult> {
        let q = qr.get("q").trim().to_string();
        if q.is_empty() {
            return Err(Error::EmptyQuery);
        }
        let tokens = tokens::tokenize(&q).ok_or(Error::IllegalQl)?;
        if tokens.is_empty() {
            return Err(Error::IllegalQl);
        }

        let (checked, show_db, alter_db, mut db) = tokens::check_database_from_tokens(&tokens);
        if !checked {
            db = tokens::get_database_from_tokens(&tokens);
            if db.is_empty() {
                db = qr.get("db").to_string();
            }
        }
        if !show_db {
            if db.is_empty() {
                return Err(Error::DatabaseNotFound);
            }
            if self.is_forbidden_db(&db) {
                return Err(Error::DatabaseForbidden(db));
            }
        }

        let select_or_show = tokens::check_select_or_show(&tokens);
        let from = tokens::check_from(&tokens);
        if select_or_show && from {
            executor::query_from_ql(self, qr, &tokens, &db).await
        } else if select_or_show {
            executor::query_show_ql(self, qr.clone(), &tokens).await
        } else if tokens::check_delete_or_drop_measurement(&tokens) {
            executor::query_delete_or_drop_ql(self, qr, &tokens, &db).await
        } else if alter_db || tokens::check_retention_policy(&tokens) {
            executor::query_alter_ql(self, qr).await
        } else {
            Err(Error::IllegalQl)
        }
    }

    /// Route a flux request by `(bucket, measurement)`
    pub async fn query_flux(
        &self,
        flux_src: &str,
        body: bytes::Bytes,
        content_type: &str,
        accept: &str,
    ) -> Result<QueryResult> {
        let (bucket, measurement) = flux::scan_query(flux_src);
        if bucket.is_empty() {
            return Err(Error::GetBucket);
        }
        if self.is_forbidden_db(&bucket) {
            return Err(Error::DatabaseForbidden(bucket));
        }
        if measurement.is_empty() {
            return Err(Error::GetMeasurement);
        }
        let key = self.get_key(&bucket, &measurement);
        let mut last_err: Option<Error> = None;
        for be in pick_order(self, &key) {
            match be.query_flux(body.clone(), content_type, accept).await {
                Ok(result) => return Ok(result),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::BackendsUnavailable))
    }

    /// Route a prometheus remote-read by `(db, metric)`
    pub async fn read_prom(
        &self,
        db: &str,
        metric: &str,
        body: bytes::Bytes,
    ) -> Result<QueryResult> {
        if self.is_forbidden_db(db) {
            return Err(Error::DatabaseForbidden(db.to_string()));
        }
        let key = self.get_key(db, metric);
        let mut last_err: Option<Error> = None;
        for be in pick_order(self, &key) {
            match be.read_prom(db, body.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::BackendsUnavailable))
    }

    /// Split a payload into records and replicate each across circles.
    ///
    /// Comments and blank lines are dropped, timestamps normalized to
    /// nanoseconds. Per-backend failures are logged and swallowed;
    /// durability comes from the local buffer, not delivery.
    pub async fn write(&self, payload: &[u8], db: &str, rp: &str, precision: &str) {
        let mut pos = 0;
        while pos < payload.len() {
            let (next, block) = lineproto::scan_line(payload, pos);
            pos = next + 1;
            if block.is_empty() {
                continue;
            }
            let start = lineproto::skip_whitespace(block, 0);
            if start >= block.len() || block[start] == b'#' {
                continue;
            }
            let mut line = &block[start..];
            if line.ends_with(b"\n") {
                line = &line[..line.len() - 1];
            }
            self.write_row(line, db, rp, precision).await;
        }
    }

    async fn write_row(&self, line: &[u8], db: &str, rp: &str, precision: &str) {
        let nano_line = lineproto::append_nano(line, precision);
        let mm = match lineproto::scan_key(&nano_line) {
            Ok(mm) => mm,
            Err(e) => {
                warn!("scan key error: {}", e);
                return;
            }
        };
        if !lineproto::rapid_check(&nano_line[mm_end(&nano_line, &mm)..]) {
            warn!(
                "invalid format, db: {}, rp: {}, precision: {}, line: {}",
                db,
                rp,
                precision,
                String::from_utf8_lossy(line)
            );
            return;
        }

        let key = self.get_key(db, &mm);
        let backends = self.get_backends(&key);
        if backends.is_empty() {
            warn!("write data error: can't get backends, db: {}, mm: {}", db, mm);
            return;
        }

        let point = LinePoint {
            db: db.to_string(),
            rp: rp.to_string(),
            line: nano_line,
        };
        for be in backends {
            if let Some((db, rp, payload)) = be.write_point(&point) {
                let be = be.clone();
                tokio::spawn(async move {
                    be.write_or_persist(&db, &rp, &payload).await;
                });
            }
        }
    }

    pub fn close(&self) {
        for c in &self.circles {
            c.close();
        }
    }
}

/// Replica candidates in dispatch order: healthy non-draining replicas
/// in random circle order, then the degraded fallbacks.
pub(crate) fn pick_order(ip: &Proxy, key: &str) -> Vec<Arc<Backend>> {
    use rand::seq::SliceRandom;
    let mut perms: Vec<usize> = (0..ip.circles().len()).collect();
    perms.shuffle(&mut rand::thread_rng());
    let mut order = Vec::with_capacity(ip.circles().len());
    for p in perms {
        let be = ip.circles()[p].get_backend(key);
        if be.is_active() && !be.is_rewriting() && !be.is_write_only() {
            order.push(be);
        }
    }
    for be in ip.get_backends(key) {
        if be.is_active() && (be.is_rewriting() || be.is_write_only()) {
            order.push(be);
        }
    }
    order
}

/// Byte length of the measurement prefix, accounting for escapes
fn mm_end(line: &[u8], mm: &str) -> usize {
    // the unescaped name is never longer than its escaped form
    let mut consumed = 0;
    let mut produced = 0;
    while consumed < line.len() && produced < mm.len() {
        if line[consumed] == b'\\' && consumed + 1 < line.len() {
            consumed += 2;
        } else {
            consumed += 1;
        }
        produced += 1;
    }
    consumed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, CircleConfig};

    fn proxy_with(circles: usize, backends_per: usize, shard_key: &str) -> Arc<Proxy> {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ProxyConfig {
            circles: (0..circles)
                .map(|c| CircleConfig {
                    name: format!("circle-{}", c + 1),
                    backends: (0..backends_per)
                        .map(|b| BackendConfig {
                            name: format!("influxdb-{}-{}", c + 1, b + 1),
                            url: format!("http://127.0.0.1:{}", 8086 + c * 10 + b),
                            ..Default::default()
                        })
                        .collect(),
                })
                .collect(),
            shard_key: shard_key.to_string(),
            data_dir: dir.path().to_str().unwrap().to_string(),
            ..Default::default()
        };
        Proxy::new(&cfg).unwrap()
    }

    #[test]
    fn get_key_renders_shard_template() {
        let ip = proxy_with(1, 1, "%db,%mm");
        assert_eq!(ip.get_key("metrics", "cpu"), "metrics,cpu");
        let ip = proxy_with(1, 1, "shard-%mm-%db-%mm-%db-key");
        assert_eq!(ip.get_key("d", "m"), "shard-m-d-m-d-key");
    }

    #[test]
    fn get_backends_returns_one_per_circle() {
        let ip = proxy_with(3, 2, "%db,%mm");
        let backends = ip.get_backends("metrics,cpu");
        assert_eq!(backends.len(), 3);
        let names: HashSet<&str> = backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names.len(), 3, "one backend from each circle");
    }

    #[test]
    fn get_all_backends_is_circle_major() {
        let ip = proxy_with(2, 2, "%db,%mm");
        let names: Vec<String> = ip
            .get_all_backends()
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(
            names,
            vec!["influxdb-1-1", "influxdb-1-2", "influxdb-2-1", "influxdb-2-2"]
        );
    }

    #[test]
    fn forbidden_db_only_when_list_configured() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ProxyConfig {
            circles: vec![CircleConfig {
                name: "circle-1".to_string(),
                backends: vec![BackendConfig {
                    name: "influxdb-1-1".to_string(),
                    url: "http://127.0.0.1:8086".to_string(),
                    ..Default::default()
                }],
            }],
            db_list: vec!["allowed".to_string()],
            data_dir: dir.path().to_str().unwrap().to_string(),
            ..Default::default()
        };
        let ip = Proxy::new(&cfg).unwrap();
        assert!(!ip.is_forbidden_db("allowed"));
        assert!(ip.is_forbidden_db("other"));

        let ip = proxy_with(1, 1, "%db,%mm");
        assert!(!ip.is_forbidden_db("anything"));
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let ip = proxy_with(1, 1, "%db,%mm");
        let qr = QueryRequest::new("GET", "db", "  ", "");
        assert!(matches!(ip.query(&qr).await, Err(Error::EmptyQuery)));
    }

    #[tokio::test]
    async fn query_without_database_is_rejected() {
        let ip = proxy_with(1, 1, "%db,%mm");
        let qr = QueryRequest::new("GET", "", "select * from cpu", "");
        assert!(matches!(ip.query(&qr).await, Err(Error::DatabaseNotFound)));
    }

    #[tokio::test]
    async fn forbidden_database_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ProxyConfig {
            circles: vec![CircleConfig {
                name: "circle-1".to_string(),
                backends: vec![BackendConfig {
                    name: "influxdb-1-1".to_string(),
                    url: "http://127.0.0.1:8086".to_string(),
                    ..Default::default()
                }],
            }],
            db_list: vec!["allowed".to_string()],
            data_dir: dir.path().to_str().unwrap().to_string(),
            ..Default::default()
        };
        let ip = Proxy::new(&cfg).unwrap();
        let qr = QueryRequest::new("GET", "secret", "select * from cpu", "");
        assert!(matches!(
            ip.query(&qr).await,
            Err(Error::DatabaseForbidden(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_statement_is_illegal() {
        let ip = proxy_with(1, 1, "%db,%mm");
        let qr = QueryRequest::new("POST", "db", "kill query 1", "");
        assert!(matches!(ip.query(&qr).await, Err(Error::IllegalQl)));
    }

    #[tokio::test]
    async fn flux_without_bucket_is_rejected() {
        let ip = proxy_with(1, 1, "%db,%mm");
        let err = ip
            .query_flux("buckets()", bytes::Bytes::new(), "application/json", "*/*")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GetBucket));
    }
}

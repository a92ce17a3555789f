//! Bulk data movement between backends
//!
//! Rebalance, recovery, resync and cleanup share one skeleton: discover
//! databases, broadcast the advisory transfer flag to peer proxies,
//! enumerate `(backend, db, measurement)` triples under a bounded worker
//! pool, and stream the measurements that must move as line protocol to
//! their destinations. Progress is tracked per source backend; per-op
//! logs roll under `tlog_dir`.

mod state;

pub use state::{CircleState, Stats};

use crate::backend::Backend;
use crate::config::ProxyConfig;
use crate::lineproto::{escape_identifier, escape_measurement, escape_tag, escape_string_field};
use crate::proxy::Proxy;
use crate::query::executor::query_in_parallel;
use crate::query::QueryRequest;
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::info;

/// Implicit cast order of the upstream engine for multi-typed fields
const FIELD_TYPES: [&str; 4] = ["float", "integer", "string", "boolean"];
const RETRY_COUNT: usize = 10;
const RETRY_INTERVAL: u64 = 15;
pub const DEFAULT_WORKER: usize = 5;
pub const DEFAULT_BATCH: usize = 20000;
pub const DEFAULT_TICK: i64 = 0;

/// Per-operation rolling log under `tlog_dir`, mirrored to tracing
struct TransferLog {
    appender: Mutex<Option<tracing_appender::rolling::RollingFileAppender>>,
    dir: String,
}

impl TransferLog {
    fn new(dir: &str) -> Self {
        Self {
            appender: Mutex::new(None),
            dir: dir.to_string(),
        }
    }

    fn set_output(&self, name: &str) {
        let _ = std::fs::create_dir_all(&self.dir);
        let appender = tracing_appender::rolling::daily(&self.dir, name);
        *self.appender.lock() = Some(appender);
    }

    fn log(&self, msg: String) {
        info!(target: "transfer", "{}", msg);
        if let Some(appender) = self.appender.lock().as_mut() {
            let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ");
            let _ = writeln!(appender, "{} {}", now, msg);
        }
    }
}

/// What to do with one `(backend, db, measurement)` triple
enum Decision {
    /// Stream the measurement to these destinations
    Move(Vec<Arc<Backend>>),
    /// Drop the measurement on the source, no copy
    Drop,
    /// Data already lives where it belongs
    InPlace,
}

pub struct Transfer {
    proxy: Arc<Proxy>,
    circle_states: Vec<Arc<CircleState>>,
    tlog: Arc<TransferLog>,
    client: reqwest::Client,
    username: String,
    password: String,
    https_enabled: bool,
    ha_addrs: Vec<String>,
    pub worker: AtomicUsize,
    pub batch: AtomicUsize,
    pub tick: AtomicI64,
    resyncing: AtomicBool,
}

impl Transfer {
    pub fn new(cfg: &ProxyConfig, proxy: Arc<Proxy>) -> Result<Arc<Self>> {
        let circle_states = proxy
            .circles()
            .iter()
            .map(|c| Arc::new(CircleState::new(c.id, c.clone())))
            .collect();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Arc::new(Self {
            proxy,
            circle_states,
            tlog: Arc::new(TransferLog::new(&cfg.tlog_dir)),
            client,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            https_enabled: cfg.https_enabled,
            ha_addrs: cfg.ha_addrs.clone(),
            worker: AtomicUsize::new(DEFAULT_WORKER),
            batch: AtomicUsize::new(DEFAULT_BATCH),
            tick: AtomicI64::new(DEFAULT_TICK),
            resyncing: AtomicBool::new(false),
        }))
    }

    pub fn circle_states(&self) -> &[Arc<CircleState>] {
        &self.circle_states
    }

    pub fn circle_state(&self, id: usize) -> Result<&Arc<CircleState>> {
        self.circle_states.get(id).ok_or(Error::InvalidCircleId(id))
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing.load(Ordering::Acquire)
    }

    pub fn set_resyncing(&self, on: bool) {
        self.resyncing.store(on, Ordering::Release);
    }

    fn reset_circle_states(&self) {
        for cs in &self.circle_states {
            cs.reset_states();
        }
    }

    fn reset_basic_params(&self) {
        self.worker.store(DEFAULT_WORKER, Ordering::Release);
        self.batch.store(DEFAULT_BATCH, Ordering::Release);
        self.tick.store(DEFAULT_TICK, Ordering::Release);
    }

    /// Union of databases across all active backends
    async fn get_databases(&self) -> Vec<String> {
        let mut dbs = Vec::new();
        let mut seen = HashSet::new();
        for cs in &self.circle_states {
            for be in cs.backends() {
                if be.is_active() {
                    for db in be.get_databases().await {
                        if seen.insert(db.clone()) {
                            dbs.push(db);
                        }
                    }
                }
            }
        }
        dbs
    }

    /// Union of retention policies for a database across active backends
    async fn get_retention_policies(&self, db: &str) -> Vec<String> {
        let mut rps = Vec::new();
        let mut seen = HashSet::new();
        for cs in &self.circle_states {
            for be in cs.backends() {
                if be.is_active() {
                    for rp in be.get_retention_policies(db).await {
                        if seen.insert(rp.clone()) {
                            rps.push(rp);
                        }
                    }
                }
            }
        }
        rps
    }

    /// Idempotently create the databases and their retention policies on
    /// every backend before moving data into them.
    async fn create_databases(&self, dbs: Vec<String>) -> Result<Vec<String>> {
        let dbs = if dbs.is_empty() {
            self.get_databases().await
        } else {
            dbs
        };
        if dbs.is_empty() {
            self.tlog.log("databases are empty in all backends".to_string());
            return Ok(dbs);
        }
        let backends: Vec<Arc<Backend>> = self
            .circle_states
            .iter()
            .flat_map(|cs| cs.backends().iter().cloned())
            .collect();
        for db in &dbs {
            let q = format!("create database \"{}\"", escape_identifier(db));
            let qr = QueryRequest::new("POST", "", &q, "");
            if let Err(e) = query_in_parallel(&backends, &qr).await {
                self.tlog
                    .log(format!("create databases error: {}, db: {}, dbs: {:?}", e, db, dbs));
                return Err(e);
            }
            let rps = self.get_retention_policies(db).await;
            self.tlog
                .log(format!("create retention policy, db: {}, rps: {:?}", db, rps));
            for rp in rps {
                let q = format!(
                    "create retention policy \"{}\" on \"{}\" duration 0s replication 1",
                    escape_identifier(&rp),
                    escape_identifier(db)
                );
                let qr = QueryRequest::new("POST", "", &q, "");
                if let Err(e) = query_in_parallel(&backends, &qr).await {
                    self.tlog
                        .log(format!("create retention policy error: {}, db: {}, rp: {}", e, db, rp));
                }
            }
        }
        Ok(dbs)
    }

    /// Rebalance a circle after a membership change: every measurement
    /// whose key now maps to a different backend moves there.
    pub async fn rebalance(
        self: Arc<Self>,
        circle_id: usize,
        sources: Vec<Arc<Backend>>,
        dbs: Vec<String>,
    ) -> Result<()> {
        self.tlog.set_output("rebalance");
        let dbs = self.create_databases(dbs).await?;
        if dbs.is_empty() {
            return Ok(());
        }
        self.tlog.log(format!("rebalance start: circle {}", circle_id));
        let cs = self.circle_state(circle_id)?.clone();
        self.reset_circle_states();
        self.broadcast_transferring(&cs, true).await;

        let pool = Arc::new(Semaphore::new(self.worker.load(Ordering::Acquire)));
        let mut tasks = Vec::new();
        for be in sources {
            let tx = self.clone();
            let cs = cs.clone();
            let dbs = dbs.clone();
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let decide_cs = cs.clone();
                let decide_be = be.clone();
                let decide_tx = tx.clone();
                tx.run_transfer(&cs, &be, &dbs, pool, move |db, meas| {
                    let key = decide_tx.proxy.get_key(db, meas);
                    let dst = decide_cs.get_backend(&key);
                    if dst.url != decide_be.url {
                        Decision::Move(vec![dst])
                    } else {
                        Decision::InPlace
                    }
                })
                .await;
            }));
        }
        join_all(tasks).await;
        self.broadcast_transferring(&cs, false).await;
        self.reset_basic_params();
        self.tlog.log(format!("rebalance done: circle {}", circle_id));
        Ok(())
    }

    /// Copy data from one circle onto recovered backends of another
    pub async fn recovery(
        self: Arc<Self>,
        from_circle_id: usize,
        to_circle_id: usize,
        backend_urls: Vec<String>,
        dbs: Vec<String>,
    ) -> Result<()> {
        self.tlog.set_output("recovery");
        let dbs = self.create_databases(dbs).await?;
        if dbs.is_empty() {
            return Ok(());
        }
        self.tlog.log(format!(
            "recovery start: circle from {} to {}",
            from_circle_id, to_circle_id
        ));
        let fcs = self.circle_state(from_circle_id)?.clone();
        let tcs = self.circle_state(to_circle_id)?.clone();
        self.reset_circle_states();
        self.broadcast_transferring(&tcs, true).await;

        let url_set: Arc<HashSet<String>> = Arc::new(if backend_urls.is_empty() {
            tcs.backends().iter().map(|b| b.url.clone()).collect()
        } else {
            backend_urls.into_iter().collect()
        });
        let pool = Arc::new(Semaphore::new(self.worker.load(Ordering::Acquire)));
        let mut tasks = Vec::new();
        for be in fcs.backends().iter().cloned() {
            let tx = self.clone();
            let fcs = fcs.clone();
            let tcs = tcs.clone();
            let url_set = url_set.clone();
            let dbs = dbs.clone();
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let decide_tx = tx.clone();
                tx.run_transfer(&fcs, &be, &dbs, pool, move |db, meas| {
                    let key = decide_tx.proxy.get_key(db, meas);
                    let dst = tcs.get_backend(&key);
                    if url_set.contains(&dst.url) {
                        Decision::Move(vec![dst])
                    } else {
                        Decision::InPlace
                    }
                })
                .await;
            }));
        }
        join_all(tasks).await;
        self.broadcast_transferring(&tcs, false).await;
        self.reset_basic_params();
        self.tlog.log(format!(
            "recovery done: circle from {} to {}",
            from_circle_id, to_circle_id
        ));
        Ok(())
    }

    /// Bring every circle's copy of every measurement into agreement
    pub async fn resync(self: Arc<Self>, dbs: Vec<String>) -> Result<()> {
        self.tlog.set_output("resync");
        let dbs = self.create_databases(dbs).await?;
        if dbs.is_empty() {
            return Ok(());
        }
        self.tlog.log("resync start".to_string());
        self.reset_circle_states();
        self.broadcast_resyncing(true).await;

        for cs in self.circle_states.clone() {
            self.tlog.log(format!("resync start: circle {}", cs.circle_id));
            let pool = Arc::new(Semaphore::new(self.worker.load(Ordering::Acquire)));
            let mut tasks = Vec::new();
            for be in cs.backends().iter().cloned() {
                let tx = self.clone();
                let cs = cs.clone();
                let dbs = dbs.clone();
                let pool = pool.clone();
                tasks.push(tokio::spawn(async move {
                    let decide_tx = tx.clone();
                    let decide_cs = cs.clone();
                    tx.run_transfer(&cs, &be, &dbs, pool, move |db, meas| {
                        let key = decide_tx.proxy.get_key(db, meas);
                        let dsts: Vec<Arc<Backend>> = decide_tx
                            .circle_states
                            .iter()
                            .filter(|tcs| tcs.circle_id != decide_cs.circle_id)
                            .map(|tcs| tcs.get_backend(&key))
                            .collect();
                        if dsts.is_empty() {
                            Decision::InPlace
                        } else {
                            Decision::Move(dsts)
                        }
                    })
                    .await;
                }));
            }
            join_all(tasks).await;
            self.tlog.log(format!("resync done: circle {}", cs.circle_id));
        }
        self.broadcast_resyncing(false).await;
        self.reset_basic_params();
        self.tlog.log("resync done".to_string());
        Ok(())
    }

    /// Drop measurements that no longer belong on their backend within a
    /// circle. No data is copied.
    pub async fn cleanup(self: Arc<Self>, circle_id: usize) -> Result<()> {
        self.tlog.set_output("cleanup");
        self.tlog.log(format!("cleanup start: circle {}", circle_id));
        let cs = self.circle_state(circle_id)?.clone();
        self.reset_circle_states();
        self.broadcast_transferring(&cs, true).await;

        let pool = Arc::new(Semaphore::new(self.worker.load(Ordering::Acquire)));
        let mut tasks = Vec::new();
        for be in cs.backends().iter().cloned() {
            let dbs = be.get_databases().await;
            if dbs.is_empty() {
                continue;
            }
            let tx = self.clone();
            let cs = cs.clone();
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let decide_tx = tx.clone();
                let decide_cs = cs.clone();
                let decide_be = be.clone();
                tx.run_transfer(&cs, &be, &dbs, pool, move |db, meas| {
                    let key = decide_tx.proxy.get_key(db, meas);
                    let dst = decide_cs.get_backend(&key);
                    if dst.url != decide_be.url {
                        Decision::Drop
                    } else {
                        Decision::InPlace
                    }
                })
                .await;
            }));
        }
        join_all(tasks).await;
        self.broadcast_transferring(&cs, false).await;
        self.reset_basic_params();
        self.tlog.log(format!("cleanup done: circle {}", circle_id));
        Ok(())
    }

    /// Enumerate `(db, measurement)` pairs on one source backend and act
    /// on each per the operation's decision.
    async fn run_transfer(
        self: Arc<Self>,
        cs: &Arc<CircleState>,
        be: &Arc<Backend>,
        dbs: &[String],
        pool: Arc<Semaphore>,
        decide: impl Fn(&str, &str) -> Decision,
    ) {
        if !be.is_active() {
            self.tlog.log(format!("backend unavailable: {}", be.url));
            return;
        }

        let stats = cs.stats(&be.url);
        stats
            .database_total
            .store(dbs.len() as i32, Ordering::Release);
        let measures: Vec<Vec<String>> =
            join_all(dbs.iter().map(|db| be.get_measurements(db))).await;
        let total: usize = measures.iter().map(Vec::len).sum();
        stats
            .measurement_total
            .store(total as i32, Ordering::Release);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for (db, meas_list) in dbs.iter().zip(&measures) {
            for meas in meas_list {
                match decide(db, meas) {
                    Decision::Move(dsts) => {
                        stats.transfer_count.fetch_add(1, Ordering::AcqRel);
                        tasks.extend(
                            self.clone()
                                .submit_transfer(be, dsts, db, meas, &pool)
                                .await,
                        );
                    }
                    Decision::Drop => {
                        stats.transfer_count.fetch_add(1, Ordering::AcqRel);
                        self.tlog.log(format!(
                            "backend:{} db:{} meas:{} require to cleanup",
                            be.url, db, meas
                        ));
                        tasks.push(self.clone().submit_cleanup(be, db, meas, &pool));
                    }
                    Decision::InPlace => {
                        stats.in_place_count.fetch_add(1, Ordering::AcqRel);
                    }
                }
                stats.measurement_done.fetch_add(1, Ordering::AcqRel);
            }
            stats.database_done.fetch_add(1, Ordering::AcqRel);
        }
        join_all(tasks).await;
    }

    /// One task per retention policy of the measurement's database
    async fn submit_transfer(
        self: Arc<Self>,
        src: &Arc<Backend>,
        dsts: Vec<Arc<Backend>>,
        db: &str,
        meas: &str,
        pool: &Arc<Semaphore>,
    ) -> Vec<JoinHandle<()>> {
        let rps = src.get_retention_policies(db).await;
        let mut tasks = Vec::with_capacity(rps.len());
        for rp in rps {
            let tx = self.clone();
            let src = src.clone();
            let dsts = dsts.clone();
            let db = db.to_string();
            let meas = meas.to_string();
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = match pool.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let batch = tx.batch.load(Ordering::Acquire);
                let tick = tx.tick.load(Ordering::Acquire);
                let dst_urls: Vec<&str> = dsts.iter().map(|d| d.url.as_str()).collect();
                match tx.clone().transfer(&src, &dsts, &db, &rp, &meas).await {
                    Ok(()) => tx.tlog.log(format!(
                        "transfer done, src:{} dst:{:?} db:{} rp:{} meas:{} batch:{} tick:{}",
                        src.url, dst_urls, db, rp, meas, batch, tick
                    )),
                    Err(e) => tx.tlog.log(format!(
                        "transfer error: {}, src:{} dst:{:?} db:{} rp:{} meas:{} batch:{} tick:{}",
                        e, src.url, dst_urls, db, rp, meas, batch, tick
                    )),
                }
            }));
        }
        tasks
    }

    fn submit_cleanup(
        self: Arc<Self>,
        be: &Arc<Backend>,
        db: &str,
        meas: &str,
        pool: &Arc<Semaphore>,
    ) -> JoinHandle<()> {
        let tx = self;
        let be = be.clone();
        let db = db.to_string();
        let meas = meas.to_string();
        let pool = pool.clone();
        tokio::spawn(async move {
            let _permit = match pool.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match be.drop_measurement(&db, &meas).await {
                Ok(_) => tx.tlog.log(format!(
                    "cleanup done, backend:{} db:{} meas:{}",
                    be.url, db, meas
                )),
                Err(e) => tx.tlog.log(format!(
                    "cleanup error: {}, backend:{} db:{} meas:{}",
                    e, be.url, db, meas
                )),
            }
        })
    }

    /// Stream one `(src, dsts, db, rp, meas)` triple: chunked reads from
    /// the source re-encoded as line protocol and replicated to every
    /// destination, with bounded retries on both sides.
    async fn transfer(
        self: Arc<Self>,
        src: &Arc<Backend>,
        dsts: &[Arc<Backend>],
        db: &str,
        rp: &str,
        meas: &str,
    ) -> Result<()> {
        let (tag_keys, field_keys) =
            tokio::join!(src.get_tag_keys(db, rp, meas), src.get_field_keys(db, rp, meas));
        let tag_set: HashSet<String> = tag_keys.into_iter().collect();
        let field_map = reform_field_keys(field_keys);

        let batch = self.batch.load(Ordering::Acquire);
        let tick = self.tick.load(Ordering::Acquire);
        let mut q = format!(
            "select * from \"{}\".\"{}\"",
            escape_identifier(rp),
            escape_identifier(meas)
        );
        if tick > 0 {
            q.push_str(&format!(" where time >= {}s", tick));
        }

        let mut rsp = None;
        let mut last_err: Option<Error> = None;
        for i in 0..=RETRY_COUNT {
            if i > 0 {
                tokio::time::sleep(Duration::from_secs(RETRY_INTERVAL)).await;
                self.tlog.log(format!(
                    "transfer query retry: {}, err:{} src:{} db:{} rp:{} meas:{} batch:{} tick:{}",
                    i,
                    last_err.as_ref().map(ToString::to_string).unwrap_or_default(),
                    src.url,
                    db,
                    rp,
                    meas,
                    batch,
                    tick
                ));
            }
            match src.query_chunk("GET", db, &q, "ns", batch).await {
                Ok(chunked) => {
                    rsp = Some(chunked);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let mut rsp = match rsp {
            Some(rsp) => rsp,
            None => return Err(last_err.unwrap_or(Error::BackendsUnavailable)),
        };

        let write_pool = Arc::new(Semaphore::new(dsts.len().max(1) * 20));
        let mut writes: Vec<JoinHandle<()>> = Vec::new();
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let chunk = match rsp.next_response().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    join_all(writes).await;
                    return Err(e);
                }
            };
            if !chunk.err.is_empty() {
                join_all(writes).await;
                return Err(Error::Internal(chunk.err));
            }
            let result = match chunk.results.into_iter().next() {
                Some(result) => result,
                None => continue,
            };
            if !result.err.is_empty() {
                join_all(writes).await;
                return Err(Error::Internal(result.err));
            }
            for serie in result.series {
                let columns = &serie.columns;
                let valen = serie.values.len();
                for (idx, value) in serie.values.iter().enumerate() {
                    if let Some(line) = encode_line(meas, columns, value, &tag_set, &field_map) {
                        buf.extend_from_slice(line.as_bytes());
                        buf.push(b'\n');
                    }
                    if buf.is_empty() {
                        continue;
                    }
                    if (idx + 1) % DEFAULT_BATCH == 0 || idx + 1 == valen {
                        let payload = Arc::new(std::mem::take(&mut buf));
                        for dst in dsts {
                            writes.push(self.clone().submit_write(
                                dst.clone(),
                                payload.clone(),
                                db,
                                rp,
                                meas,
                                write_pool.clone(),
                            ));
                        }
                    }
                }
            }
        }
        join_all(writes).await;
        Ok(())
    }

    fn submit_write(
        self: Arc<Self>,
        dst: Arc<Backend>,
        payload: Arc<Vec<u8>>,
        db: &str,
        rp: &str,
        meas: &str,
        pool: Arc<Semaphore>,
    ) -> JoinHandle<()> {
        let tx = self;
        let db = db.to_string();
        let rp = rp.to_string();
        let meas = meas.to_string();
        tokio::spawn(async move {
            let _permit = match pool.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let mut last_err: Option<Error> = None;
            for i in 0..=RETRY_COUNT {
                if i > 0 {
                    tokio::time::sleep(Duration::from_secs(RETRY_INTERVAL)).await;
                    tx.tlog.log(format!(
                        "transfer write retry: {}, err:{} dst:{} db:{} rp:{} meas:{}",
                        i,
                        last_err.as_ref().map(ToString::to_string).unwrap_or_default(),
                        dst.url,
                        db,
                        rp,
                        meas
                    ));
                }
                match dst.write(&db, &rp, &payload).await {
                    Ok(()) => return,
                    Err(e) => last_err = Some(e),
                }
            }
            if let Some(e) = last_err {
                tx.tlog.log(format!(
                    "transfer write error: {}, dst:{} db:{} rp:{} meas:{}",
                    e, dst.url, db, rp, meas
                ));
            }
        })
    }

    /// Tell this proxy's peers a circle is (or is no longer) moving data
    async fn broadcast_transferring(&self, cs: &Arc<CircleState>, on: bool) {
        cs.set_transferring(on);
        for addr in &self.ha_addrs {
            let url = format!(
                "{}://{}/transfer/state?circle_id={}&transferring={}",
                self.scheme(),
                addr,
                cs.circle_id,
                on
            );
            self.post_broadcast(&url).await;
        }
    }

    async fn broadcast_resyncing(&self, on: bool) {
        self.set_resyncing(on);
        for addr in &self.ha_addrs {
            let url = format!(
                "{}://{}/transfer/state?resyncing={}",
                self.scheme(),
                addr,
                on
            );
            self.post_broadcast(&url).await;
        }
    }

    fn scheme(&self) -> &'static str {
        if self.https_enabled {
            "https"
        } else {
            "http"
        }
    }

    async fn post_broadcast(&self, url: &str) {
        let mut req = self.client.post(url);
        if !self.username.is_empty() || !self.password.is_empty() {
            req = req.basic_auth(&self.username, Some(&self.password));
        }
        if let Err(e) = req.send().await {
            self.tlog.log(format!("broadcast error: {}, url: {}", e, url));
        }
    }

    /// Current stats for one circle, keyed by backend url
    pub fn stats_json(&self, circle_id: usize) -> Result<Value> {
        Ok(self.circle_state(circle_id)?.stats_json())
    }
}

/// Collapse multi-typed fields to the first matching type of the
/// upstream's implicit cast order.
fn reform_field_keys(field_keys: HashMap<String, Vec<String>>) -> HashMap<String, String> {
    let mut field_map = HashMap::with_capacity(field_keys.len());
    for (field, types) in field_keys {
        if types.len() == 1 {
            field_map.insert(field, types.into_iter().next().unwrap_or_default());
        } else {
            let type_set: HashSet<&str> = types.iter().map(String::as_str).collect();
            if let Some(dt) = FIELD_TYPES.iter().find(|dt| type_set.contains(**dt)) {
                field_map.insert(field, dt.to_string());
            }
        }
    }
    field_map
}

/// Re-encode one streamed row as a line-protocol record.
///
/// `columns[0]` is the nanosecond timestamp; remaining columns are tags
/// or fields per the source's key sets. Null cells are skipped.
fn encode_line(
    meas: &str,
    columns: &[String],
    value: &[Value],
    tag_set: &HashSet<String>,
    field_map: &HashMap<String, String>,
) -> Option<String> {
    let mut mtag_set = vec![escape_measurement(meas)];
    let mut field_set: Vec<String> = Vec::new();
    for i in 1..value.len().min(columns.len()) {
        let k = &columns[i];
        let v = &value[i];
        if v.is_null() {
            continue;
        }
        if tag_set.contains(k) {
            mtag_set.push(format!("{}={}", escape_tag(k), escape_tag(&cast_string(v))));
        } else if let Some(vtype) = field_map.get(k) {
            match vtype.as_str() {
                "float" | "boolean" => field_set.push(format!("{}={}", escape_tag(k), plain(v))),
                "integer" => field_set.push(format!("{}={}i", escape_tag(k), plain(v))),
                "string" => field_set.push(format!(
                    "{}=\"{}\"",
                    escape_tag(k),
                    escape_string_field(&cast_string(v))
                )),
                _ => {}
            }
        }
    }
    if field_set.is_empty() {
        return None;
    }
    let timestamp = value.first().map(plain)?;
    Some(format!(
        "{} {} {}",
        mtag_set.join(","),
        field_set.join(","),
        timestamp
    ))
}

fn cast_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON scalar rendered without quoting
fn plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

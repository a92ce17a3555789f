//! Read dispatch: replica selection, fan-out and reduction
//!
//! The single-replica path tries healthy, non-draining replicas in a
//! random circle order, then falls back to degraded ones. The
//! all-backends path fans out one task per active backend and merges
//! metadata responses through the reducers.

use super::reduce::{attach_by_values, concat_by_results, reduce_by_series, reduce_by_values};
use super::request::{QueryRequest, QueryResult};
use super::response::Response;
use super::tokens;
use crate::backend::Backend;
use crate::proxy::Proxy;
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

/// Try one replica per circle: healthy first in random order, then
/// degraded (rewriting / write-only but still active) as fallback.
pub async fn query_single(ip: &Proxy, qr: &QueryRequest, key: &str) -> Result<QueryResult> {
    let mut last_err: Option<Error> = None;
    for be in crate::proxy::pick_order(ip, key) {
        match be.query(qr).await {
            Ok(result) => return Ok(result),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(Error::BackendsUnavailable))
}

/// Fan a request out to every active backend.
///
/// Returns the bodies in completion order plus the inactive count. The
/// first backend error aborts the merge; the per-task channel is sized
/// to the backend count so outstanding tasks never block on send.
pub async fn query_in_parallel(
    backends: &[Arc<Backend>],
    qr: &QueryRequest,
) -> Result<(Vec<QueryResult>, usize)> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(backends.len().max(1));
    let mut spawned = 0usize;
    let mut inactive = 0usize;
    for be in backends {
        if !be.is_active() {
            inactive += 1;
            continue;
        }
        let be = be.clone();
        let mut qr = qr.clone();
        qr.origin_parallel = true;
        let tx = tx.clone();
        spawned += 1;
        tokio::spawn(async move {
            let _ = tx.send(be.query(&qr).await).await;
        });
    }
    drop(tx);
    let mut results = Vec::with_capacity(spawned);
    while let Some(result) = rx.recv().await {
        results.push(result?);
    }
    Ok((results, inactive))
}

/// SELECT/SHOW with FROM: route by `(db, measurement)` to one replica set
pub async fn query_from_ql(
    ip: &Proxy,
    qr: &QueryRequest,
    tokens: &[String],
    db: &str,
) -> Result<QueryResult> {
    let measurement =
        tokens::get_measurement_from_tokens(tokens).ok_or(Error::GetMeasurement)?;
    let key = ip.get_key(db, &measurement);
    query_single(ip, qr, &key).await
}

/// SHOW without FROM: fan out to all backends and reduce
pub async fn query_show_ql(
    ip: &Proxy,
    mut qr: QueryRequest,
    tokens: &[String],
) -> Result<QueryResult> {
    qr.del("chunked");
    let stmt2 = tokens::get_head_stmt(tokens, 2);
    let stmt3 = tokens::get_head_stmt(tokens, 3);
    let reduce_values =
        stmt2 == "show measurements" || stmt2 == "show series" || stmt2 == "show databases";
    let reduce_series =
        stmt3 == "show field keys" || stmt3 == "show tag keys" || stmt3 == "show tag values";

    let mut has_clause = false;
    let (mut limit, mut offset) = (0, 0);
    if (reduce_values || reduce_series) && tokens::check_limit_or_offset_clause(tokens) {
        has_clause = true;
        (limit, offset) = tokens::get_limit_offset_from_tokens(tokens);
        let stripped = tokens::remove_limit_offset_clause(qr.get("q"));
        qr.set("q", &stripped);
    }

    let backends = ip.get_all_backends();
    let (results, inactive) = query_in_parallel(&backends, &qr).await?;
    if inactive > 0 {
        warn!(
            "query: {}, inactive: {}/{} backends unavailable",
            qr.get("q"),
            inactive,
            inactive + results.len()
        );
        if results.is_empty() {
            return Err(Error::BackendsUnavailable);
        }
    }
    let bodies: Vec<Bytes> = results.into_iter().map(|r| r.body).collect();

    let rsp = if reduce_values {
        reduce_by_values(&bodies, has_clause, limit, offset)?
    } else if reduce_series {
        reduce_by_series(&bodies, has_clause, limit, offset)?
    } else if stmt3 == "show retention policies" {
        attach_by_values(&bodies)?
    } else if stmt2 == "show stats" {
        concat_by_results(&bodies)?
    } else {
        Response::from_series(None)
    };
    Ok(QueryResult {
        status: 200,
        body: Bytes::from(rsp.marshal(qr.pretty())),
        content_type: "application/json".to_string(),
    })
}

/// DELETE / DROP MEASUREMENT / DROP SERIES: the full replica set for the
/// key must be reachable, then the statement runs everywhere it routes.
pub async fn query_delete_or_drop_ql(
    ip: &Proxy,
    qr: &QueryRequest,
    tokens: &[String],
    db: &str,
) -> Result<QueryResult> {
    let measurement =
        tokens::get_measurement_from_tokens(tokens).ok_or(Error::GetMeasurement)?;
    let key = ip.get_key(db, &measurement);
    let backends = ip.get_backends(key.as_str());
    if backends.is_empty() {
        return Err(Error::GetBackends);
    }
    for be in &backends {
        if !be.is_active() {
            return Err(Error::BackendUnavailable {
                name: be.name.clone(),
                url: be.url.clone(),
            });
        }
    }
    let (results, _) = query_in_parallel(&backends, qr).await?;
    results.into_iter().next().ok_or(Error::BackendsUnavailable)
}

/// Database and retention-policy DDL runs on every backend
pub async fn query_alter_ql(ip: &Proxy, qr: &QueryRequest) -> Result<QueryResult> {
    let backends = ip.get_all_backends();
    let (results, _) = query_in_parallel(&backends, qr).await?;
    results.into_iter().next().ok_or(Error::BackendsUnavailable)
}

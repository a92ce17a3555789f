//! Reducers for merged metadata responses
//!
//! "show"-style statements fan out to every backend; these fold the
//! per-backend bodies into one response with stable ordering,
//! deduplication and post-merge LIMIT/OFFSET.

use super::response::{
    results_from_response_bytes, series_from_response_bytes, Response, Row, StatementResult,
};
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;

fn first_column_str(value: &[Value]) -> String {
    value
        .first()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Stable sort by first column, then OFFSET, then LIMIT.
///
/// `offset <= 0` means no offset; `limit <= 0` means no limit;
/// `offset >= len` yields empty.
pub fn sort_limit_offset(
    mut source: Vec<Vec<Value>>,
    has_clause: bool,
    limit: i64,
    offset: i64,
) -> Vec<Vec<Value>> {
    if source.len() > 1 {
        source.sort_by(|a, b| first_column_str(a).cmp(&first_column_str(b)));
    }
    if !has_clause {
        return source;
    }
    if offset > 0 {
        if offset as usize >= source.len() {
            source.clear();
        } else {
            source.drain(..offset as usize);
        }
    }
    if limit > 0 && (limit as usize) < source.len() {
        source.truncate(limit as usize);
    }
    source
}

/// Merge single-series bodies by first-column value
/// (show measurements / series / databases).
pub fn reduce_by_values(
    bodies: &[bytes::Bytes],
    has_clause: bool,
    limit: i64,
    offset: i64,
) -> Result<Response> {
    let mut template: Option<Row> = None;
    let mut values_map: HashMap<String, Vec<Value>> = HashMap::new();
    for body in bodies {
        let series = series_from_response_bytes(body)?;
        if series.len() == 1 {
            for value in &series[0].values {
                values_map.insert(first_column_str(value), value.clone());
            }
            template = Some(series.into_iter().next().unwrap_or_default());
        }
    }
    let series = template.and_then(|mut row| {
        let values: Vec<Vec<Value>> = values_map.into_values().collect();
        let values = sort_limit_offset(values, has_clause, limit, offset);
        if values.is_empty() {
            None
        } else {
            row.values = values;
            Some(vec![row])
        }
    });
    Ok(Response::from_series(series))
}

/// Merge bodies per series name, each series paginated independently
/// (show field keys / tag keys / tag values).
pub fn reduce_by_series(
    bodies: &[bytes::Bytes],
    has_clause: bool,
    limit: i64,
    offset: i64,
) -> Result<Response> {
    let mut series_map: HashMap<String, Row> = HashMap::new();
    for body in bodies {
        for row in series_from_response_bytes(body)? {
            series_map.insert(row.name.clone(), row);
        }
    }
    let mut series: Vec<Row> = Vec::with_capacity(series_map.len());
    for (_, mut row) in series_map {
        if row.values.is_empty() {
            continue;
        }
        row.values = sort_limit_offset(row.values, has_clause, limit, offset);
        if !row.values.is_empty() {
            series.push(row);
        }
    }
    series.sort_by(|a, b| a.name.cmp(&b.name));
    let series = if series.is_empty() { None } else { Some(series) };
    Ok(Response::from_series(series))
}

/// Union first-column values across bodies, keeping the first-seen row
/// as the series shell (show retention policies).
pub fn attach_by_values(bodies: &[bytes::Bytes]) -> Result<Response> {
    let mut shell: Option<Row> = None;
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    for body in bodies {
        let series = series_from_response_bytes(body)?;
        if series.len() != 1 {
            continue;
        }
        let row = series.into_iter().next().unwrap_or_default();
        match shell.as_mut() {
            None => {
                for value in &row.values {
                    seen.insert(first_column_str(value));
                }
                shell = Some(row);
            }
            Some(shell) => {
                for value in row.values {
                    if seen.insert(first_column_str(&value)) {
                        shell.values.push(value);
                    }
                }
            }
        }
    }
    Ok(Response::from_series(shell.map(|row| vec![row])))
}

/// Concatenate the first result of each body as independent results
/// (show stats).
pub fn concat_by_results(bodies: &[bytes::Bytes]) -> Result<Response> {
    let mut results: Vec<StatementResult> = Vec::with_capacity(bodies.len());
    for body in bodies {
        if let Some(result) = results_from_response_bytes(body)?.into_iter().next() {
            results.push(result);
        }
    }
    Ok(Response::from_results(results))
}

//! Upstream `/query` JSON schema
//!
//! Mirrors the response shape of the upstream engine:
//! `{results: [{statement_id, series: [{name, columns, values, tags}],
//! messages, partial, error}], error}`. Values are kept as raw JSON so
//! numbers round-trip without float coercion.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One series (row group) in a statement result
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Row {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Vec<Value>>,
}

/// A user-facing message attached to a result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub level: String,
    pub text: String,
}

/// One statement's result set
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatementResult {
    #[serde(default)]
    pub statement_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    #[serde(rename = "error", default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

/// A full `/query` response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<StatementResult>,
    #[serde(rename = "error", default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl Response {
    pub fn from_bytes(b: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(b)
    }

    /// Wrap a series list in a single-statement response.
    ///
    /// `None` (or an empty list) serializes as `{"results":[{"statement_id":0}]}`
    /// so merged-empty responses carry `series: null` semantics.
    pub fn from_series(series: Option<Vec<Row>>) -> Self {
        Self {
            results: vec![StatementResult {
                series: series.unwrap_or_default(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn from_results(results: Vec<StatementResult>) -> Self {
        Self {
            results,
            ..Default::default()
        }
    }

    pub fn from_error(err: impl Into<String>) -> Self {
        Self {
            err: err.into(),
            ..Default::default()
        }
    }

    /// Serialize, honoring the `pretty` query parameter
    pub fn marshal(&self, pretty: bool) -> Vec<u8> {
        if pretty {
            serde_json::to_vec_pretty(self).unwrap_or_default()
        } else {
            serde_json::to_vec(self).unwrap_or_default()
        }
    }
}

/// Series of the first result, if any
pub fn series_from_response_bytes(b: &[u8]) -> serde_json::Result<Vec<Row>> {
    let rsp = Response::from_bytes(b)?;
    Ok(rsp.results.into_iter().next().map(|r| r.series).unwrap_or_default())
}

/// All results of a response body
pub fn results_from_response_bytes(b: &[u8]) -> serde_json::Result<Vec<StatementResult>> {
    Ok(Response::from_bytes(b)?.results)
}

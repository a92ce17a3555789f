//! Error types for fluxgate

/// Result type alias for fluxgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for fluxgate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query string is empty
    #[error("empty query")]
    EmptyQuery,
    /// Query could not be tokenized or is not a supported statement
    #[error("illegal influxql")]
    IllegalQl,
    /// No database in the query or request parameters
    #[error("database not found")]
    DatabaseNotFound,
    /// Database is not in the configured allow-list
    #[error("database forbidden: {0}")]
    DatabaseForbidden(String),
    /// No measurement could be extracted from the query
    #[error("can't get measurement")]
    GetMeasurement,
    /// No bucket could be extracted from a flux query
    #[error("can't get bucket")]
    GetBucket,
    /// No backends resolved for a shard key
    #[error("can't get backends")]
    GetBackends,
    /// Every candidate backend was unavailable
    #[error("backends unavailable")]
    BackendsUnavailable,
    /// A named backend is unavailable
    #[error("backend {name}({url}) unavailable")]
    BackendUnavailable { name: String, url: String },
    /// Configuration has no circles
    #[error("circles cannot be empty")]
    EmptyCircles,
    /// A circle has no backends
    #[error("backends cannot be empty")]
    EmptyBackends,
    /// A backend has no name
    #[error("backend name cannot be empty")]
    EmptyBackendName,
    /// Two backends share a name
    #[error("backend name duplicated: {0}")]
    DuplicatedBackendName(String),
    /// hash_key is not idx, exi, name, url or a template containing %idx
    #[error("invalid hash_key, require idx, exi, name, url or template containing %idx")]
    InvalidHashKey,
    /// shard_key template contains no shard variable
    #[error("invalid shard_key, require template containing %db or %mm")]
    InvalidShardKey,
    /// Circle id out of range
    #[error("invalid circle id: {0}")]
    InvalidCircleId(usize),
    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),
    /// Upstream returned a non-success status
    #[error("upstream status {status}: {reason}")]
    UpstreamStatus { status: u16, reason: String },
    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP client errors
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// JSON errors
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

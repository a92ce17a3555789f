//! Proxy configuration
//!
//! Loads the nested circle/backend topology from a TOML file, fills in
//! defaults and validates the result before the proxy starts. Config
//! errors are fatal at startup.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

pub const HASH_KEY_IDX: &str = "idx";
pub const HASH_KEY_EXI: &str = "exi";
pub const HASH_KEY_NAME: &str = "name";
pub const HASH_KEY_URL: &str = "url";
pub const HASH_KEY_VAR_IDX: &str = "%idx";
pub const SHARD_KEY_VAR_DB: &str = "%db";
pub const SHARD_KEY_VAR_MM: &str = "%mm";
pub const SHARD_KEY_DB_MM: &str = "%db,%mm";

/// One upstream backend inside a circle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth_encrypt: bool,
    /// Accept writes but stay out of the read rotation
    #[serde(default)]
    pub write_only: bool,
}

/// A replica group: one complete shard-space partitioned across its backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircleConfig {
    pub name: String,
    pub backends: Vec<BackendConfig>,
}

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub circles: Vec<CircleConfig>,
    pub listen_addr: String,
    /// Allow-list of databases; empty means all are allowed
    pub db_list: Vec<String>,
    pub data_dir: String,
    pub tlog_dir: String,
    pub hash_key: String,
    pub shard_key: String,
    pub flush_size: usize,
    /// Seconds between forced buffer flushes
    pub flush_time: u64,
    /// Seconds between backend health probes
    pub check_interval: u64,
    /// Seconds between rewrite-log drain passes
    pub rewrite_interval: u64,
    pub rewrite_threads: usize,
    pub conn_pool_size: usize,
    /// Seconds before an upstream write request is abandoned
    pub write_timeout: u64,
    pub idle_timeout: u64,
    pub username: String,
    pub password: String,
    pub auth_encrypt: bool,
    pub ping_auth_enabled: bool,
    /// Peer proxy addresses for transfer-state broadcast
    pub ha_addrs: Vec<String>,
    pub https_enabled: bool,
    pub https_cert: String,
    pub https_key: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            circles: Vec::new(),
            listen_addr: ":7076".to_string(),
            db_list: Vec::new(),
            data_dir: "data".to_string(),
            tlog_dir: "log".to_string(),
            hash_key: HASH_KEY_IDX.to_string(),
            shard_key: SHARD_KEY_DB_MM.to_string(),
            flush_size: 10000,
            flush_time: 1,
            check_interval: 1,
            rewrite_interval: 10,
            rewrite_threads: 5,
            conn_pool_size: 20,
            write_timeout: 10,
            idle_timeout: 10,
            username: String::new(),
            password: String::new(),
            auth_encrypt: false,
            ping_auth_enabled: false,
            ha_addrs: Vec::new(),
            https_enabled: false,
            https_cert: String::new(),
            https_key: String::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file, apply defaults and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut cfg: ProxyConfig =
            toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
        cfg.set_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Re-apply defaults for zeroed numeric fields and empty strings
    pub fn set_defaults(&mut self) {
        let d = ProxyConfig::default();
        if self.listen_addr.is_empty() {
            self.listen_addr = d.listen_addr;
        }
        if self.data_dir.is_empty() {
            self.data_dir = d.data_dir;
        }
        if self.tlog_dir.is_empty() {
            self.tlog_dir = d.tlog_dir;
        }
        if self.hash_key.is_empty() {
            self.hash_key = d.hash_key;
        }
        if self.shard_key.is_empty() {
            self.shard_key = d.shard_key;
        }
        if self.flush_size == 0 {
            self.flush_size = d.flush_size;
        }
        if self.flush_time == 0 {
            self.flush_time = d.flush_time;
        }
        if self.check_interval == 0 {
            self.check_interval = d.check_interval;
        }
        if self.rewrite_interval == 0 {
            self.rewrite_interval = d.rewrite_interval;
        }
        if self.rewrite_threads == 0 {
            self.rewrite_threads = d.rewrite_threads;
        }
        if self.conn_pool_size == 0 {
            self.conn_pool_size = d.conn_pool_size;
        }
        if self.write_timeout == 0 {
            self.write_timeout = d.write_timeout;
        }
        if self.idle_timeout == 0 {
            self.idle_timeout = d.idle_timeout;
        }
    }

    /// Validate the topology and the routing keys
    pub fn validate(&self) -> Result<()> {
        if self.circles.is_empty() {
            return Err(Error::EmptyCircles);
        }
        let mut names = HashSet::new();
        for circle in &self.circles {
            if circle.backends.is_empty() {
                return Err(Error::EmptyBackends);
            }
            for backend in &circle.backends {
                if backend.name.is_empty() {
                    return Err(Error::EmptyBackendName);
                }
                if !names.insert(backend.name.clone()) {
                    return Err(Error::DuplicatedBackendName(backend.name.clone()));
                }
            }
        }
        if self.hash_key != HASH_KEY_IDX
            && self.hash_key != HASH_KEY_EXI
            && self.hash_key != HASH_KEY_NAME
            && self.hash_key != HASH_KEY_URL
            && !self.hash_key.contains(HASH_KEY_VAR_IDX)
        {
            return Err(Error::InvalidHashKey);
        }
        if !self.shard_key.contains(SHARD_KEY_VAR_DB)
            && !self.shard_key.contains(SHARD_KEY_VAR_MM)
        {
            return Err(Error::InvalidShardKey);
        }
        Ok(())
    }

    /// Whether the proxy requires basic auth on its endpoints
    pub fn auth_required(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }

    pub fn print_summary(&self) {
        info!("{} circles loaded from file", self.circles.len());
        for (id, circle) in self.circles.iter().enumerate() {
            info!("circle {}: {} backends loaded", id, circle.backends.len());
        }
        info!("hash key: {}", self.hash_key);
        info!("shard key: {}", self.shard_key);
        if !self.db_list.is_empty() {
            info!("db list: {:?}", self.db_list);
        }
        info!(
            "auth: {}, encrypt: {}",
            self.auth_required(),
            self.auth_encrypt
        );
    }
}

/// Credentials may be stored base64-encoded in the config file
pub fn decode_credential(value: &str, encoded: bool) -> String {
    use base64::Engine;
    if !encoded || value.is_empty() {
        return value.to_string();
    }
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
        .unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_circle_config() -> ProxyConfig {
        ProxyConfig {
            circles: vec![
                CircleConfig {
                    name: "circle-1".to_string(),
                    backends: vec![
                        BackendConfig {
                            name: "influxdb-1-1".to_string(),
                            url: "http://127.0.0.1:8086".to_string(),
                            ..Default::default()
                        },
                        BackendConfig {
                            name: "influxdb-1-2".to_string(),
                            url: "http://127.0.0.1:8087".to_string(),
                            ..Default::default()
                        },
                    ],
                },
                CircleConfig {
                    name: "circle-2".to_string(),
                    backends: vec![BackendConfig {
                        name: "influxdb-2-1".to_string(),
                        url: "http://127.0.0.1:8088".to_string(),
                        ..Default::default()
                    }],
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let d = ProxyConfig::default();
        assert_eq!(d.listen_addr, ":7076");
        assert_eq!(d.data_dir, "data");
        assert_eq!(d.tlog_dir, "log");
        assert_eq!(d.hash_key, "idx");
        assert_eq!(d.shard_key, "%db,%mm");
        assert_eq!(d.flush_size, 10000);
        assert_eq!(d.flush_time, 1);
        assert_eq!(d.check_interval, 1);
        assert_eq!(d.rewrite_interval, 10);
        assert_eq!(d.rewrite_threads, 5);
        assert_eq!(d.conn_pool_size, 20);
        assert_eq!(d.write_timeout, 10);
        assert_eq!(d.idle_timeout, 10);
    }

    #[test]
    fn validate_accepts_wellformed_topology() {
        assert!(two_circle_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_circles() {
        let cfg = ProxyConfig::default();
        assert!(matches!(cfg.validate(), Err(Error::EmptyCircles)));
    }

    #[test]
    fn validate_rejects_duplicate_backend_names() {
        let mut cfg = two_circle_config();
        cfg.circles[1].backends[0].name = "influxdb-1-1".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(Error::DuplicatedBackendName(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_hash_key() {
        let mut cfg = two_circle_config();
        cfg.hash_key = "ordinal".to_string();
        assert!(matches!(cfg.validate(), Err(Error::InvalidHashKey)));
    }

    #[test]
    fn validate_accepts_idx_template_hash_key() {
        let mut cfg = two_circle_config();
        cfg.hash_key = "node-%idx".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_shard_key_without_variables() {
        let mut cfg = two_circle_config();
        cfg.shard_key = "static-key".to_string();
        assert!(matches!(cfg.validate(), Err(Error::InvalidShardKey)));
    }

    #[test]
    fn decode_credential_passthrough_and_base64() {
        assert_eq!(decode_credential("secret", false), "secret");
        assert_eq!(decode_credential("c2VjcmV0", true), "secret");
        // undecodable input falls back to the raw value
        assert_eq!(decode_credential("!!!", true), "!!!");
    }

    #[test]
    fn load_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(
            &path,
            r#"
listen_addr = ":7076"
shard_key = "%db,%mm"

[[circles]]
name = "circle-1"

[[circles.backends]]
name = "influxdb-1-1"
url = "http://127.0.0.1:8086"
"#,
        )
        .unwrap();
        let cfg = ProxyConfig::load(&path).unwrap();
        assert_eq!(cfg.circles.len(), 1);
        assert_eq!(cfg.circles[0].backends[0].name, "influxdb-1-1");
        assert_eq!(cfg.hash_key, "idx");
    }
}

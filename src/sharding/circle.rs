//! Circle: a replica group of backends behind one consistent-hash ring

use super::ring::HashRing;
use super::template::ShardTemplate;
use crate::backend::Backend;
use crate::config::{
    BackendConfig, CircleConfig, ProxyConfig, HASH_KEY_EXI, HASH_KEY_IDX, HASH_KEY_NAME,
    HASH_KEY_URL, HASH_KEY_VAR_IDX,
};
use crate::{Error, Result};
use std::sync::Arc;

/// Ordered set of backends plus the key→backend map.
///
/// Membership is immutable after construction; admin-coordinated changes
/// build a new snapshot so concurrent readers always see a consistent
/// view.
pub struct Circle {
    pub id: usize,
    pub name: String,
    backends: Vec<Arc<Backend>>,
    ring: HashRing,
}

impl Circle {
    pub fn new(circfg: &CircleConfig, pcfg: &ProxyConfig, id: usize) -> Result<Self> {
        if circfg.backends.is_empty() {
            return Err(Error::EmptyBackends);
        }
        let mut backends = Vec::with_capacity(circfg.backends.len());
        let mut ring = HashRing::new();
        for (idx, bcfg) in circfg.backends.iter().enumerate() {
            ring.add_node(&hash_input(&pcfg.hash_key, id, idx, bcfg), idx);
            backends.push(Backend::new(bcfg, pcfg)?);
        }
        Ok(Self {
            id,
            name: circfg.name.clone(),
            backends,
            ring,
        })
    }

    /// The backend owning `key`. Total over non-empty membership.
    pub fn get_backend(&self, key: &str) -> Arc<Backend> {
        let ordinal = self.ring.get(key).unwrap_or(0);
        self.backends[ordinal].clone()
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Health summary of every backend in this circle
    pub async fn get_health(&self, stats: bool) -> serde_json::Value {
        let mut healths = Vec::with_capacity(self.backends.len());
        for be in &self.backends {
            healths.push(be.health(stats).await);
        }
        serde_json::json!({
            "circle": {"id": self.id, "name": self.name},
            "backends": healths,
        })
    }

    pub fn close(&self) {
        for be in &self.backends {
            be.close();
        }
    }
}

/// The string fed to the ring for one backend, selected by `hash_key`
fn hash_input(hash_key: &str, circle_id: usize, idx: usize, bcfg: &BackendConfig) -> String {
    match hash_key {
        HASH_KEY_IDX => idx.to_string(),
        // extended ordinal: qualified by the circle so sibling circles
        // shuffle the same key to different ordinals
        HASH_KEY_EXI => format!("{}-{}", circle_id, idx),
        HASH_KEY_NAME => bcfg.name.clone(),
        HASH_KEY_URL => bcfg.url.clone(),
        tpl if tpl.contains(HASH_KEY_VAR_IDX) => {
            ShardTemplate::compile(tpl, &[HASH_KEY_VAR_IDX]).render(&[&idx.to_string()])
        }
        _ => idx.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircleConfig;

    fn test_config(dir: &tempfile::TempDir) -> ProxyConfig {
        ProxyConfig {
            data_dir: dir.path().to_str().unwrap().to_string(),
            ..Default::default()
        }
    }

    fn circle_config(n: usize) -> CircleConfig {
        CircleConfig {
            name: "circle-1".to_string(),
            backends: (0..n)
                .map(|i| BackendConfig {
                    name: format!("influxdb-1-{}", i + 1),
                    url: format!("http://127.0.0.1:{}", 8086 + i),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn get_backend_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let pcfg = test_config(&dir);
        let circle = Circle::new(&circle_config(3), &pcfg, 0).unwrap();
        for key in ["db,cpu", "db,mem", "metrics,disk"] {
            let first = circle.get_backend(key).url.clone();
            for _ in 0..10 {
                assert_eq!(circle.get_backend(key).url, first);
            }
        }
    }

    #[test]
    fn same_membership_same_mapping_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let pcfg = test_config(&dir);
        let a = Circle::new(&circle_config(4), &pcfg, 0).unwrap();
        let b = Circle::new(&circle_config(4), &pcfg, 0).unwrap();
        for i in 0..100 {
            let key = format!("db,m{}", i);
            assert_eq!(a.get_backend(&key).url, b.get_backend(&key).url);
        }
    }

    #[test]
    fn hash_key_variants_produce_inputs() {
        let bcfg = BackendConfig {
            name: "influxdb-1-1".to_string(),
            url: "http://127.0.0.1:8086".to_string(),
            ..Default::default()
        };
        assert_eq!(hash_input("idx", 0, 2, &bcfg), "2");
        assert_eq!(hash_input("exi", 1, 2, &bcfg), "1-2");
        assert_eq!(hash_input("name", 0, 2, &bcfg), "influxdb-1-1");
        assert_eq!(hash_input("url", 0, 2, &bcfg), "http://127.0.0.1:8086");
        assert_eq!(hash_input("node-%idx", 0, 2, &bcfg), "node-2");
    }

    #[test]
    fn empty_backends_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pcfg = test_config(&dir);
        let circfg = CircleConfig {
            name: "circle-1".to_string(),
            backends: Vec::new(),
        };
        assert!(matches!(
            Circle::new(&circfg, &pcfg, 0),
            Err(Error::EmptyBackends)
        ));
    }
}

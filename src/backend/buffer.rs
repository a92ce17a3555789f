//! Durable per-backend write buffer
//!
//! Lines are batched per `(db, rp)` and flushed upstream at `flush_size`
//! records or on the timed flush pass. A batch that cannot be delivered is
//! appended to a file-backed rewrite log under the backend's data
//! directory; the rewrite worker drains those files back to the upstream.

use crate::Result;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

const REWRITE_EXT: &str = "rec";

/// A point routed to one backend: `(db, rp, line)` with the line already
/// normalized to a nanosecond timestamp.
#[derive(Debug, Clone)]
pub struct LinePoint {
    pub db: String,
    pub rp: String,
    pub line: Vec<u8>,
}

#[derive(Default)]
struct Batch {
    payload: Vec<u8>,
    count: usize,
}

/// In-memory batches plus the on-disk rewrite log
pub struct WriteBuffer {
    dir: PathBuf,
    flush_size: usize,
    batches: DashMap<(String, String), Batch>,
}

impl WriteBuffer {
    pub fn new(dir: impl AsRef<Path>, flush_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            flush_size,
            batches: DashMap::new(),
        })
    }

    /// Append a line; returns the full batch when it reaches `flush_size`.
    pub fn push(&self, point: &LinePoint) -> Option<(String, String, Vec<u8>)> {
        let key = (point.db.clone(), point.rp.clone());
        let mut entry = self.batches.entry(key).or_default();
        entry.payload.extend_from_slice(&point.line);
        entry.payload.push(b'\n');
        entry.count += 1;
        if entry.count >= self.flush_size {
            let payload = std::mem::take(&mut entry.payload);
            entry.count = 0;
            Some((point.db.clone(), point.rp.clone(), payload))
        } else {
            None
        }
    }

    /// Drain every non-empty batch for the timed flush pass
    pub fn drain(&self) -> Vec<(String, String, Vec<u8>)> {
        let mut out = Vec::new();
        for mut entry in self.batches.iter_mut() {
            if entry.count > 0 {
                let (db, rp) = entry.key().clone();
                out.push((db, rp, std::mem::take(&mut entry.value_mut().payload)));
                entry.value_mut().count = 0;
            }
        }
        out
    }

    /// Count of lines currently buffered in memory
    pub fn backlog(&self) -> usize {
        self.batches.iter().map(|e| e.count).sum()
    }

    /// Append an undeliverable payload to the rewrite log
    pub fn persist(&self, db: &str, rp: &str, payload: &[u8]) {
        let path = self.rewrite_path(db, rp);
        let res = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, payload));
        if let Err(e) = res {
            warn!("rewrite log append failed: {}, path: {}", e, path.display());
        }
    }

    /// Pending rewrite log entries as `(db, rp, path)`
    pub fn rewrite_files(&self) -> Vec<(String, String, PathBuf)> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return out,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(REWRITE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some((db, rp)) = stem.rsplit_once('@') {
                    out.push((db.to_string(), rp.to_string(), path.clone()));
                }
            }
        }
        out
    }

    fn rewrite_path(&self, db: &str, rp: &str) -> PathBuf {
        self.dir.join(format!("{}@{}.{}", db, rp, REWRITE_EXT))
    }
}

//! Consistent hash ring
//!
//! Maps a shard key to one backend ordinal within a circle. Virtual nodes
//! smooth the distribution; lookups walk to the first virtual node at or
//! after the key's hash, wrapping to the start of the ring.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Virtual nodes per physical backend
const VIRTUAL_NODES: usize = 100;

/// Immutable consistent-hash ring over backend ordinals
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    ring: BTreeMap<u64, usize>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a backend under its hash input string
    pub fn add_node(&mut self, hash_input: &str, ordinal: usize) {
        for i in 0..VIRTUAL_NODES {
            let vkey = format!("{}:{}", hash_input, i);
            self.ring.insert(hash_of(&vkey), ordinal);
        }
    }

    /// Ordinal of the backend owning `key`, or None on an empty ring
    pub fn get(&self, key: &str) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        let h = hash_of(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, ordinal)| *ordinal)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

fn hash_of(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(n: usize) -> HashRing {
        let mut ring = HashRing::new();
        for i in 0..n {
            ring.add_node(&i.to_string(), i);
        }
        ring
    }

    #[test]
    fn lookup_is_deterministic() {
        let ring = ring_of(3);
        let other = ring_of(3);
        for key in ["db,cpu", "db,mem", "metrics,disk", ""] {
            assert_eq!(ring.get(key), other.get(key));
            assert_eq!(ring.get(key), ring.get(key));
        }
    }

    #[test]
    fn empty_ring_returns_none() {
        assert_eq!(HashRing::new().get("k"), None);
    }

    #[test]
    fn single_node_owns_everything() {
        let ring = ring_of(1);
        for key in ["a", "b", "c"] {
            assert_eq!(ring.get(key), Some(0));
        }
    }

    #[test]
    fn nodes_share_the_keyspace() {
        let ring = ring_of(4);
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            seen.insert(ring.get(&format!("db,m{}", i)).unwrap());
        }
        assert_eq!(seen.len(), 4, "all backends should own some keys");
    }

    #[test]
    fn membership_change_remaps_a_minority() {
        let before = ring_of(4);
        let mut after = ring_of(4);
        after.add_node("4", 4);
        let total = 1000;
        let moved = (0..total)
            .filter(|i| {
                let key = format!("db,m{}", i);
                before.get(&key) != after.get(&key)
            })
            .count();
        assert!(moved > 0, "a fifth node must take over some keys");
        assert!(
            moved < total / 2,
            "consistent hashing should move a minority, moved {}",
            moved
        );
    }
}

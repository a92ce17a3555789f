//! Deterministic shard routing
//!
//! The key template engine renders a shard key from routing variables;
//! the consistent-hash ring maps that key to one backend ordinal; a
//! circle ties an ordered backend set to its ring.

mod circle;
mod ring;
mod template;

pub use circle::Circle;
pub use ring::HashRing;
pub use template::ShardTemplate;

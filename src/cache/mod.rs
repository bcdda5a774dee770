//! Response caching: exact hash layer plus a similarity layer over a
//! bounded LRU map, with optional persistence and TTL enforced at read
//! time.

mod similarity;
mod store;

pub use similarity::{dice_coefficient, hash_key, normalize, HolographicEncoder};
pub use store::{
    CacheConfig, CacheEntry, CacheHit, CacheStats, EncodingStrategy, MatchType, ResponseCache,
};

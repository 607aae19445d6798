//! Read-through caching on top of the store's TTL cache.
//!
//! Callers hand `CacheLayer` a key and an async fetcher; fresh entries are
//! served from the store, misses and expired entries go to the network and
//! are written back with a TTL.

mod layer;
mod traits;

pub use layer::{CacheLayer, DEFAULT_TTL};
pub use traits::{CacheResult, CacheSource};

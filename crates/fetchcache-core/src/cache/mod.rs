//! In-memory response caching.
//!
//! This module provides the `TtlCache`, a key/value store whose entries
//! expire a fixed time after they were written. Entries are never refreshed
//! by reads; a periodic sweep owned by the access client drops keys that
//! are written once and never read again.

pub mod ttl;

pub use ttl::{CacheEntry, CacheStats, TtlCache, DEFAULT_TTL};

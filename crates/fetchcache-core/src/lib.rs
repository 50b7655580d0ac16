//! Resilient data-access layer for JSON backends.
//!
//! The [`AccessClient`] is the entry point. It owns a [`TtlCache`] of parsed
//! responses and a [`Deduplicator`] of in-flight requests, and drives a
//! [`Transport`] with bounded, exponentially backed-off retries. Batch and
//! prefetch helpers are built on the single-request path.

pub mod api;
pub mod cache;
pub mod config;
pub mod dedup;

pub use api::{
    AccessClient, ApiError, Method, RequestDescriptor, RequestInit, RequestOptions, RetryOn,
    RetryPolicy, ReqwestTransport, Transport, TransportResponse,
};
pub use cache::{CacheStats, TtlCache};
pub use config::ClientConfig;
pub use dedup::{DeduplicationError, Deduplicator};

//! Request orchestration over an arbitrary HTTP transport.
//!
//! This module provides the `AccessClient`, which layers response caching,
//! in-flight request coalescing and retry with exponential backoff over a
//! `Transport` implementation (by default `reqwest`).

pub mod client;
pub mod error;
pub mod request;
pub mod retry;
pub mod transport;

pub use client::AccessClient;
pub use error::ApiError;
pub use request::{Method, RequestDescriptor, RequestOptions};
pub use retry::{RetryOn, RetryPolicy};
pub use transport::{ReqwestTransport, RequestInit, Transport, TransportResponse};

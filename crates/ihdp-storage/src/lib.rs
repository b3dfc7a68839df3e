//! HTTP access and warehouse persistence (watermarks + bronze sinks) for IHDP.

pub mod http;
pub mod postgres;
pub mod warehouse;

pub use http::{
    BackoffPolicy, FetchedResponse, HttpClientConfig, HttpError, HttpFetcher, RateLimit,
    RateLimiter,
};
pub use postgres::{PgSink, PgWatermarkStore, PoolConfig};
pub use warehouse::{
    DryRunSink, MemorySink, MemoryWatermarkStore, Sink, StoreError, WatermarkStore,
};

pub const CRATE_NAME: &str = "ihdp-storage";

//! Budgeted catalog client, candidate discovery and the crawl loop.
//!
//! This crate provides:
//! - [`client`]: rate-limited, budgeted API client over a pluggable [`Transport`]
//! - [`catalog`]: wire payloads and popularity ordering
//! - [`discovery`]: search / relationships / mixed candidate selection
//! - [`edges`]: user, pack and tag edge discovery plus related-item enqueueing
//! - [`engine`]: the resumable crawl loop

pub mod catalog;
pub mod client;
pub mod discovery;
pub mod edges;
pub mod engine;

pub use catalog::{FIELDS, ItemPayload, PackRef, SearchPage};
pub use client::{
    ApiClient, HttpTransport, RateWindow, RetryPolicy, RunBudget, Transport, TransportResponse,
};
pub use discovery::{Candidate, DiscoveryEngine};
pub use edges::{EdgeCounts, EdgeDiscovery};
pub use engine::{CrawlSummary, Crawler, ProgressReporter, SilentProgress, StopReason};

//! Run orchestration for SampleGraph.
//!
//! Ties restore, crawl, backup upload and milestone post-processing into one
//! end-to-end run ([`pipeline::run_crawl`]).

pub mod milestone;
pub mod pipeline;
pub mod postprocess;

pub use samplegraph_crawler::{ProgressReporter, SilentProgress};

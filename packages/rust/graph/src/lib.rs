//! Attributed, incrementally-built relationship graph of catalog items.
//!
//! This crate provides:
//! - [`GraphStore`]: the single source of truth for nodes and edges
//! - [`Topology`]: the explicit, versioned node table + edge table used for persistence
//! - [`PendingQueue`]: the bounded queue of discovered-but-unfetched items
//! - [`similarity`]: tag-set Jaccard similarity and batch tag-edge derivation

mod queue;
pub mod similarity;
mod store;

pub use queue::{EnqueueOutcome, PendingQueue};
pub use similarity::{jaccard, tag_similarity_edges};
pub use store::{GraphStore, ImportReport, Invalidated, Topology, UpsertOutcome};

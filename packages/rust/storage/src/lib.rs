//! Checkpoint persistence for SampleGraph.
//!
//! [`CheckpointManager`] saves and loads the full crawl state as a checkpoint
//! directory, swapped into place atomically. [`CheckpointIndex`] wraps the
//! libSQL `index.db` stored alongside it for fast id lookups.

mod checkpoint;
mod index;
mod migrations;

pub use checkpoint::{
    CheckpointManager, CheckpointSnapshot, GRAPH_FILE, METADATA_FILE, RepairReport, STATE_FILE,
    copy_dir, repair, verify,
};
pub use index::{CheckpointIndex, INDEX_FILE, IndexedItem};

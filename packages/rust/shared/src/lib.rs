//! Shared types, error model, and configuration for SampleGraph.
//!
//! This crate is the foundation depended on by all other SampleGraph crates.
//! It provides:
//! - [`SampleGraphError`] and [`ApiError`]: the unified error types
//! - Domain types ([`ItemId`], [`ItemNode`], [`Edge`], [`PendingItem`], [`RunStats`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ApiConfig, AppConfig, BackupConfig, CheckpointConfig, CrawlSection, DEFAULT_DAILY_REQUEST_CAP,
    MilestoneCommands, MilestoneConfig, RunConfig, config_dir, config_file_path, expand_path,
    init_config, load_config, load_config_from, read_secret,
};
pub use error::{ApiError, CheckpointMismatch, Result, SampleGraphError};
pub use types::{
    CURRENT_SCHEMA_VERSION, DiscoveredVia, DiscoveryMode, Edge, EdgeKind, ItemId, ItemNode,
    MetadataUpdateMode, PendingItem, RunId, RunStats, SearchCursor,
};

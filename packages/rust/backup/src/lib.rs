//! Off-machine backup of checkpoint directories.
//!
//! A checkpoint is packed into a timestamped tar.gz and stored as an asset on
//! a remote [`AssetStore`]. [`BackupGateway`] uploads with rolling retention
//! and restores the newest usable archive, falling back to older ones.

pub mod archive;
mod gateway;
mod store;

pub use archive::{archive_name, archive_timestamp, is_archive_name, pack, sha256_file, unpack};
pub use gateway::{BackupGateway, RestoreOutcome};
pub use store::{AssetRef, AssetStore, ReleaseAssetStore};

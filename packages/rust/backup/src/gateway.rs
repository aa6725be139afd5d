//! Upload, prune, and restore checkpoint archives.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use samplegraph_shared::{BackupConfig, Result, SampleGraphError};
use samplegraph_storage::{CheckpointManager, CheckpointSnapshot, RepairReport};

use crate::archive::{archive_name, is_archive_name, pack, sha256_file, unpack};
use crate::store::{AssetRef, AssetStore, ReleaseAssetStore};

/// Result of [`BackupGateway::restore_latest`].
#[derive(Debug)]
pub enum RestoreOutcome {
    /// The checkpoint directory now holds the contents of `asset`.
    Restored {
        asset: AssetRef,
        repair: Option<RepairReport>,
    },
    /// The store holds no checkpoint archives.
    Empty,
}

/// Moves checkpoint directories to and from an [`AssetStore`].
pub struct BackupGateway {
    store: Arc<dyn AssetStore>,
    /// Archives kept after an upload; 0 keeps everything.
    keep_recent: usize,
}

impl BackupGateway {
    pub fn new(store: Arc<dyn AssetStore>, keep_recent: usize) -> Self {
        Self { store, keep_recent }
    }

    /// `None` when backups are disabled.
    pub fn from_config(config: &BackupConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let store = ReleaseAssetStore::from_config(config)?;
        Ok(Some(Self::new(Arc::new(store), config.keep_recent)))
    }

    /// Checkpoint archives, oldest first. Other assets are ignored.
    pub async fn list_archives(&self) -> Result<Vec<AssetRef>> {
        let assets = self.store.list_assets().await?;
        Ok(assets
            .into_iter()
            .filter(|a| is_archive_name(&a.name))
            .collect())
    }

    /// Pack `dir`, upload it as a new archive, then apply retention.
    ///
    /// Retention failures are logged, not returned.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub async fn upload_checkpoint(&self, dir: &Path) -> Result<AssetRef> {
        self.upload_checkpoint_at(dir, Utc::now()).await
    }

    async fn upload_checkpoint_at(&self, dir: &Path, at: DateTime<Utc>) -> Result<AssetRef> {
        let work = scratch_dir("samplegraph-backup");
        let result = self.pack_and_upload(dir, &work, at).await;
        let _ = fs::remove_dir_all(&work);
        let asset = result?;

        if let Err(e) = self.prune().await {
            warn!(error = %e, "retention pass failed");
        }
        Ok(asset)
    }

    async fn pack_and_upload(&self, dir: &Path, work: &Path, at: DateTime<Utc>) -> Result<AssetRef> {
        // Asset names are unique per release. Existing archives are never
        // touched here; a taken name moves to the next free second.
        let taken: HashSet<String> = self
            .list_archives()
            .await?
            .into_iter()
            .map(|a| a.name)
            .collect();
        let mut at = at;
        let mut name = archive_name(at);
        while taken.contains(&name) {
            at += TimeDelta::seconds(1);
            name = archive_name(at);
        }

        let archive = work.join(&name);
        let digest = pack(dir, &archive)?;
        let asset = self.store.upload(&archive, &name).await?;
        info!(asset = %asset.name, size = asset.size, sha256 = %digest, "checkpoint uploaded");
        Ok(asset)
    }

    /// Delete the oldest archives beyond `keep_recent`. Returns what was deleted.
    pub async fn prune(&self) -> Result<Vec<AssetRef>> {
        if self.keep_recent == 0 {
            return Ok(Vec::new());
        }
        let archives = self.list_archives().await?;
        let excess = archives.len().saturating_sub(self.keep_recent);
        let mut deleted = Vec::with_capacity(excess);
        for asset in archives.into_iter().take(excess) {
            self.store.delete(&asset).await?;
            info!(asset = %asset.name, "pruned old checkpoint archive");
            deleted.push(asset);
        }
        Ok(deleted)
    }

    /// Download `asset` and unpack it into `dest_dir`.
    #[instrument(skip_all, fields(asset = %asset.name))]
    pub async fn download(&self, asset: &AssetRef, dest_dir: &Path) -> Result<()> {
        let work = scratch_dir("samplegraph-download");
        let result: Result<()> = async {
            fs::create_dir_all(&work).map_err(|e| SampleGraphError::io(&work, e))?;
            let archive = work.join(&asset.name);
            self.store.download(asset, &archive).await?;
            let digest = sha256_file(&archive)?;
            info!(size = asset.size, sha256 = %digest, "checkpoint archive downloaded");
            unpack(&archive, dest_dir)
        }
        .await;
        let _ = fs::remove_dir_all(&work);
        result
    }

    pub async fn delete(&self, asset: &AssetRef) -> Result<()> {
        self.store.delete(asset).await
    }

    /// Replace the local checkpoint with the newest usable archive.
    ///
    /// Archives that fail to download, unpack, or load are skipped in favour
    /// of the next older one. A restored checkpoint whose counters disagree
    /// is repaired, saved, re-uploaded, and the corrupted archive deleted.
    #[instrument(skip_all, fields(dir = %manager.dir().display()))]
    pub async fn restore_latest(&self, manager: &CheckpointManager) -> Result<RestoreOutcome> {
        let archives = self.list_archives().await?;
        if archives.is_empty() {
            info!("no checkpoint archives found; starting from an empty graph");
            return Ok(RestoreOutcome::Empty);
        }

        for asset in archives.iter().rev() {
            let (mut snapshot, repair) = match self.fetch(asset, manager).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(asset = %asset.name, error = %e, "archive unusable; trying an older one");
                    continue;
                }
            };

            manager.save(&mut snapshot).await?;
            info!(
                asset = %asset.name,
                nodes = snapshot.stats.nodes,
                edges = snapshot.stats.edges,
                "checkpoint restored"
            );

            if repair.is_some() {
                self.replace_corrupted(asset, manager.dir()).await;
            }
            return Ok(RestoreOutcome::Restored {
                asset: asset.clone(),
                repair,
            });
        }

        Err(SampleGraphError::BackupTransport(format!(
            "none of {} checkpoint archives could be restored",
            archives.len()
        )))
    }

    async fn fetch(
        &self,
        asset: &AssetRef,
        manager: &CheckpointManager,
    ) -> Result<(CheckpointSnapshot, Option<RepairReport>)> {
        let staging = scratch_dir("samplegraph-restore");
        let result: Result<(CheckpointSnapshot, Option<RepairReport>)> = async {
            let unpacked = staging.join("checkpoint");
            self.download(asset, &unpacked).await?;
            manager
                .relocated(&unpacked)
                .load_verified()
                .await?
                .ok_or_else(|| {
                    SampleGraphError::Archive(format!("{} holds no checkpoint", asset.name))
                })
        }
        .await;
        let _ = fs::remove_dir_all(&staging);
        result
    }

    async fn replace_corrupted(&self, corrupted: &AssetRef, dir: &Path) {
        match self.upload_checkpoint(dir).await {
            Ok(repaired) => {
                if let Err(e) = self.store.delete(corrupted).await {
                    warn!(asset = %corrupted.name, error = %e, "could not delete corrupted archive");
                } else {
                    info!(
                        corrupted = %corrupted.name,
                        repaired = %repaired.name,
                        "replaced corrupted checkpoint archive"
                    );
                }
            }
            Err(e) => warn!(error = %e, "could not upload repaired checkpoint"),
        }
    }
}

fn scratch_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}", Uuid::now_v7()))
}

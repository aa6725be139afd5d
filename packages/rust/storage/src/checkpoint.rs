//! Checkpoint directory persistence with atomic replacement.
//!
//! A checkpoint is a directory holding:
//! - `graph.json`: the versioned [`Topology`]
//! - `crawl_state.json`: processed ids, pending queue, search cursor, listed owners/packs
//! - `metadata.json`: [`RunStats`]
//! - `index.db`: the libSQL metadata index
//!
//! `save` writes a sibling `<dir>.tmp-<uuid>` and swaps it into place, so a
//! reader only ever sees a complete checkpoint.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use samplegraph_graph::{GraphStore, PendingQueue, Topology};
use samplegraph_shared::{
    CURRENT_SCHEMA_VERSION, CheckpointMismatch, DiscoveryMode, ItemId, MetadataUpdateMode,
    PendingItem, Result, RunStats, SampleGraphError, SearchCursor,
};

use crate::index::{CheckpointIndex, INDEX_FILE};

pub const GRAPH_FILE: &str = "graph.json";
pub const STATE_FILE: &str = "crawl_state.json";
pub const METADATA_FILE: &str = "metadata.json";

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Everything a run needs to continue where the previous one stopped.
#[derive(Debug, Clone)]
pub struct CheckpointSnapshot {
    pub graph: GraphStore,
    pub processed: BTreeSet<ItemId>,
    pub pending: PendingQueue,
    pub cursor: SearchCursor,
    /// Owners whose item listing has already been requested.
    pub listed_owners: BTreeSet<String>,
    /// Packs whose item listing has already been requested.
    pub listed_packs: BTreeSet<u64>,
    pub stats: RunStats,
}

impl CheckpointSnapshot {
    /// A fresh snapshot for a first run.
    pub fn empty(update_mode: MetadataUpdateMode, queue_capacity: usize) -> Self {
        Self {
            graph: GraphStore::new(update_mode),
            processed: BTreeSet::new(),
            pending: PendingQueue::new(queue_capacity),
            cursor: SearchCursor::default(),
            listed_owners: BTreeSet::new(),
            listed_packs: BTreeSet::new(),
            stats: RunStats::default(),
        }
    }

    /// Recompute the counters in `stats` from the live state.
    pub fn refresh_stats(&mut self) {
        self.stats.schema_version = CURRENT_SCHEMA_VERSION;
        self.stats.nodes = self.graph.node_count();
        self.stats.edges = self.graph.edge_count();
        self.stats.processed_count = self.processed.len();
        self.stats.pending_count = self.pending.len();
        self.stats.timestamp = Utc::now();
    }

    pub fn discovery_mode(&self) -> DiscoveryMode {
        self.stats.discovery_mode
    }
}

/// On-disk shape of `crawl_state.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CrawlState {
    processed: Vec<ItemId>,
    pending: Vec<PendingItem>,
    #[serde(default)]
    cursor: SearchCursor,
    #[serde(default)]
    listed_owners: Vec<String>,
    #[serde(default)]
    listed_packs: Vec<u64>,
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Compare recorded counters with the actual snapshot contents.
pub fn verify(snapshot: &CheckpointSnapshot) -> std::result::Result<(), CheckpointMismatch> {
    let mismatch = CheckpointMismatch {
        recorded_nodes: snapshot.stats.nodes,
        actual_nodes: snapshot.graph.node_count(),
        recorded_edges: snapshot.stats.edges,
        actual_edges: snapshot.graph.edge_count(),
        recorded_processed: snapshot.stats.processed_count,
        actual_processed: snapshot.processed.len(),
        recorded_pending: snapshot.stats.pending_count,
        actual_pending: snapshot.pending.len(),
        unprocessed_nodes: snapshot
            .graph
            .node_ids()
            .filter(|id| !snapshot.processed.contains(id))
            .count(),
    };

    let consistent = mismatch.recorded_nodes == mismatch.actual_nodes
        && mismatch.recorded_edges == mismatch.actual_edges
        && mismatch.recorded_processed == mismatch.actual_processed
        && mismatch.recorded_pending == mismatch.actual_pending
        && mismatch.unprocessed_nodes == 0;

    if consistent { Ok(()) } else { Err(mismatch) }
}

/// What [`repair`] changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub mismatch: CheckpointMismatch,
    /// Node ids that were missing from the processed set.
    pub added_to_processed: usize,
}

/// Make the snapshot self-consistent: processed ⊇ nodes, counters recomputed.
pub fn repair(snapshot: &mut CheckpointSnapshot) -> Option<RepairReport> {
    let mismatch = verify(snapshot).err()?;

    let missing: Vec<ItemId> = snapshot
        .graph
        .node_ids()
        .filter(|id| !snapshot.processed.contains(id))
        .collect();
    let added_to_processed = missing.len();
    snapshot.processed.extend(missing);
    snapshot.refresh_stats();

    warn!(
        %mismatch,
        added_to_processed,
        "checkpoint counters were inconsistent; repaired"
    );

    Some(RepairReport {
        mismatch,
        added_to_processed,
    })
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Reads and writes one checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    update_mode: MetadataUpdateMode,
    queue_capacity: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            update_mode: MetadataUpdateMode::default(),
            queue_capacity: samplegraph_shared::RunConfig::default().max_pending_nodes,
        }
    }

    /// Update mode given to the graph on load.
    pub fn with_update_mode(mut self, mode: MetadataUpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    /// Capacity given to the pending queue on load.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Same load settings, different directory.
    pub fn relocated(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..self.clone()
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn exists(&self) -> bool {
        self.dir.join(METADATA_FILE).exists()
    }

    /// Persist `snapshot`, refreshing its counters first.
    ///
    /// Returns the metadata that was written.
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub async fn save(&self, snapshot: &mut CheckpointSnapshot) -> Result<RunStats> {
        snapshot.refresh_stats();

        let (parent, name) = split_dir(&self.dir)?;
        fs::create_dir_all(&parent).map_err(|e| SampleGraphError::io(&parent, e))?;

        let tmp = parent.join(format!("{name}.tmp-{}", Uuid::now_v7()));
        if let Err(e) = self.write_into(&tmp, snapshot).await {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        swap_into_place(&tmp, &self.dir, &parent, &name)?;

        info!(
            nodes = snapshot.stats.nodes,
            edges = snapshot.stats.edges,
            processed = snapshot.stats.processed_count,
            pending = snapshot.stats.pending_count,
            "checkpoint saved"
        );
        Ok(snapshot.stats.clone())
    }

    async fn write_into(&self, tmp: &Path, snapshot: &CheckpointSnapshot) -> Result<()> {
        fs::create_dir_all(tmp).map_err(|e| SampleGraphError::io(tmp, e))?;

        write_json(&tmp.join(GRAPH_FILE), &snapshot.graph.export_topology())?;

        let state = CrawlState {
            processed: snapshot.processed.iter().copied().collect(),
            pending: snapshot.pending.to_vec(),
            cursor: snapshot.cursor.clone(),
            listed_owners: snapshot.listed_owners.iter().cloned().collect(),
            listed_packs: snapshot.listed_packs.iter().copied().collect(),
        };
        write_json(&tmp.join(STATE_FILE), &state)?;

        let index = CheckpointIndex::open(&tmp.join(INDEX_FILE)).await?;
        index.replace_all(snapshot.graph.nodes()).await?;
        drop(index);

        // Metadata goes last: its presence marks a complete directory.
        write_json(&tmp.join(METADATA_FILE), &snapshot.stats)?;
        Ok(())
    }

    /// Load the checkpoint, or `None` when no checkpoint exists yet.
    ///
    /// Recovers an interrupted swap first. Counters are not checked; see
    /// [`CheckpointManager::load_verified`].
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub async fn load(&self) -> Result<Option<CheckpointSnapshot>> {
        self.recover()?;
        if !self.exists() {
            debug!("no checkpoint found");
            return Ok(None);
        }

        let stats: RunStats = read_json(&self.dir.join(METADATA_FILE))?;
        if stats.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(SampleGraphError::validation(format!(
                "checkpoint schema_version {} is newer than supported {}",
                stats.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }

        let topology: Topology = read_json(&self.dir.join(GRAPH_FILE))?;
        let (graph, report) = GraphStore::from_topology(topology, self.update_mode)?;
        if report.dropped_edges > 0 {
            warn!(dropped = report.dropped_edges, "checkpoint edges referenced missing nodes");
        }

        let state: CrawlState = read_json(&self.dir.join(STATE_FILE))?;

        let snapshot = CheckpointSnapshot {
            graph,
            processed: state.processed.into_iter().collect(),
            pending: PendingQueue::from_items(self.queue_capacity, state.pending),
            cursor: state.cursor,
            listed_owners: state.listed_owners.into_iter().collect(),
            listed_packs: state.listed_packs.into_iter().collect(),
            stats,
        };

        info!(
            nodes = snapshot.graph.node_count(),
            edges = snapshot.graph.edge_count(),
            processed = snapshot.processed.len(),
            pending = snapshot.pending.len(),
            "checkpoint loaded"
        );
        Ok(Some(snapshot))
    }

    /// Load, then repair in memory if the counters disagree.
    pub async fn load_verified(&self) -> Result<Option<(CheckpointSnapshot, Option<RepairReport>)>> {
        let Some(mut snapshot) = self.load().await? else {
            return Ok(None);
        };
        let report = repair(&mut snapshot);
        Ok(Some((snapshot, report)))
    }

    /// Restore an interrupted swap and remove stale temp directories.
    pub fn recover(&self) -> Result<()> {
        let (parent, name) = split_dir(&self.dir)?;
        if !parent.exists() {
            return Ok(());
        }

        let tmp_prefix = format!("{name}.tmp-");
        let old_prefix = format!("{name}.old-");
        let mut olds: Vec<PathBuf> = Vec::new();

        let entries = fs::read_dir(&parent).map_err(|e| SampleGraphError::io(&parent, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| SampleGraphError::io(&parent, e))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&tmp_prefix) {
                debug!(path = %entry.path().display(), "removing stale checkpoint temp dir");
                fs::remove_dir_all(entry.path()).map_err(|e| SampleGraphError::io(entry.path(), e))?;
            } else if file_name.starts_with(&old_prefix) {
                olds.push(entry.path());
            }
        }

        // UUID v7 suffixes sort by creation time.
        olds.sort();
        if !self.dir.exists() {
            if let Some(newest) = olds.pop() {
                warn!(from = %newest.display(), "recovering checkpoint from interrupted swap");
                fs::rename(&newest, &self.dir).map_err(|e| SampleGraphError::io(&newest, e))?;
            }
        }
        for stale in olds {
            fs::remove_dir_all(&stale).map_err(|e| SampleGraphError::io(&stale, e))?;
        }
        Ok(())
    }

    /// Copy the checkpoint directory to `dest` (replaced if present).
    pub fn copy_to(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            fs::remove_dir_all(dest).map_err(|e| SampleGraphError::io(dest, e))?;
        }
        copy_dir(&self.dir, dest)
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

fn split_dir(dir: &Path) -> Result<(PathBuf, String)> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            SampleGraphError::config(format!("checkpoint dir has no name: {}", dir.display()))
        })?;
    let parent = match dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, name))
}

fn swap_into_place(tmp: &Path, dir: &Path, parent: &Path, name: &str) -> Result<()> {
    let old = parent.join(format!("{name}.old-{}", Uuid::now_v7()));
    let had_previous = dir.exists();
    if had_previous {
        fs::rename(dir, &old).map_err(|e| SampleGraphError::io(dir, e))?;
    }

    if let Err(e) = fs::rename(tmp, dir) {
        if had_previous {
            let _ = fs::rename(&old, dir);
        }
        return Err(SampleGraphError::io(tmp, e));
    }

    if had_previous {
        fs::remove_dir_all(&old).map_err(|e| SampleGraphError::io(&old, e))?;
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut file = File::create(path).map_err(|e| SampleGraphError::io(path, e))?;
    file.write_all(&bytes)
        .map_err(|e| SampleGraphError::io(path, e))?;
    file.sync_all().map_err(|e| SampleGraphError::io(path, e))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| SampleGraphError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        SampleGraphError::Serialization(format!("{}: {e}", path.display()))
    })
}

/// Recursively copy `src` into a new directory `dest`.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| SampleGraphError::io(dest, e))?;
    let entries = fs::read_dir(src).map_err(|e| SampleGraphError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SampleGraphError::io(src, e))?;
        let target = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| SampleGraphError::io(entry.path(), e))?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| SampleGraphError::io(entry.path(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use samplegraph_shared::{DiscoveredVia, Edge, EdgeKind, ItemNode};

    fn temp_checkpoint_dir() -> PathBuf {
        std::env::temp_dir()
            .join(format!("sg_ckpt_{}", Uuid::now_v7()))
            .join("checkpoint")
    }

    fn node(id: u64, user: &str) -> ItemNode {
        let mut n = ItemNode::new(ItemId(id), format!("item-{id}"), user);
        n.tags = ["kick", "drum"].iter().map(|t| t.to_string()).collect();
        n
    }

    fn sample_snapshot() -> CheckpointSnapshot {
        let mut snapshot = CheckpointSnapshot::empty(MetadataUpdateMode::Merge, 100);
        for id in [1, 2, 3] {
            snapshot.graph.upsert_node(node(id, "alice"));
            snapshot.processed.insert(ItemId(id));
        }
        snapshot.graph.add_edge(Edge::new(ItemId(1), ItemId(2), EdgeKind::User, 1.0));
        snapshot.graph.add_edge(Edge::new(ItemId(2), ItemId(3), EdgeKind::Tag, 0.5));
        snapshot.processed.insert(ItemId(99));
        snapshot
            .pending
            .push(PendingItem::new(ItemId(10), DiscoveredVia::PackEdge));
        snapshot
            .pending
            .push(PendingItem::new(ItemId(11), DiscoveredVia::UserEdge));
        snapshot.cursor.page = 4;
        snapshot.listed_owners.insert("alice".into());
        snapshot.listed_packs.insert(77);
        snapshot.stats.requests_made = 10;
        snapshot
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let manager = CheckpointManager::new(temp_checkpoint_dir());
        assert!(manager.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = temp_checkpoint_dir();
        let manager = CheckpointManager::new(&dir).with_queue_capacity(100);
        let mut snapshot = sample_snapshot();

        let stats = manager.save(&mut snapshot).await.expect("save");
        assert_eq!(stats.nodes, 3);
        assert_eq!(stats.edges, 2);
        assert_eq!(stats.processed_count, 4);
        assert_eq!(stats.pending_count, 2);
        assert!(dir.join(INDEX_FILE).exists());

        let loaded = manager.load().await.expect("load").expect("present");
        assert!(verify(&loaded).is_ok());
        assert_eq!(loaded.graph.export_topology(), snapshot.graph.export_topology());
        assert_eq!(loaded.processed, snapshot.processed);
        assert_eq!(loaded.pending.to_vec(), snapshot.pending.to_vec());
        assert_eq!(loaded.cursor.page, 4);
        assert!(loaded.listed_owners.contains("alice"));
        assert!(loaded.listed_packs.contains(&77));
        assert_eq!(loaded.stats.requests_made, 10);

        let index = CheckpointIndex::open_readonly(&manager.index_path())
            .await
            .expect("index");
        assert_eq!(index.count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn repeated_saves_leave_no_siblings() {
        let dir = temp_checkpoint_dir();
        let manager = CheckpointManager::new(&dir);
        let mut snapshot = sample_snapshot();
        manager.save(&mut snapshot).await.expect("first save");
        snapshot.graph.upsert_node(node(4, "bob"));
        snapshot.processed.insert(ItemId(4));
        manager.save(&mut snapshot).await.expect("second save");

        let siblings: Vec<_> = fs::read_dir(dir.parent().expect("parent"))
            .expect("read parent")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(siblings.len(), 1);

        let loaded = manager.load().await.expect("load").expect("present");
        assert_eq!(loaded.graph.node_count(), 4);
    }

    #[tokio::test]
    async fn recovers_interrupted_swap() {
        let dir = temp_checkpoint_dir();
        let manager = CheckpointManager::new(&dir);
        let mut snapshot = sample_snapshot();
        manager.save(&mut snapshot).await.expect("save");

        // Simulate a kill between "current -> old" and "tmp -> current".
        let (parent, name) = split_dir(&dir).expect("split");
        let old = parent.join(format!("{name}.old-{}", Uuid::now_v7()));
        fs::rename(&dir, &old).expect("move to old");
        let tmp = parent.join(format!("{name}.tmp-{}", Uuid::now_v7()));
        fs::create_dir_all(&tmp).expect("half-written tmp");
        fs::write(tmp.join(GRAPH_FILE), b"{ truncated").expect("partial file");

        let loaded = manager.load().await.expect("load").expect("recovered");
        assert_eq!(loaded.graph.node_count(), 3);
        assert!(!tmp.exists());
        assert!(!old.exists());
    }

    #[tokio::test]
    async fn half_written_temp_dir_is_never_loaded() {
        let dir = temp_checkpoint_dir();
        let (parent, name) = split_dir(&dir).expect("split");
        let tmp = parent.join(format!("{name}.tmp-{}", Uuid::now_v7()));
        fs::create_dir_all(&tmp).expect("tmp");
        fs::write(tmp.join(GRAPH_FILE), b"{}").expect("partial");

        let manager = CheckpointManager::new(&dir);
        assert!(manager.load().await.expect("load").is_none());
        assert!(!tmp.exists());
    }

    /// Stale counters: recorded nodes=150, processed=148, actual nodes=152,
    /// and two node ids absent from the processed set.
    #[tokio::test]
    async fn stale_counters_are_detected_and_repaired() {
        let mut snapshot = CheckpointSnapshot::empty(MetadataUpdateMode::Merge, 10);
        for id in 1..=152u64 {
            snapshot.graph.upsert_node(node(id, "alice"));
            if id <= 150 {
                snapshot.processed.insert(ItemId(id));
            }
        }
        snapshot.refresh_stats();
        snapshot.stats.nodes = 150;
        snapshot.stats.processed_count = 148;

        let mismatch = verify(&snapshot).expect_err("mismatch");
        assert_eq!(mismatch.recorded_nodes, 150);
        assert_eq!(mismatch.actual_nodes, 152);
        assert_eq!(mismatch.recorded_processed, 148);
        assert_eq!(mismatch.actual_processed, 150);
        assert_eq!(mismatch.unprocessed_nodes, 2);

        let report = repair(&mut snapshot).expect("repaired");
        assert_eq!(report.added_to_processed, 2);
        assert_eq!(snapshot.stats.nodes, 152);
        assert_eq!(snapshot.stats.processed_count, 152);
        assert!(verify(&snapshot).is_ok());
        assert!(repair(&mut snapshot).is_none());
    }

    /// Nodes [1, 2, 3] on disk while metadata claims 5.
    #[tokio::test]
    async fn overstated_node_count_is_rejected_then_rewritten() {
        let dir = temp_checkpoint_dir();
        let manager = CheckpointManager::new(&dir);
        let mut snapshot = sample_snapshot();
        manager.save(&mut snapshot).await.expect("save");

        let mut stats = snapshot.stats.clone();
        stats.nodes = 5;
        write_json(&dir.join(METADATA_FILE), &stats).expect("tamper");

        let mut loaded = manager.load().await.expect("load").expect("present");
        assert_eq!(loaded.stats.nodes, 5);
        let mismatch = verify(&loaded).expect_err("mismatch");
        assert_eq!(mismatch.recorded_nodes, 5);
        assert_eq!(mismatch.actual_nodes, 3);

        let report = repair(&mut loaded).expect("repaired");
        assert_eq!(report.mismatch.recorded_nodes, 5);
        assert_eq!(loaded.stats.nodes, 3);
        manager.save(&mut loaded).await.expect("save repaired");

        let on_disk: RunStats = read_json(&dir.join(METADATA_FILE)).expect("metadata");
        assert_eq!(on_disk.nodes, 3);
        let reloaded = manager.load().await.expect("reload").expect("present");
        assert!(verify(&reloaded).is_ok());
    }

    #[tokio::test]
    async fn load_verified_repairs_tampered_metadata() {
        let dir = temp_checkpoint_dir();
        let manager = CheckpointManager::new(&dir);
        let mut snapshot = sample_snapshot();
        manager.save(&mut snapshot).await.expect("save");

        let mut stats = snapshot.stats.clone();
        stats.nodes = 1;
        write_json(&dir.join(METADATA_FILE), &stats).expect("tamper");

        let (loaded, report) = manager
            .load_verified()
            .await
            .expect("load")
            .expect("present");
        let report = report.expect("repair happened");
        assert_eq!(report.mismatch.recorded_nodes, 1);
        assert_eq!(loaded.stats.nodes, 3);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let dir = temp_checkpoint_dir();
        let manager = CheckpointManager::new(&dir);
        let mut snapshot = sample_snapshot();
        manager.save(&mut snapshot).await.expect("save");

        let mut stats = snapshot.stats.clone();
        stats.schema_version = CURRENT_SCHEMA_VERSION + 1;
        write_json(&dir.join(METADATA_FILE), &stats).expect("bump");

        let err = manager.load().await.expect_err("rejected");
        assert!(err.to_string().contains("newer than supported"));
    }

    #[tokio::test]
    async fn copy_to_duplicates_directory() {
        let dir = temp_checkpoint_dir();
        let manager = CheckpointManager::new(&dir);
        let mut snapshot = sample_snapshot();
        manager.save(&mut snapshot).await.expect("save");

        let dest = dir.parent().expect("parent").join("snapshot-copy");
        manager.copy_to(&dest).expect("copy");
        let copy = CheckpointManager::new(&dest)
            .load()
            .await
            .expect("load copy")
            .expect("present");
        assert_eq!(copy.graph.node_count(), 3);
    }
}

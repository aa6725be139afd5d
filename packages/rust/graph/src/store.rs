//! In-memory graph store with merge/replace upserts and explicit invalidation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use samplegraph_shared::{
    CURRENT_SCHEMA_VERSION, Edge, EdgeKind, ItemId, ItemNode, MetadataUpdateMode, Result,
    SampleGraphError,
};

type EdgeKey = (ItemId, ItemId, EdgeKind);

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Serialized graph: a node table and an edge table under a schema version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub schema_version: u32,
    pub nodes: Vec<ItemNode>,
    pub edges: Vec<Edge>,
}

/// Result of [`GraphStore::import_topology`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub nodes: usize,
    pub edges: usize,
    /// Edges dropped for referencing a missing node or duplicating another.
    pub dropped_edges: usize,
}

/// Outcome of [`GraphStore::upsert_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Content identical; only `last_verified_at` refreshed.
    Unchanged,
}

/// A node removed by [`GraphStore::invalidate`].
#[derive(Debug, Clone)]
pub struct Invalidated {
    pub node: ItemNode,
    pub pruned_edges: usize,
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

/// Attributed graph of items and their relationships.
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    nodes: BTreeMap<ItemId, ItemNode>,
    edges: BTreeMap<EdgeKey, Edge>,
    adjacency: HashMap<ItemId, BTreeSet<EdgeKey>>,
    by_owner: HashMap<String, BTreeSet<ItemId>>,
    by_pack: HashMap<u64, BTreeSet<ItemId>>,
    update_mode: MetadataUpdateMode,
}

impl GraphStore {
    pub fn new(update_mode: MetadataUpdateMode) -> Self {
        Self {
            update_mode,
            ..Self::default()
        }
    }

    pub fn update_mode(&self) -> MetadataUpdateMode {
        self.update_mode
    }

    pub fn set_update_mode(&mut self, mode: MetadataUpdateMode) {
        self.update_mode = mode;
    }

    pub fn has_node(&self, id: ItemId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: ItemId) -> Option<&ItemNode> {
        self.nodes.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ItemNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn has_edge(&self, a: ItemId, b: ItemId, kind: EdgeKind) -> bool {
        self.edges.contains_key(&Edge::new(a, b, kind, 0.0).key())
    }

    /// Nodes uploaded by `username`.
    pub fn nodes_by_owner(&self, username: &str) -> impl Iterator<Item = ItemId> + '_ {
        self.by_owner.get(username).into_iter().flatten().copied()
    }

    /// Nodes belonging to pack `pack_id`.
    pub fn nodes_by_pack(&self, pack_id: u64) -> impl Iterator<Item = ItemId> + '_ {
        self.by_pack.get(&pack_id).into_iter().flatten().copied()
    }

    pub fn neighbors(&self, id: ItemId) -> BTreeSet<ItemId> {
        self.adjacency
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|key| self.edges.get(key).and_then(|e| e.other(id)))
            .collect()
    }

    pub fn degree(&self, id: ItemId) -> usize {
        self.adjacency.get(&id).map_or(0, BTreeSet::len)
    }

    pub fn edge_kind_counts(&self) -> BTreeMap<EdgeKind, usize> {
        let mut counts = BTreeMap::new();
        for key in self.edges.keys() {
            *counts.entry(key.2).or_insert(0) += 1;
        }
        counts
    }

    /// Insert a node, or apply re-fetched metadata to an existing one.
    pub fn upsert_node(&mut self, incoming: ItemNode) -> UpsertOutcome {
        let Some(existing) = self.nodes.get(&incoming.id).cloned() else {
            self.index(&incoming);
            self.nodes.insert(incoming.id, incoming);
            return UpsertOutcome::Inserted;
        };

        let updated = match self.update_mode {
            MetadataUpdateMode::Merge => merge(&existing, incoming),
            MetadataUpdateMode::Replace => incoming,
        };

        let unchanged = {
            let mut probe = updated.clone();
            probe.last_verified_at = existing.last_verified_at;
            probe == existing
        };

        if existing.username != updated.username || existing.pack_id != updated.pack_id {
            self.unindex(&existing);
            self.index(&updated);
        }
        self.nodes.insert(updated.id, updated);

        if unchanged {
            UpsertOutcome::Unchanged
        } else {
            UpsertOutcome::Updated
        }
    }

    /// Add an edge. Returns `false` for self-edges, duplicates, or missing endpoints.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if edge.source == edge.target {
            return false;
        }
        if !self.has_node(edge.source) || !self.has_node(edge.target) {
            debug!(source = %edge.source, target = %edge.target, "edge endpoint missing");
            return false;
        }
        let key = edge.key();
        if self.edges.contains_key(&key) {
            return false;
        }
        self.adjacency.entry(edge.source).or_default().insert(key);
        self.adjacency.entry(edge.target).or_default().insert(key);
        self.edges.insert(key, edge);
        true
    }

    /// Remove a node the source confirmed as gone, pruning its incident edges.
    pub fn invalidate(&mut self, id: ItemId) -> Option<Invalidated> {
        let node = self.nodes.remove(&id)?;
        self.unindex(&node);

        let keys = self.adjacency.remove(&id).unwrap_or_default();
        for key in &keys {
            self.edges.remove(key);
            let other = if key.0 == id { key.1 } else { key.0 };
            if let Some(set) = self.adjacency.get_mut(&other) {
                set.remove(key);
            }
        }

        Some(Invalidated {
            node,
            pruned_edges: keys.len(),
        })
    }

    pub fn export_topology(&self) -> Topology {
        Topology {
            schema_version: CURRENT_SCHEMA_VERSION,
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    /// Replace the store's contents with `topology`.
    pub fn import_topology(&mut self, topology: Topology) -> Result<ImportReport> {
        if topology.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(SampleGraphError::validation(format!(
                "topology schema_version {} not supported (max {CURRENT_SCHEMA_VERSION})",
                topology.schema_version
            )));
        }

        let mode = self.update_mode;
        *self = Self::new(mode);

        for node in topology.nodes {
            self.index(&node);
            self.nodes.insert(node.id, node);
        }

        let mut report = ImportReport {
            nodes: self.nodes.len(),
            ..ImportReport::default()
        };
        for edge in topology.edges {
            let edge = Edge::new(edge.source, edge.target, edge.kind, edge.weight);
            if self.add_edge(edge) {
                report.edges += 1;
            } else {
                report.dropped_edges += 1;
            }
        }

        if report.dropped_edges > 0 {
            warn!(dropped = report.dropped_edges, "dropped invalid edges on import");
        }
        Ok(report)
    }

    /// Build a store from a topology.
    pub fn from_topology(topology: Topology, mode: MetadataUpdateMode) -> Result<(Self, ImportReport)> {
        let mut store = Self::new(mode);
        let report = store.import_topology(topology)?;
        Ok((store, report))
    }

    fn index(&mut self, node: &ItemNode) {
        if !node.username.is_empty() {
            self.by_owner
                .entry(node.username.clone())
                .or_default()
                .insert(node.id);
        }
        if let Some(pack) = node.pack_id {
            self.by_pack.entry(pack).or_default().insert(node.id);
        }
    }

    fn unindex(&mut self, node: &ItemNode) {
        if let Some(set) = self.by_owner.get_mut(&node.username) {
            set.remove(&node.id);
            if set.is_empty() {
                self.by_owner.remove(&node.username);
            }
        }
        if let Some(pack) = node.pack_id {
            if let Some(set) = self.by_pack.get_mut(&pack) {
                set.remove(&node.id);
                if set.is_empty() {
                    self.by_pack.remove(&pack);
                }
            }
        }
    }
}

/// Field-wise merge: empty incoming fields keep the existing value.
fn merge(existing: &ItemNode, incoming: ItemNode) -> ItemNode {
    let mut previews = existing.previews.clone();
    previews.extend(incoming.previews);

    ItemNode {
        id: existing.id,
        name: if incoming.name.is_empty() {
            existing.name.clone()
        } else {
            incoming.name
        },
        tags: if incoming.tags.is_empty() {
            existing.tags.clone()
        } else {
            incoming.tags
        },
        duration: if incoming.duration > 0.0 {
            incoming.duration
        } else {
            existing.duration
        },
        username: if incoming.username.is_empty() {
            existing.username.clone()
        } else {
            incoming.username
        },
        pack_id: incoming.pack_id.or(existing.pack_id),
        num_downloads: incoming.num_downloads,
        num_ratings: incoming.num_ratings,
        avg_rating: incoming.avg_rating,
        previews,
        license: incoming.license.or_else(|| existing.license.clone()),
        last_verified_at: incoming.last_verified_at.max(existing.last_verified_at),
        discovered_via: existing.discovered_via,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use samplegraph_shared::DiscoveredVia;

    fn node(id: u64, user: &str, pack: Option<u64>) -> ItemNode {
        let mut n = ItemNode::new(ItemId(id), format!("sample-{id}.wav"), user);
        n.pack_id = pack;
        n
    }

    fn store_with(ids: &[u64]) -> GraphStore {
        let mut store = GraphStore::new(MetadataUpdateMode::Merge);
        for id in ids {
            store.upsert_node(node(*id, "alice", None));
        }
        store
    }

    #[test]
    fn upsert_inserts_then_reports_unchanged() {
        let mut store = GraphStore::new(MetadataUpdateMode::Merge);
        let n = node(1, "alice", Some(7));
        assert_eq!(store.upsert_node(n.clone()), UpsertOutcome::Inserted);

        let mut again = n.clone();
        again.last_verified_at = n.last_verified_at + Duration::hours(1);
        assert_eq!(store.upsert_node(again.clone()), UpsertOutcome::Unchanged);
        assert_eq!(store.node_count(), 1);
        assert_eq!(store.node(ItemId(1)).unwrap().last_verified_at, again.last_verified_at);
    }

    #[test]
    fn merge_preserves_absent_fields() {
        let mut store = GraphStore::new(MetadataUpdateMode::Merge);
        let mut original = node(1, "alice", Some(7));
        original.tags = ["kick".to_string()].into_iter().collect();
        original.license = Some("cc0".into());
        original.discovered_via = DiscoveredVia::PackEdge;
        store.upsert_node(original);

        let mut partial = ItemNode::new(ItemId(1), "", "");
        partial.num_downloads = 99;
        partial.discovered_via = DiscoveredVia::Search;
        assert_eq!(store.upsert_node(partial), UpsertOutcome::Updated);

        let merged = store.node(ItemId(1)).unwrap();
        assert_eq!(merged.name, "sample-1.wav");
        assert_eq!(merged.username, "alice");
        assert_eq!(merged.pack_id, Some(7));
        assert_eq!(merged.license.as_deref(), Some("cc0"));
        assert_eq!(merged.num_downloads, 99);
        assert_eq!(merged.discovered_via, DiscoveredVia::PackEdge);
        assert_eq!(merged.tags.len(), 1);
    }

    #[test]
    fn replace_overwrites_everything() {
        let mut store = GraphStore::new(MetadataUpdateMode::Replace);
        let mut original = node(1, "alice", Some(7));
        original.license = Some("cc0".into());
        store.upsert_node(original);

        let replacement = node(1, "bob", None);
        assert_eq!(store.upsert_node(replacement), UpsertOutcome::Updated);

        let stored = store.node(ItemId(1)).unwrap();
        assert_eq!(stored.username, "bob");
        assert_eq!(stored.pack_id, None);
        assert_eq!(stored.license, None);
        assert_eq!(store.nodes_by_owner("alice").count(), 0);
        assert_eq!(store.nodes_by_owner("bob").collect::<Vec<_>>(), vec![ItemId(1)]);
        assert_eq!(store.nodes_by_pack(7).count(), 0);
    }

    #[test]
    fn add_edge_dedups_regardless_of_direction() {
        let mut store = store_with(&[1, 2]);
        assert!(store.add_edge(Edge::new(ItemId(1), ItemId(2), EdgeKind::User, 1.0)));
        assert!(!store.add_edge(Edge::new(ItemId(2), ItemId(1), EdgeKind::User, 1.0)));
        assert!(store.add_edge(Edge::new(ItemId(2), ItemId(1), EdgeKind::Tag, 0.4)));
        assert_eq!(store.edge_count(), 2);
        assert_eq!(store.degree(ItemId(1)), 2);
        assert!(store.has_edge(ItemId(2), ItemId(1), EdgeKind::User));
    }

    #[test]
    fn add_edge_rejects_self_and_dangling() {
        let mut store = store_with(&[1]);
        assert!(!store.add_edge(Edge::new(ItemId(1), ItemId(1), EdgeKind::User, 1.0)));
        assert!(!store.add_edge(Edge::new(ItemId(1), ItemId(5), EdgeKind::Pack, 1.0)));
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn invalidate_prunes_incident_edges() {
        let mut store = store_with(&[1, 2, 3]);
        store.add_edge(Edge::new(ItemId(1), ItemId(2), EdgeKind::User, 1.0));
        store.add_edge(Edge::new(ItemId(1), ItemId(3), EdgeKind::User, 1.0));
        store.add_edge(Edge::new(ItemId(2), ItemId(3), EdgeKind::User, 1.0));

        let removed = store.invalidate(ItemId(1)).expect("node existed");
        assert_eq!(removed.pruned_edges, 2);
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.edge_count(), 1);
        assert_eq!(store.neighbors(ItemId(2)), [ItemId(3)].into_iter().collect());
        assert_eq!(store.nodes_by_owner("alice").count(), 2);
        assert!(store.invalidate(ItemId(1)).is_none());
    }

    #[test]
    fn topology_export_import_preserves_sets() {
        let mut store = store_with(&[1, 2, 3]);
        store.add_edge(Edge::new(ItemId(1), ItemId(2), EdgeKind::User, 1.0));
        store.add_edge(Edge::new(ItemId(3), ItemId(2), EdgeKind::Tag, 0.5));

        let topology = store.export_topology();
        let json = serde_json::to_string(&topology).expect("serialize");
        let parsed: Topology = serde_json::from_str(&json).expect("deserialize");

        let (restored, report) =
            GraphStore::from_topology(parsed, MetadataUpdateMode::Merge).expect("import");
        assert_eq!(report.nodes, 3);
        assert_eq!(report.edges, 2);
        assert_eq!(report.dropped_edges, 0);
        assert_eq!(restored.export_topology(), topology);
        assert_eq!(restored.nodes_by_owner("alice").count(), 3);
    }

    #[test]
    fn import_drops_dangling_edges_and_rejects_future_schema() {
        let topology = Topology {
            schema_version: CURRENT_SCHEMA_VERSION,
            nodes: vec![node(1, "alice", None)],
            edges: vec![Edge::new(ItemId(1), ItemId(2), EdgeKind::User, 1.0)],
        };
        let (store, report) =
            GraphStore::from_topology(topology, MetadataUpdateMode::Merge).expect("import");
        assert_eq!(store.edge_count(), 0);
        assert_eq!(report.dropped_edges, 1);

        let future = Topology {
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            ..Topology::default()
        };
        assert!(GraphStore::from_topology(future, MetadataUpdateMode::Merge).is_err());
    }

    #[test]
    fn merge_keeps_newest_verification_time() {
        let mut store = GraphStore::new(MetadataUpdateMode::Merge);
        let n = node(1, "alice", None);
        let fresh = n.last_verified_at;
        store.upsert_node(n.clone());

        let mut stale = n;
        stale.last_verified_at = Utc::now() - Duration::days(3);
        store.upsert_node(stale);
        assert_eq!(store.node(ItemId(1)).unwrap().last_verified_at, fresh);
    }
}

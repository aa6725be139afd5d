//! Relationship discovery for a freshly ingested item.

use std::collections::VecDeque;

use tracing::{debug, warn};

use samplegraph_graph::{EnqueueOutcome, GraphStore, similarity};
use samplegraph_shared::{
    ApiError, DiscoveredVia, Edge, EdgeKind, ItemId, PendingItem, RunConfig,
};
use samplegraph_storage::CheckpointSnapshot;

use crate::catalog::SearchPage;
use crate::client::ApiClient;

/// Edges added for one item, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeCounts {
    pub user: usize,
    pub pack: usize,
    pub tag: usize,
}

impl EdgeCounts {
    pub fn total(&self) -> usize {
        self.user + self.pack + self.tag
    }
}

/// Adds user/pack/tag edges and enqueues related candidates.
#[derive(Debug, Clone)]
pub struct EdgeDiscovery {
    include_user: bool,
    include_pack: bool,
    include_tag: bool,
    threshold: f64,
    window_size: usize,
    /// Recently ingested items compared for tag similarity.
    window: VecDeque<ItemId>,
    listing_page_size: u32,
}

impl EdgeDiscovery {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            include_user: config.include_user_edges,
            include_pack: config.include_pack_edges,
            include_tag: config.include_tag_edges,
            threshold: config.tag_similarity_threshold,
            window_size: config.tag_window_size,
            window: VecDeque::new(),
            listing_page_size: config.page_size,
        }
    }

    /// Seed the tag window with the most recently verified nodes of `graph`.
    pub fn prime(&mut self, graph: &GraphStore) {
        let mut recent: Vec<_> = graph
            .nodes()
            .map(|n| (n.last_verified_at, n.id))
            .collect();
        recent.sort();
        self.window = recent
            .into_iter()
            .rev()
            .take(self.window_size)
            .map(|(_, id)| id)
            .rev()
            .collect();
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Add every qualifying edge between `id` and the rest of the graph.
    pub fn link(&mut self, graph: &mut GraphStore, id: ItemId) -> EdgeCounts {
        let mut counts = EdgeCounts::default();
        let Some(node) = graph.node(id) else {
            return counts;
        };

        let owner_peers: Vec<ItemId> = if self.include_user && !node.username.is_empty() {
            graph.nodes_by_owner(&node.username).filter(|m| *m != id).collect()
        } else {
            Vec::new()
        };
        let pack_peers: Vec<ItemId> = match (self.include_pack, node.pack_id) {
            (true, Some(pack)) => graph.nodes_by_pack(pack).filter(|m| *m != id).collect(),
            _ => Vec::new(),
        };
        let tag_peers: Vec<(ItemId, f64)> = if self.include_tag && !node.tags.is_empty() {
            self.window
                .iter()
                .filter(|m| **m != id)
                .filter_map(|m| graph.node(*m).map(|other| (*m, similarity::jaccard(&node.tags, &other.tags))))
                .filter(|(_, score)| similarity::qualifies(*score, self.threshold))
                .collect()
        } else {
            Vec::new()
        };

        for peer in owner_peers {
            if graph.add_edge(Edge::new(id, peer, EdgeKind::User, 1.0)) {
                counts.user += 1;
            }
        }
        for peer in pack_peers {
            if graph.add_edge(Edge::new(id, peer, EdgeKind::Pack, 1.0)) {
                counts.pack += 1;
            }
        }
        for (peer, score) in tag_peers {
            if graph.add_edge(Edge::new(id, peer, EdgeKind::Tag, score)) {
                counts.tag += 1;
            }
        }

        if self.include_tag && !self.window.contains(&id) {
            self.window.push_back(id);
            while self.window.len() > self.window_size {
                self.window.pop_front();
            }
        }

        debug!(%id, user = counts.user, pack = counts.pack, tag = counts.tag, "edges linked");
        counts
    }

    /// List the item's pack and owner once each and enqueue unseen ids.
    ///
    /// Returns how many records were enqueued. Only budget exhaustion is
    /// surfaced; other listing failures are logged.
    pub async fn enqueue_related(
        &self,
        client: &mut ApiClient,
        state: &mut CheckpointSnapshot,
        id: ItemId,
    ) -> Result<usize, ApiError> {
        let Some(node) = state.graph.node(id) else {
            return Ok(0);
        };
        let owner = node.username.clone();
        let pack = node.pack_id;
        let mut enqueued = 0;

        if self.include_pack {
            if let Some(pack) = pack.filter(|p| !state.listed_packs.contains(p)) {
                match client.pack_items(pack, self.listing_page_size).await {
                    Ok(page) => {
                        state.listed_packs.insert(pack);
                        enqueued += enqueue_page(state, &page, DiscoveredVia::PackEdge);
                    }
                    Err(e) => listing_failed(state, Listing::Pack(pack), e)?,
                }
            }
        }

        if self.include_user && !owner.is_empty() && !state.listed_owners.contains(&owner) {
            match client.user_items(&owner, self.listing_page_size).await {
                Ok(page) => {
                    state.listed_owners.insert(owner);
                    enqueued += enqueue_page(state, &page, DiscoveredVia::UserEdge);
                }
                Err(e) => listing_failed(state, Listing::Owner(owner), e)?,
            }
        }

        Ok(enqueued)
    }
}

enum Listing {
    Pack(u64),
    Owner(String),
}

fn enqueue_page(state: &mut CheckpointSnapshot, page: &SearchPage, via: DiscoveredVia) -> usize {
    let mut enqueued = 0;
    for result in &page.results {
        let id = result.item_id();
        if state.processed.contains(&id) || state.graph.has_node(id) {
            continue;
        }
        let outcome = state.pending.push(PendingItem::new(id, via));
        if !matches!(outcome, EnqueueOutcome::Dropped | EnqueueOutcome::Duplicate) {
            enqueued += 1;
        }
    }
    enqueued
}

/// Budget exhaustion propagates. A permanent failure marks the listing done
/// so it is not retried; a transient one leaves it for a later item.
fn listing_failed(state: &mut CheckpointSnapshot, listing: Listing, err: ApiError) -> Result<(), ApiError> {
    match err {
        ApiError::BudgetExhausted { .. } => Err(err),
        ApiError::Permanent { .. } | ApiError::Decode { .. } => {
            warn!(error = %err, "listing failed permanently");
            match listing {
                Listing::Pack(pack) => {
                    state.listed_packs.insert(pack);
                }
                Listing::Owner(owner) => {
                    state.listed_owners.insert(owner);
                }
            }
            Ok(())
        }
        ApiError::Transient { .. } => {
            warn!(error = %err, "listing failed, will retry on a later item");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{FakeTransport, client, ok};
    use samplegraph_shared::{ItemNode, MetadataUpdateMode};
    use serde_json::json;

    fn node(id: u64, user: &str, pack: Option<u64>, tags: &[&str]) -> ItemNode {
        let mut n = ItemNode::new(ItemId(id), format!("item-{id}"), user);
        n.pack_id = pack;
        n.tags = tags.iter().map(|t| t.to_string()).collect();
        n
    }

    fn config() -> RunConfig {
        RunConfig {
            tag_similarity_threshold: 0.3,
            ..RunConfig::default()
        }
    }

    #[test]
    fn links_user_and_pack_edges() {
        let mut graph = GraphStore::new(MetadataUpdateMode::Merge);
        graph.upsert_node(node(1, "alice", Some(10), &[]));
        graph.upsert_node(node(2, "alice", None, &[]));
        graph.upsert_node(node(3, "bob", Some(10), &[]));
        graph.upsert_node(node(4, "alice", Some(10), &[]));

        let mut edges = EdgeDiscovery::new(&config());
        let counts = edges.link(&mut graph, ItemId(4));
        assert_eq!(counts.user, 2);
        assert_eq!(counts.pack, 2);
        assert!(graph.has_edge(ItemId(1), ItemId(4), EdgeKind::User));
        assert!(graph.has_edge(ItemId(3), ItemId(4), EdgeKind::Pack));

        // Linking again adds nothing.
        assert_eq!(edges.link(&mut graph, ItemId(4)).total(), 0);
    }

    /// Jaccard 0.25 stays below a 0.3 threshold; 0.35 clears it.
    #[test]
    fn tag_edges_respect_threshold() {
        let mut graph = GraphStore::new(MetadataUpdateMode::Merge);
        // 1 of 4 tags shared: 0.25.
        graph.upsert_node(node(1, "a", None, &["kick", "x1", "x2"]));
        graph.upsert_node(node(2, "b", None, &["kick", "y1"]));
        let mut edges = EdgeDiscovery::new(&config());
        edges.link(&mut graph, ItemId(1));
        assert_eq!(edges.link(&mut graph, ItemId(2)).tag, 0);
        assert!(!graph.has_edge(ItemId(1), ItemId(2), EdgeKind::Tag));

        // 7 of 20 tags shared: 0.35.
        let shared: Vec<String> = (0..7).map(|i| format!("s{i}")).collect();
        let mut left: Vec<String> = shared.clone();
        left.extend((0..7).map(|i| format!("l{i}")));
        let mut right: Vec<String> = shared;
        right.extend((0..6).map(|i| format!("r{i}")));
        let left: Vec<&str> = left.iter().map(String::as_str).collect();
        let right: Vec<&str> = right.iter().map(String::as_str).collect();
        graph.upsert_node(node(3, "c", None, &left));
        graph.upsert_node(node(4, "d", None, &right));
        edges.link(&mut graph, ItemId(3));
        let counts = edges.link(&mut graph, ItemId(4));
        assert_eq!(counts.tag, 1);
        let tag_edge = graph
            .edges()
            .find(|e| e.kind == EdgeKind::Tag)
            .expect("tag edge");
        assert_eq!((tag_edge.source, tag_edge.target), (ItemId(3), ItemId(4)));
        assert!((tag_edge.weight - 0.35).abs() < 1e-9, "weight {}", tag_edge.weight);
        assert_eq!(graph.edges().filter(|e| e.kind == EdgeKind::Tag).count(), 1);
    }

    #[test]
    fn tag_window_is_bounded() {
        let mut graph = GraphStore::new(MetadataUpdateMode::Merge);
        let mut edges = EdgeDiscovery::new(&RunConfig {
            tag_window_size: 1,
            ..config()
        });
        for id in 1..=3 {
            graph.upsert_node(node(id, &format!("u{id}"), None, &["kick"]));
            edges.link(&mut graph, ItemId(id));
        }
        assert_eq!(edges.window_len(), 1);
        // 3 compared only with 2, since 1 had left the window.
        assert!(graph.has_edge(ItemId(2), ItemId(3), EdgeKind::Tag));
        assert!(!graph.has_edge(ItemId(1), ItemId(3), EdgeKind::Tag));
    }

    #[tokio::test]
    async fn enqueue_related_lists_once() {
        let transport = FakeTransport::default();
        transport.always(
            "packs/10/sounds/",
            ok(json!({"count": 2, "next": null, "results": [{"id": 1}, {"id": 20}]})),
        );
        transport.always(
            "users/alice/sounds/",
            ok(json!({"count": 2, "next": null, "results": [{"id": 20}, {"id": 30}]})),
        );
        let mut client = client(&transport, 10);
        let mut state = CheckpointSnapshot::empty(MetadataUpdateMode::Merge, 100);
        state.graph.upsert_node(node(1, "alice", Some(10), &[]));
        state.processed.insert(ItemId(1));

        let edges = EdgeDiscovery::new(&config());
        let enqueued = edges
            .enqueue_related(&mut client, &mut state, ItemId(1))
            .await
            .expect("enqueue");
        assert_eq!(enqueued, 2);
        assert_eq!(state.pending.len(), 2);
        let first = state.pending.pop().expect("first");
        assert_eq!(first.id, ItemId(20));
        assert_eq!(first.reason, DiscoveredVia::PackEdge);

        // Already listed: no further requests.
        edges
            .enqueue_related(&mut client, &mut state, ItemId(1))
            .await
            .expect("enqueue again");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn missing_pack_listing_is_not_retried() {
        let transport = FakeTransport::default();
        transport.always(
            "users/alice/sounds/",
            ok(json!({"count": 0, "next": null, "results": []})),
        );
        let mut client = client(&transport, 10);
        let mut state = CheckpointSnapshot::empty(MetadataUpdateMode::Merge, 100);
        state.graph.upsert_node(node(1, "alice", Some(10), &[]));

        let edges = EdgeDiscovery::new(&config());
        edges
            .enqueue_related(&mut client, &mut state, ItemId(1))
            .await
            .expect("permanent failures are absorbed");
        assert!(state.listed_packs.contains(&10));
        assert!(state.listed_owners.contains("alice"));
    }

    #[tokio::test]
    async fn budget_exhaustion_propagates() {
        let transport = FakeTransport::default();
        let mut client = client(&transport, 0);
        let mut state = CheckpointSnapshot::empty(MetadataUpdateMode::Merge, 100);
        state.graph.upsert_node(node(1, "alice", Some(10), &[]));

        let edges = EdgeDiscovery::new(&config());
        let err = edges
            .enqueue_related(&mut client, &mut state, ItemId(1))
            .await
            .expect_err("budget");
        assert!(matches!(err, ApiError::BudgetExhausted { .. }));
        assert!(state.listed_packs.is_empty());
    }
}

//! Tag-set similarity.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use samplegraph_shared::{Edge, EdgeKind, ItemId, ItemNode};

/// Jaccard similarity `|A ∩ B| / |A ∪ B|`. Two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Whether a similarity score qualifies for a tag edge.
///
/// Sets with no tag in common never qualify, even at a zero threshold.
pub fn qualifies(score: f64, threshold: f64) -> bool {
    score > 0.0 && score >= threshold
}

/// Derive every tag edge among `nodes` whose Jaccard score reaches `threshold`.
///
/// Only pairs sharing at least one tag are compared, via an inverted tag index.
pub fn tag_similarity_edges<'a>(
    nodes: impl IntoIterator<Item = &'a ItemNode>,
    threshold: f64,
) -> Vec<Edge> {
    let nodes: BTreeMap<ItemId, &ItemNode> = nodes.into_iter().map(|n| (n.id, n)).collect();

    let mut by_tag: BTreeMap<&str, Vec<ItemId>> = BTreeMap::new();
    for node in nodes.values() {
        for tag in &node.tags {
            by_tag.entry(tag.as_str()).or_default().push(node.id);
        }
    }

    let mut compared: HashSet<(ItemId, ItemId)> = HashSet::new();
    let mut edges = Vec::new();
    for ids in by_tag.values() {
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                let pair = if a < b { (*a, *b) } else { (*b, *a) };
                if !compared.insert(pair) {
                    continue;
                }
                let score = jaccard(&nodes[&pair.0].tags, &nodes[&pair.1].tags);
                if qualifies(score, threshold) {
                    edges.push(Edge::new(pair.0, pair.1, EdgeKind::Tag, score));
                }
            }
        }
    }
    edges.sort_by_key(|e| (e.source, e.target));
    edges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn node(id: u64, tag_list: &[&str]) -> ItemNode {
        let mut n = ItemNode::new(ItemId(id), format!("item-{id}"), "someone");
        n.tags = tags(tag_list);
        n
    }

    #[test]
    fn jaccard_basic() {
        let a = tags(&["kick", "drum", "808"]);
        let b = tags(&["kick", "drum", "acoustic"]);
        assert!((jaccard(&a, &b) - 0.5).abs() < f64::EPSILON);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&tags(&[]), &tags(&[])), 0.0);
        assert_eq!(jaccard(&a, &tags(&["field-recording"])), 0.0);
    }

    #[test]
    fn threshold_is_inclusive_and_requires_overlap() {
        assert!(!qualifies(0.25, 0.3));
        assert!(qualifies(0.35, 0.3));
        assert!(qualifies(0.3, 0.3));
        assert!(!qualifies(0.0, 0.0));
    }

    #[test]
    fn batch_edges_only_for_overlapping_pairs() {
        // 1 and 2 share 2 of 4 tags (0.5); 1 and 3 share 1 of 5 (0.2); 4 shares nothing.
        let nodes = vec![
            node(1, &["kick", "drum", "808"]),
            node(2, &["kick", "drum", "acoustic"]),
            node(3, &["kick", "bass", "synth"]),
            node(4, &["rain"]),
        ];
        let edges = tag_similarity_edges(&nodes, 0.3);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].key(), (ItemId(1), ItemId(2), EdgeKind::Tag));
        assert!((edges[0].weight - 0.5).abs() < f64::EPSILON);

        let loose = tag_similarity_edges(&nodes, 0.1);
        assert_eq!(loose.len(), 3);
    }
}

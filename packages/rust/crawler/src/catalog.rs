//! Wire shapes of the catalog API.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;
use serde::Deserialize;

use samplegraph_shared::{DiscoveredVia, ItemId, ItemNode};

/// Field list requested on every item-bearing endpoint.
pub const FIELDS: &str =
    "id,name,tags,duration,username,pack,num_downloads,num_ratings,avg_rating,previews,license";

/// Pack reference: either the bare id or the pack's API URL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PackRef {
    Id(u64),
    Url(String),
}

impl PackRef {
    /// Numeric pack id; for a URL, the last non-empty path segment.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Url(url) => url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .and_then(|segment| segment.parse().ok()),
        }
    }
}

/// One item as returned by `sounds/{id}/` or inside a result page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ItemPayload {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub pack: Option<PackRef>,
    #[serde(default)]
    pub num_downloads: u64,
    #[serde(default)]
    pub num_ratings: u64,
    #[serde(default)]
    pub avg_rating: f64,
    #[serde(default)]
    pub previews: BTreeMap<String, String>,
    #[serde(default)]
    pub license: Option<String>,
}

impl ItemPayload {
    pub fn item_id(&self) -> ItemId {
        ItemId(self.id)
    }

    /// Build a graph node, verified now. Tags are lowercased and trimmed.
    pub fn into_node(self, via: DiscoveredVia) -> ItemNode {
        ItemNode {
            id: ItemId(self.id),
            pack_id: self.pack.as_ref().and_then(PackRef::id),
            name: self.name,
            tags: self
                .tags
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            duration: self.duration,
            username: self.username,
            num_downloads: self.num_downloads,
            num_ratings: self.num_ratings,
            avg_rating: self.avg_rating,
            previews: self.previews,
            license: self.license.filter(|l| !l.is_empty()),
            last_verified_at: Utc::now(),
            discovered_via: via,
        }
    }
}

/// A page of search or listing results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<ItemPayload>,
}

impl SearchPage {
    /// No further page follows this one.
    pub fn is_last(&self) -> bool {
        self.results.is_empty() || self.next.is_none()
    }
}

/// Downloads descending, then rating descending, then id ascending.
pub fn popularity_order(a: &ItemPayload, b: &ItemPayload) -> Ordering {
    b.num_downloads
        .cmp(&a.num_downloads)
        .then_with(|| b.avg_rating.total_cmp(&a.avg_rating))
        .then_with(|| a.id.cmp(&b.id))
}

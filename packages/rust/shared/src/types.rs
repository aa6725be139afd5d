//! Core domain types for the sample relationship graph.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for the checkpoint topology and metadata files.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// ItemId / RunId
// ---------------------------------------------------------------------------

/// Stable catalog identifier of an item (sample).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u64> for ItemId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A UUID v7 wrapper identifying one crawl run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// How an item first entered the graph (or the queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveredVia {
    Search,
    UserEdge,
    PackEdge,
    TagEdge,
}

impl DiscoveredVia {
    /// Queue priority hint for candidates found this way.
    pub fn default_priority(self) -> u8 {
        match self {
            Self::PackEdge => 3,
            Self::UserEdge => 2,
            Self::TagEdge | Self::Search => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::UserEdge => "user-edge",
            Self::PackEdge => "pack-edge",
            Self::TagEdge => "tag-edge",
        }
    }
}

impl std::str::FromStr for DiscoveredVia {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "search" => Ok(Self::Search),
            "user-edge" => Ok(Self::UserEdge),
            "pack-edge" => Ok(Self::PackEdge),
            "tag-edge" => Ok(Self::TagEdge),
            other => Err(format!("unknown discovery reason: {other}")),
        }
    }
}

/// Kind of relationship between two items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Same uploader.
    User,
    /// Same pack.
    Pack,
    /// Tag sets overlap above the similarity threshold.
    Tag,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Pack => "pack",
            Self::Tag => "tag",
        }
    }
}

/// Strategy governing which item IDs are chosen for the next fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    #[default]
    Search,
    Relationships,
    Mixed,
}

impl DiscoveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Relationships => "relationships",
            Self::Mixed => "mixed",
        }
    }

    /// Whether this mode consumes the pending-item queue.
    pub fn uses_queue(self) -> bool {
        !matches!(self, Self::Search)
    }
}

impl std::fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DiscoveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "search" => Ok(Self::Search),
            "relationships" => Ok(Self::Relationships),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!(
                "unknown discovery mode '{other}' (expected search, relationships or mixed)"
            )),
        }
    }
}

/// How re-fetched metadata is applied to an existing node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataUpdateMode {
    /// Keep existing fields the incoming record leaves empty.
    #[default]
    Merge,
    /// Overwrite every field.
    Replace,
}

// ---------------------------------------------------------------------------
// ItemNode
// ---------------------------------------------------------------------------

/// A catalog item stored as a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemNode {
    pub id: ItemId,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Duration in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Owner handle.
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<u64>,
    #[serde(default)]
    pub num_downloads: u64,
    #[serde(default)]
    pub num_ratings: u64,
    #[serde(default)]
    pub avg_rating: f64,
    /// Preview kind (e.g. `preview-hq-mp3`) to media URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub previews: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub last_verified_at: DateTime<Utc>,
    pub discovered_via: DiscoveredVia,
}

impl ItemNode {
    /// Minimal node with the given identity; counters and media left empty.
    pub fn new(id: ItemId, name: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            tags: BTreeSet::new(),
            duration: 0.0,
            username: username.into(),
            pack_id: None,
            num_downloads: 0,
            num_ratings: 0,
            avg_rating: 0.0,
            previews: BTreeMap::new(),
            license: None,
            last_verified_at: Utc::now(),
            discovered_via: DiscoveredVia::Search,
        }
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// An undirected, immutable relationship between two items.
///
/// Endpoints are normalised so `source < target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: ItemId,
    pub target: ItemId,
    pub kind: EdgeKind,
    pub weight: f64,
}

impl Edge {
    pub fn new(a: ItemId, b: ItemId, kind: EdgeKind, weight: f64) -> Self {
        let (source, target) = if a <= b { (a, b) } else { (b, a) };
        Self {
            source,
            target,
            kind,
            weight,
        }
    }

    /// Dedup key.
    pub fn key(&self) -> (ItemId, ItemId, EdgeKind) {
        (self.source, self.target, self.kind)
    }

    /// The endpoint opposite `id`, if `id` is an endpoint.
    pub fn other(&self, id: ItemId) -> Option<ItemId> {
        if self.source == id {
            Some(self.target)
        } else if self.target == id {
            Some(self.source)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// PendingItem
// ---------------------------------------------------------------------------

/// A discovered-but-unfetched candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
    pub id: ItemId,
    pub reason: DiscoveredVia,
    /// Higher is fetched sooner.
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingItem {
    pub fn new(id: ItemId, reason: DiscoveredVia) -> Self {
        Self::with_priority(id, reason, reason.default_priority())
    }

    pub fn with_priority(id: ItemId, reason: DiscoveredVia, priority: u8) -> Self {
        Self {
            id,
            reason,
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// SearchCursor
// ---------------------------------------------------------------------------

/// Position in the paginated search, persisted so later runs continue paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCursor {
    pub query: String,
    pub sort: String,
    /// Next page to fetch (1-based).
    pub page: u32,
    /// No further pages for this query/sort.
    #[serde(default)]
    pub exhausted: bool,
}

impl SearchCursor {
    pub fn new(query: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            sort: sort.into(),
            page: 1,
            exhausted: false,
        }
    }

    /// Whether this cursor was built for the given query and sort.
    pub fn matches(&self, query: &str, sort: &str) -> bool {
        self.query == query && self.sort == sort
    }
}

impl Default for SearchCursor {
    fn default() -> Self {
        Self::new("", "downloads_desc")
    }
}

// ---------------------------------------------------------------------------
// RunStats
// ---------------------------------------------------------------------------

/// The `metadata.json` structure stored in each checkpoint directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Run that wrote this checkpoint.
    pub run_id: RunId,
    pub nodes: usize,
    pub edges: usize,
    pub processed_count: usize,
    pub pending_count: usize,
    /// API calls issued by the run that wrote this checkpoint.
    #[serde(default)]
    pub requests_made: u32,
    /// Runs that finished and saved a final checkpoint.
    #[serde(default)]
    pub runs_completed: u64,
    pub timestamp: DateTime<Utc>,
    pub discovery_mode: DiscoveryMode,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id: RunId::new(),
            nodes: 0,
            edges: 0,
            processed_count: 0,
            pending_count: 0,
            requests_made: 0,
            runs_completed: 0,
            timestamp: Utc::now(),
            discovery_mode: DiscoveryMode::default(),
        }
    }
}

//! Application configuration for SampleGraph.
//!
//! User config lives at `~/.samplegraph/samplegraph.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SampleGraphError};
use crate::types::{DiscoveryMode, ItemId, MetadataUpdateMode};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "samplegraph.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".samplegraph";

/// Provider-side ceiling on requests per day.
pub const DEFAULT_DAILY_REQUEST_CAP: u32 = 2000;

// ---------------------------------------------------------------------------
// Config structs (matching samplegraph.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub crawl: CrawlSection,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub milestone: MilestoneConfig,
}

/// `[crawl]` section: per-run discovery options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    #[serde(default)]
    pub discovery_mode: DiscoveryMode,

    /// Probability of drawing from the relationship queue in mixed mode.
    #[serde(default = "default_relationship_priority")]
    pub relationship_priority: f64,

    /// Per-run API call ceiling.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    #[serde(default = "default_daily_request_cap")]
    pub daily_request_cap: u32,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Save a checkpoint after this many processed items.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    #[serde(default = "default_max_pending_nodes")]
    pub max_pending_nodes: usize,

    #[serde(default = "default_fetch_pending_batch_size")]
    pub fetch_pending_batch_size: usize,

    #[serde(default = "default_true")]
    pub include_user_edges: bool,

    #[serde(default = "default_true")]
    pub include_pack_edges: bool,

    #[serde(default = "default_true")]
    pub include_tag_edges: bool,

    #[serde(default = "default_tag_similarity_threshold")]
    pub tag_similarity_threshold: f64,

    /// Recent nodes compared against for tag similarity.
    #[serde(default = "default_tag_window_size")]
    pub tag_window_size: usize,

    #[serde(default)]
    pub metadata_update_mode: MetadataUpdateMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_item_id: Option<u64>,

    #[serde(default)]
    pub search_query: String,

    #[serde(default = "default_search_sort")]
    pub search_sort: String,

    /// Wall-clock budget for one run, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_secs: Option<u64>,

    /// Stale nodes re-verified at the start of each run.
    #[serde(default)]
    pub reverify_per_run: usize,

    /// Secondary backup cadence in newly-added nodes.
    #[serde(default = "default_auto_backup_every")]
    pub auto_backup_every: usize,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            discovery_mode: DiscoveryMode::default(),
            relationship_priority: default_relationship_priority(),
            max_requests: default_max_requests(),
            daily_request_cap: default_daily_request_cap(),
            page_size: default_page_size(),
            checkpoint_interval: default_checkpoint_interval(),
            max_pending_nodes: default_max_pending_nodes(),
            fetch_pending_batch_size: default_fetch_pending_batch_size(),
            include_user_edges: true,
            include_pack_edges: true,
            include_tag_edges: true,
            tag_similarity_threshold: default_tag_similarity_threshold(),
            tag_window_size: default_tag_window_size(),
            metadata_update_mode: MetadataUpdateMode::default(),
            seed_item_id: None,
            search_query: String::new(),
            search_sort: default_search_sort(),
            max_runtime_secs: None,
            reverify_per_run: 0,
            auto_backup_every: default_auto_backup_every(),
        }
    }
}

fn default_relationship_priority() -> f64 {
    0.7
}
fn default_max_requests() -> u32 {
    1800
}
fn default_daily_request_cap() -> u32 {
    DEFAULT_DAILY_REQUEST_CAP
}
fn default_page_size() -> u32 {
    150
}
fn default_checkpoint_interval() -> u32 {
    50
}
fn default_max_pending_nodes() -> usize {
    10_000
}
fn default_fetch_pending_batch_size() -> usize {
    50
}
fn default_tag_similarity_threshold() -> f64 {
    0.3
}
fn default_tag_window_size() -> usize {
    500
}
fn default_search_sort() -> String {
    "downloads_desc".into()
}
fn default_auto_backup_every() -> usize {
    100
}
fn default_true() -> bool {
    true
}

/// `[api]` section: remote catalog access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Total attempts per call for retryable failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            api_key_env: default_api_key_env(),
            requests_per_minute: default_requests_per_minute(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://freesound.org/apiv2/".into()
}
fn default_api_key_env() -> String {
    "FREESOUND_API_KEY".into()
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[checkpoint]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Primary checkpoint directory.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,

    /// Secondary (automatic) backup directory.
    #[serde(default = "default_auto_backup_dir")]
    pub auto_backup_dir: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            auto_backup_dir: default_auto_backup_dir(),
        }
    }
}

fn default_checkpoint_dir() -> String {
    "~/.samplegraph/checkpoint".into()
}
fn default_auto_backup_dir() -> String {
    "~/.samplegraph/checkpoint-auto".into()
}

/// `[backup]` section: release-asset store for checkpoint archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_backup_api_base")]
    pub api_base: String,

    #[serde(default = "default_backup_upload_base")]
    pub upload_base: String,

    /// `owner/name` of the repository holding the release.
    #[serde(default)]
    pub repository: String,

    /// Release tag the checkpoint assets are attached to.
    #[serde(default = "default_backup_tag")]
    pub tag: String,

    #[serde(default = "default_backup_token_env")]
    pub token_env: String,

    /// Rolling retention window.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: default_backup_api_base(),
            upload_base: default_backup_upload_base(),
            repository: String::new(),
            tag: default_backup_tag(),
            token_env: default_backup_token_env(),
            keep_recent: default_keep_recent(),
        }
    }
}

fn default_backup_api_base() -> String {
    "https://api.github.com".into()
}
fn default_backup_upload_base() -> String {
    "https://uploads.github.com".into()
}
fn default_backup_tag() -> String {
    "checkpoints".into()
}
fn default_backup_token_env() -> String {
    "GITHUB_TOKEN".into()
}
fn default_keep_recent() -> usize {
    5
}

/// `[milestone]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneConfig {
    /// Node-count multiple that triggers post-processing.
    #[serde(default = "default_boundary")]
    pub boundary: u64,

    #[serde(default = "default_milestone_dir")]
    pub output_dir: String,

    /// External commands replacing the built-in jobs.
    #[serde(default)]
    pub commands: MilestoneCommands,
}

impl Default for MilestoneConfig {
    fn default() -> Self {
        Self {
            boundary: default_boundary(),
            output_dir: default_milestone_dir(),
            commands: MilestoneCommands::default(),
        }
    }
}

/// `[milestone.commands]`: program + args per job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MilestoneCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub augmentation: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<Vec<String>>,
}

fn default_boundary() -> u64 {
    100
}
fn default_milestone_dir() -> String {
    "~/.samplegraph/milestones".into()
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration, merged from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub discovery_mode: DiscoveryMode,
    pub relationship_priority: f64,
    pub max_requests: u32,
    pub daily_request_cap: u32,
    pub page_size: u32,
    pub checkpoint_interval: u32,
    pub max_pending_nodes: usize,
    pub fetch_pending_batch_size: usize,
    pub include_user_edges: bool,
    pub include_pack_edges: bool,
    pub include_tag_edges: bool,
    pub tag_similarity_threshold: f64,
    pub tag_window_size: usize,
    pub metadata_update_mode: MetadataUpdateMode,
    pub seed_item_id: Option<ItemId>,
    pub search_query: String,
    pub search_sort: String,
    pub max_runtime: Option<Duration>,
    pub reverify_per_run: usize,
    pub auto_backup_every: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&CrawlSection::default())
    }
}

impl From<&CrawlSection> for RunConfig {
    fn from(crawl: &CrawlSection) -> Self {
        Self {
            discovery_mode: crawl.discovery_mode,
            relationship_priority: crawl.relationship_priority,
            max_requests: crawl.max_requests,
            daily_request_cap: crawl.daily_request_cap,
            page_size: crawl.page_size,
            checkpoint_interval: crawl.checkpoint_interval,
            max_pending_nodes: crawl.max_pending_nodes,
            fetch_pending_batch_size: crawl.fetch_pending_batch_size,
            include_user_edges: crawl.include_user_edges,
            include_pack_edges: crawl.include_pack_edges,
            include_tag_edges: crawl.include_tag_edges,
            tag_similarity_threshold: crawl.tag_similarity_threshold,
            tag_window_size: crawl.tag_window_size,
            metadata_update_mode: crawl.metadata_update_mode,
            seed_item_id: crawl.seed_item_id.map(ItemId),
            search_query: crawl.search_query.clone(),
            search_sort: crawl.search_sort.clone(),
            max_runtime: crawl.max_runtime_secs.map(Duration::from_secs),
            reverify_per_run: crawl.reverify_per_run,
            auto_backup_every: crawl.auto_backup_every,
        }
    }
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self::from(&config.crawl)
    }
}

impl RunConfig {
    /// Reject values outside their documented ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.relationship_priority) {
            return Err(SampleGraphError::config(format!(
                "relationship_priority must be within [0, 1], got {}",
                self.relationship_priority
            )));
        }
        if !(0.0..=1.0).contains(&self.tag_similarity_threshold) {
            return Err(SampleGraphError::config(format!(
                "tag_similarity_threshold must be within [0, 1], got {}",
                self.tag_similarity_threshold
            )));
        }
        if self.max_requests > self.daily_request_cap {
            return Err(SampleGraphError::config(format!(
                "max_requests ({}) exceeds the provider daily cap ({})",
                self.max_requests, self.daily_request_cap
            )));
        }
        if self.page_size == 0 {
            return Err(SampleGraphError::config("page_size must be positive"));
        }
        if self.checkpoint_interval == 0 {
            return Err(SampleGraphError::config("checkpoint_interval must be positive"));
        }
        if self.max_pending_nodes == 0 || self.fetch_pending_batch_size == 0 {
            return Err(SampleGraphError::config(
                "max_pending_nodes and fetch_pending_batch_size must be positive",
            ));
        }
        if self.include_tag_edges && self.tag_window_size == 0 {
            return Err(SampleGraphError::config(
                "tag_window_size must be positive when include_tag_edges is set",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.samplegraph/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SampleGraphError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.samplegraph/samplegraph.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SampleGraphError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        SampleGraphError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SampleGraphError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SampleGraphError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SampleGraphError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a secret from the named env var, failing if unset or empty.
pub fn read_secret(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(SampleGraphError::config(format!(
            "credential not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

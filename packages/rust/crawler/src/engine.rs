//! Budgeted, resumable crawl loop.
//!
//! The loop is single-task and strictly sequential: select a candidate, fetch
//! it if needed, ingest it into the graph, link edges, enqueue related items,
//! checkpoint periodically. It ends on budget exhaustion, the runtime
//! deadline, cancellation, or when every candidate source is empty, and
//! always saves a final checkpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use samplegraph_graph::UpsertOutcome;
use samplegraph_shared::{
    ApiError, DiscoveredVia, ItemId, ItemNode, PendingItem, Result, RunConfig, RunId, RunStats,
};
use samplegraph_storage::{CheckpointManager, CheckpointSnapshot};

use crate::client::ApiClient;
use crate::discovery::{Candidate, DiscoveryEngine};
use crate::edges::EdgeDiscovery;

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting crawl status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each processed item.
    fn item_processed(&self, id: ItemId, processed: usize, requests_made: u32, max_requests: u32);
    /// Called after each checkpoint save.
    fn checkpoint_saved(&self, stats: &RunStats);
    /// Called when the crawl loop returns.
    fn done(&self, summary: &CrawlSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item_processed(&self, _id: ItemId, _processed: usize, _requests: u32, _max: u32) {}
    fn checkpoint_saved(&self, _stats: &RunStats) {}
    fn done(&self, _summary: &CrawlSummary) {}
}

// ---------------------------------------------------------------------------
// CrawlSummary
// ---------------------------------------------------------------------------

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BudgetExhausted,
    Deadline,
    /// The cancellation token fired (SIGINT/SIGTERM in the CLI).
    Interrupted,
    CandidatesExhausted,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BudgetExhausted => "budget-exhausted",
            Self::Deadline => "deadline",
            Self::Interrupted => "interrupted",
            Self::CandidatesExhausted => "candidates-exhausted",
        }
    }
}

/// Summary of one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub run_id: RunId,
    pub stop_reason: StopReason,
    pub requests_made: u32,
    /// Candidates that reached a final outcome this run.
    pub items_processed: usize,
    pub nodes_added: usize,
    pub nodes_updated: usize,
    pub edges_added: usize,
    pub reverified: usize,
    pub invalidated: Vec<ItemId>,
    /// Per-item failures (id, error message).
    pub failures: Vec<(ItemId, String)>,
    /// Search pages that failed transiently.
    pub selection_failures: usize,
    pub checkpoints_saved: usize,
    pub auto_backups: usize,
    /// Node count when the run started.
    pub starting_nodes: usize,
    pub duration: Duration,
    /// Metadata written by the final save.
    pub final_stats: RunStats,
}

impl CrawlSummary {
    fn new(run_id: RunId, starting_nodes: usize) -> Self {
        Self {
            run_id,
            stop_reason: StopReason::CandidatesExhausted,
            requests_made: 0,
            items_processed: 0,
            nodes_added: 0,
            nodes_updated: 0,
            edges_added: 0,
            reverified: 0,
            invalidated: Vec::new(),
            failures: Vec::new(),
            selection_failures: 0,
            checkpoints_saved: 0,
            auto_backups: 0,
            starting_nodes,
            duration: Duration::ZERO,
            final_stats: RunStats::default(),
        }
    }
}

/// What happened to one candidate.
enum ItemOutcome {
    Ingested(UpsertOutcome),
    Skipped,
    Failed,
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Drives discovery, fetching, ingestion and checkpointing for one run.
pub struct Crawler {
    config: RunConfig,
    client: ApiClient,
    checkpoints: CheckpointManager,
    auto_backup: Option<CheckpointManager>,
    discovery: DiscoveryEngine,
    edges: EdgeDiscovery,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl Crawler {
    pub fn new(config: RunConfig, client: ApiClient, checkpoints: CheckpointManager) -> Self {
        let discovery = DiscoveryEngine::new(&config);
        let edges = EdgeDiscovery::new(&config);
        Self {
            config,
            client,
            checkpoints,
            auto_backup: None,
            discovery,
            edges,
            progress: Arc::new(SilentProgress),
            cancel: CancellationToken::new(),
        }
    }

    /// Secondary snapshot written every `auto_backup_every` new nodes.
    pub fn with_auto_backup(mut self, manager: CheckpointManager) -> Self {
        self.auto_backup = Some(manager);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Stop between items once `cancel` fires; the final checkpoint is still
    /// written.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fix the mixed-mode RNG.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.discovery = DiscoveryEngine::new(&self.config).with_rng_seed(seed);
        self
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Run until budget, deadline or candidates run out, then save.
    ///
    /// Per-item failures are recorded in the summary. Only a checkpoint write
    /// failure is returned as an error.
    #[instrument(skip_all, fields(mode = %self.config.discovery_mode, max_requests = self.config.max_requests))]
    pub async fn run(&mut self, state: &mut CheckpointSnapshot) -> Result<CrawlSummary> {
        let start = Instant::now();
        let deadline = self.config.max_runtime.map(|d| start + d);

        state.stats.run_id = RunId::new();
        state.stats.discovery_mode = self.config.discovery_mode;
        state.graph.set_update_mode(self.config.metadata_update_mode);

        let mut summary = CrawlSummary::new(state.stats.run_id.clone(), state.graph.node_count());
        info!(
            run_id = %summary.run_id,
            nodes = state.graph.node_count(),
            pending = state.pending.len(),
            "starting crawl"
        );

        self.edges.prime(&state.graph);
        self.discovery.begin(state, self.config.seed_item_id);

        let mut since_checkpoint = 0usize;
        let mut nodes_since_backup = 0usize;
        let mut stop = None;

        if self.config.reverify_per_run > 0 {
            self.progress.phase("Re-verifying");
            if self.reverify(state, &mut summary).await {
                stop = Some(StopReason::BudgetExhausted);
            }
        }

        self.progress.phase("Crawling");
        while stop.is_none() {
            if self.cancel.is_cancelled() {
                info!("cancellation requested");
                stop = Some(StopReason::Interrupted);
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("runtime deadline reached");
                stop = Some(StopReason::Deadline);
                break;
            }

            let candidate = match self.discovery.next_candidate(&mut self.client, state).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => {
                    stop = Some(StopReason::CandidatesExhausted);
                    break;
                }
                Err(ApiError::BudgetExhausted { .. }) => {
                    stop = Some(StopReason::BudgetExhausted);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "candidate selection failed");
                    summary.selection_failures += 1;
                    continue;
                }
            };

            let id = candidate.id();
            let (outcome, budget_hit) = self.process(candidate, state, &mut summary).await;
            match outcome {
                ItemOutcome::Ingested(upsert) => {
                    summary.items_processed += 1;
                    since_checkpoint += 1;
                    match upsert {
                        UpsertOutcome::Inserted => {
                            summary.nodes_added += 1;
                            nodes_since_backup += 1;
                        }
                        UpsertOutcome::Updated => summary.nodes_updated += 1,
                        UpsertOutcome::Unchanged => {}
                    }
                    self.progress.item_processed(
                        id,
                        state.processed.len(),
                        self.client.requests_made(),
                        self.config.max_requests,
                    );
                }
                ItemOutcome::Failed => {
                    summary.items_processed += 1;
                    since_checkpoint += 1;
                }
                ItemOutcome::Skipped => {}
            }

            if budget_hit {
                stop = Some(StopReason::BudgetExhausted);
            }

            if since_checkpoint >= self.config.checkpoint_interval as usize {
                self.checkpoint(state, &mut summary).await?;
                since_checkpoint = 0;
            }

            if self.config.auto_backup_every > 0 && nodes_since_backup >= self.config.auto_backup_every {
                self.auto_backup(state, &mut summary).await;
                nodes_since_backup = 0;
            }
        }

        summary.stop_reason = stop.unwrap_or(StopReason::CandidatesExhausted);
        state.stats.runs_completed += 1;
        self.checkpoint(state, &mut summary).await?;

        summary.requests_made = self.client.requests_made();
        summary.duration = start.elapsed();

        info!(
            stop = summary.stop_reason.as_str(),
            requests = summary.requests_made,
            processed = summary.items_processed,
            added = summary.nodes_added,
            edges = summary.edges_added,
            failures = summary.failures.len(),
            duration_ms = summary.duration.as_millis() as u64,
            "crawl completed"
        );
        self.progress.done(&summary);
        Ok(summary)
    }

    /// Fetch (if needed) and ingest one candidate. The flag reports that the
    /// budget ran out while handling it.
    async fn process(
        &mut self,
        candidate: Candidate,
        state: &mut CheckpointSnapshot,
        summary: &mut CrawlSummary,
    ) -> (ItemOutcome, bool) {
        let id = candidate.id();
        if state.processed.contains(&id) {
            debug!(%id, "already processed, skipping");
            return (ItemOutcome::Skipped, false);
        }

        let node = match candidate {
            Candidate::Search(payload) => payload.into_node(DiscoveredVia::Search),
            Candidate::Pending(item) => match self.client.item(item.id).await {
                Ok(payload) => payload.into_node(item.reason),
                Err(ApiError::BudgetExhausted { .. }) => {
                    state.pending.push(item);
                    return (ItemOutcome::Skipped, true);
                }
                Err(e @ ApiError::Transient { .. }) => {
                    warn!(%id, error = %e, "transient failure, re-enqueued at lowest priority");
                    state
                        .pending
                        .push(PendingItem::with_priority(item.id, item.reason, 0));
                    summary.failures.push((id, e.to_string()));
                    return (ItemOutcome::Failed, false);
                }
                Err(e) => {
                    warn!(%id, error = %e, "permanent failure, marking processed");
                    state.processed.insert(id);
                    summary.failures.push((id, e.to_string()));
                    return (ItemOutcome::Failed, false);
                }
            },
        };

        let outcome = self.ingest(state, node, summary);

        let budget_hit = if self.config.discovery_mode.uses_queue() {
            match self.edges.enqueue_related(&mut self.client, state, id).await {
                Ok(enqueued) => {
                    if enqueued > 0 {
                        debug!(%id, enqueued, pending = state.pending.len(), "related items enqueued");
                    }
                    false
                }
                Err(_) => true,
            }
        } else {
            false
        };

        (ItemOutcome::Ingested(outcome), budget_hit)
    }

    fn ingest(&mut self, state: &mut CheckpointSnapshot, node: ItemNode, summary: &mut CrawlSummary) -> UpsertOutcome {
        let id = node.id;
        let outcome = state.graph.upsert_node(node);
        state.processed.insert(id);
        state.pending.remove(id);
        let counts = self.edges.link(&mut state.graph, id);
        summary.edges_added += counts.total();
        outcome
    }

    /// Re-fetch the least recently verified nodes. Returns true when the
    /// budget ran out.
    async fn reverify(&mut self, state: &mut CheckpointSnapshot, summary: &mut CrawlSummary) -> bool {
        let mut oldest: Vec<(chrono::DateTime<chrono::Utc>, ItemId)> = state
            .graph
            .nodes()
            .map(|n| (n.last_verified_at, n.id))
            .collect();
        oldest.sort();

        for (_, id) in oldest.into_iter().take(self.config.reverify_per_run) {
            let via = state
                .graph
                .node(id)
                .map(|n| n.discovered_via)
                .unwrap_or(DiscoveredVia::Search);
            match self.client.item(id).await {
                Ok(payload) => {
                    let outcome = state.graph.upsert_node(payload.into_node(via));
                    if outcome == UpsertOutcome::Updated {
                        summary.nodes_updated += 1;
                    }
                    summary.reverified += 1;
                }
                Err(ApiError::BudgetExhausted { .. }) => return true,
                Err(e) if e.is_not_found() => {
                    if let Some(gone) = state.graph.invalidate(id) {
                        info!(%id, pruned_edges = gone.pruned_edges, "item removed at source, invalidated");
                        summary.invalidated.push(id);
                    }
                }
                Err(e) => {
                    warn!(%id, error = %e, "re-verification failed");
                    summary.failures.push((id, e.to_string()));
                }
            }
        }
        false
    }

    async fn checkpoint(&mut self, state: &mut CheckpointSnapshot, summary: &mut CrawlSummary) -> Result<()> {
        self.discovery.return_unconsumed(&mut state.pending);
        state.stats.requests_made = self.client.requests_made();
        let stats = self.checkpoints.save(state).await?;
        summary.checkpoints_saved += 1;
        summary.final_stats = stats.clone();
        self.progress.checkpoint_saved(&stats);
        Ok(())
    }

    async fn auto_backup(&mut self, state: &mut CheckpointSnapshot, summary: &mut CrawlSummary) {
        let Some(manager) = &self.auto_backup else {
            return;
        };
        self.discovery.return_unconsumed(&mut state.pending);
        state.stats.requests_made = self.client.requests_made();
        match manager.save(state).await {
            Ok(stats) => {
                summary.auto_backups += 1;
                info!(dir = %manager.dir().display(), nodes = stats.nodes, "auto backup saved");
            }
            Err(e) => warn!(error = %e, "auto backup failed"),
        }
    }
}

//! End-to-end run: restore → load → crawl → back up → milestone.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use samplegraph_backup::{AssetRef, BackupGateway, RestoreOutcome};
use samplegraph_crawler::{ApiClient, CrawlSummary, Crawler, ProgressReporter};
use samplegraph_shared::{
    AppConfig, CheckpointMismatch, MilestoneConfig, Result, RunConfig, RunStats, expand_path,
};
use samplegraph_storage::{CheckpointManager, CheckpointSnapshot, RepairReport, verify};

use crate::milestone::MilestoneReport;
use crate::postprocess::{MilestoneOutcome, PostProcessor};

/// Configuration for [`run_crawl`].
#[derive(Debug, Clone)]
pub struct CrawlPipelineConfig {
    pub run: RunConfig,
    pub checkpoint_dir: PathBuf,
    /// Secondary snapshot location; `None` disables auto backups.
    pub auto_backup_dir: Option<PathBuf>,
    pub milestone: MilestoneConfig,
    /// Parent of the `milestone-<n>` directories.
    pub milestone_root: PathBuf,
    /// Fixed seed for mixed-mode source selection.
    pub rng_seed: Option<u64>,
    /// Fired to end the crawl early; the final save and upload still run.
    pub cancel: CancellationToken,
}

impl CrawlPipelineConfig {
    /// Resolve file-config paths; `run` carries any CLI overrides.
    pub fn from_app(app: &AppConfig, run: RunConfig) -> Self {
        let auto_backup_dir = (run.auto_backup_every > 0)
            .then(|| expand_path(&app.checkpoint.auto_backup_dir));
        Self {
            run,
            checkpoint_dir: expand_path(&app.checkpoint.dir),
            auto_backup_dir,
            milestone: app.milestone.clone(),
            milestone_root: expand_path(&app.milestone.output_dir),
            rng_seed: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::new(&self.checkpoint_dir)
            .with_update_mode(self.run.metadata_update_mode)
            .with_queue_capacity(self.run.max_pending_nodes)
    }
}

/// Result of [`run_crawl`].
#[derive(Debug)]
pub struct CrawlPipelineResult {
    pub summary: CrawlSummary,
    /// Set when the local checkpoint was missing and a restore was attempted.
    pub restored: Option<RestoreOutcome>,
    /// Set when the loaded checkpoint needed repair.
    pub repaired: Option<RepairReport>,
    /// Archive uploaded after the run, if backups are on and the upload worked.
    pub uploaded: Option<AssetRef>,
    pub milestone: MilestoneReport,
    pub post_processing: Option<MilestoneOutcome>,
    pub elapsed: Duration,
}

/// Run one budgeted crawl end to end.
///
/// 1. Restore from the backup store when no local checkpoint exists
/// 2. Load the checkpoint, repairing inconsistent counters
/// 3. Crawl until the budget, the deadline, or candidates run out
/// 4. Upload the final checkpoint (failures only warn)
/// 5. Detect a milestone and run post-processing
///
/// Fails on checkpoint write errors, a failed restore, or a failing
/// milestone validation job.
#[instrument(skip_all, fields(dir = %config.checkpoint_dir.display(), mode = %config.run.discovery_mode))]
pub async fn run_crawl(
    config: &CrawlPipelineConfig,
    client: ApiClient,
    gateway: Option<&BackupGateway>,
    progress: Arc<dyn ProgressReporter>,
) -> Result<CrawlPipelineResult> {
    let start = Instant::now();
    config.run.validate()?;
    let manager = config.checkpoint_manager();

    // --- Phase 1: Restore ---
    manager.recover()?;
    let restored = match gateway {
        Some(gateway) if !manager.exists() => {
            progress.phase("Restoring checkpoint");
            Some(gateway.restore_latest(&manager).await?)
        }
        _ => None,
    };

    // --- Phase 2: Load ---
    progress.phase("Loading checkpoint");
    let (mut state, repaired) = match manager.load_verified().await? {
        Some((mut snapshot, report)) => {
            if report.is_some() {
                manager.save(&mut snapshot).await?;
            }
            (snapshot, report)
        }
        None => {
            info!("no checkpoint; starting from an empty graph");
            let snapshot = CheckpointSnapshot::empty(
                config.run.metadata_update_mode,
                config.run.max_pending_nodes,
            );
            (snapshot, None)
        }
    };
    let previous_nodes = state.graph.node_count();

    // --- Phase 3: Crawl ---
    progress.phase("Crawling");
    let mut crawler = Crawler::new(config.run.clone(), client, manager.clone())
        .with_progress(Arc::clone(&progress))
        .with_cancellation(config.cancel.clone());
    if let Some(dir) = &config.auto_backup_dir {
        crawler = crawler.with_auto_backup(
            CheckpointManager::new(dir)
                .with_update_mode(config.run.metadata_update_mode)
                .with_queue_capacity(config.run.max_pending_nodes),
        );
    }
    if let Some(seed) = config.rng_seed {
        crawler = crawler.with_rng_seed(seed);
    }
    let summary = crawler.run(&mut state).await?;

    // --- Phase 4: Upload ---
    let uploaded = match gateway {
        Some(gateway) => {
            progress.phase("Uploading checkpoint");
            match gateway.upload_checkpoint(manager.dir()).await {
                Ok(asset) => Some(asset),
                Err(e) => {
                    warn!(error = %e, "checkpoint upload failed; continuing without backup");
                    None
                }
            }
        }
        None => None,
    };

    // --- Phase 5: Milestone ---
    let current_nodes = state.graph.node_count();
    let milestone =
        MilestoneReport::evaluate(current_nodes, previous_nodes, config.milestone.boundary);
    let post_processing = match milestone.milestone_number {
        Some(n) => {
            progress.phase(&format!("Milestone {n} post-processing"));
            info!(milestone = n, previous_nodes, current_nodes, "milestone reached");
            let processor =
                PostProcessor::from_config(&config.milestone, config.run.tag_similarity_threshold)?;
            Some(processor.run(n, &manager, &config.milestone_root).await?)
        }
        None => None,
    };

    let result = CrawlPipelineResult {
        summary,
        restored,
        repaired,
        uploaded,
        milestone,
        post_processing,
        elapsed: start.elapsed(),
    };

    info!(
        stop_reason = result.summary.stop_reason.as_str(),
        requests = result.summary.requests_made,
        nodes = current_nodes,
        milestone = ?result.milestone.milestone_number,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "crawl pipeline complete"
    );
    Ok(result)
}

/// Result of [`verify_checkpoint`].
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// Metadata as found on disk (before any repair).
    pub stats: RunStats,
    pub mismatch: Option<CheckpointMismatch>,
    /// Whether a repaired checkpoint was written back.
    pub repaired: bool,
}

impl VerifyOutcome {
    pub fn is_consistent(&self) -> bool {
        self.mismatch.is_none()
    }
}

/// Check a checkpoint's counters; with `repair`, fix and save it.
///
/// `None` when the directory holds no checkpoint.
#[instrument(skip_all, fields(dir = %manager.dir().display(), repair = repair))]
pub async fn verify_checkpoint(
    manager: &CheckpointManager,
    repair: bool,
) -> Result<Option<VerifyOutcome>> {
    let Some(mut snapshot) = manager.load().await? else {
        return Ok(None);
    };
    let stats = snapshot.stats.clone();
    let mismatch = verify(&snapshot).err();

    let mut repaired = false;
    if repair && mismatch.is_some() && samplegraph_storage::repair(&mut snapshot).is_some() {
        manager.save(&mut snapshot).await?;
        repaired = true;
    }

    Ok(Some(VerifyOutcome {
        stats,
        mismatch,
        repaired,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use samplegraph_crawler::{
        HttpTransport, RateWindow, RetryPolicy, RunBudget, SilentProgress, StopReason,
    };
    use samplegraph_shared::{DiscoveryMode, ItemId, ItemNode};
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("sg_pipeline_{}", Uuid::now_v7()))
    }

    fn pipeline_config(root: &std::path::Path, max_requests: u32, boundary: u64) -> CrawlPipelineConfig {
        CrawlPipelineConfig {
            run: RunConfig {
                discovery_mode: DiscoveryMode::Search,
                max_requests,
                page_size: 3,
                auto_backup_every: 0,
                ..Default::default()
            },
            checkpoint_dir: root.join("checkpoint"),
            auto_backup_dir: None,
            milestone: MilestoneConfig {
                boundary,
                ..Default::default()
            },
            milestone_root: root.join("milestones"),
            rng_seed: Some(7),
            cancel: CancellationToken::new(),
        }
    }

    fn client(server: &MockServer, max_requests: u32) -> ApiClient {
        let transport =
            HttpTransport::new(&server.uri(), None, Duration::from_secs(5)).expect("transport");
        ApiClient::new(
            Box::new(transport),
            RunBudget::new(max_requests),
            RateWindow::new(0, Duration::from_secs(60)),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        )
    }

    async fn mount_search(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/search/text/"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 3,
                "next": null,
                "results": [
                    {"id": 1, "name": "kick", "username": "alice", "tags": ["kick", "drum"], "num_downloads": 30},
                    {"id": 2, "name": "snare", "username": "alice", "tags": ["snare", "drum"], "num_downloads": 20},
                    {"id": 3, "name": "kick2", "username": "bob", "tags": ["kick", "drum"], "num_downloads": 10}
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn crawl_then_milestone_post_processing() {
        let root = temp_root();
        let server = MockServer::start().await;
        mount_search(&server).await;
        let config = pipeline_config(&root, 5, 2);

        let result = run_crawl(&config, client(&server, 5), None, Arc::new(SilentProgress))
            .await
            .expect("pipeline");

        assert_eq!(result.summary.nodes_added, 3);
        assert_eq!(result.summary.stop_reason, StopReason::CandidatesExhausted);
        assert!(result.restored.is_none());
        assert!(result.uploaded.is_none());
        assert_eq!(
            result.milestone,
            MilestoneReport {
                is_milestone: true,
                milestone_number: Some(1)
            }
        );
        let post = result.post_processing.expect("post-processing ran");
        assert!(post.reports.iter().all(|r| r.succeeded()), "{:?}", post.reports);
        assert!(root.join("milestones/milestone-1/report.json").exists());

        let saved = config
            .checkpoint_manager()
            .load()
            .await
            .expect("load")
            .expect("present");
        assert_eq!(saved.graph.node_count(), 3);
        assert_eq!(saved.stats.runs_completed, 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn no_milestone_inside_a_band() {
        let root = temp_root();
        let server = MockServer::start().await;
        mount_search(&server).await;
        let config = pipeline_config(&root, 5, 100);

        let result = run_crawl(&config, client(&server, 5), None, Arc::new(SilentProgress))
            .await
            .expect("pipeline");
        assert!(!result.milestone.is_milestone);
        assert!(result.post_processing.is_none());
        assert!(!root.join("milestones").exists());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failing_validation_fails_the_pipeline() {
        let root = temp_root();
        let server = MockServer::start().await;
        mount_search(&server).await;
        let mut config = pipeline_config(&root, 5, 2);
        config.milestone.commands.validation =
            Some(vec!["sh".into(), "-c".into(), "exit 1".into()]);

        let err = run_crawl(&config, client(&server, 5), None, Arc::new(SilentProgress))
            .await
            .expect_err("validation failure");
        assert!(matches!(
            err,
            samplegraph_shared::SampleGraphError::ValidationFailure {
                milestone: 1,
                exit_code: 1
            }
        ));
        // The crawl itself was still checkpointed.
        assert!(config.checkpoint_manager().exists());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn cancelled_run_still_checkpoints() {
        let root = temp_root();
        let server = MockServer::start().await;
        mount_search(&server).await;
        let config = pipeline_config(&root, 5, 2);
        config.cancel.cancel();

        let result = run_crawl(&config, client(&server, 5), None, Arc::new(SilentProgress))
            .await
            .expect("pipeline");
        assert_eq!(result.summary.stop_reason, StopReason::Interrupted);
        assert_eq!(result.summary.nodes_added, 0);
        assert!(config.checkpoint_manager().exists());
        assert!(!result.milestone.is_milestone);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn invalid_run_config_is_rejected_before_any_request() {
        let root = temp_root();
        let server = MockServer::start().await;
        let mut config = pipeline_config(&root, 5, 2);
        config.run.relationship_priority = 1.5;

        let err = run_crawl(&config, client(&server, 5), None, Arc::new(SilentProgress))
            .await
            .expect_err("invalid");
        assert!(matches!(err, samplegraph_shared::SampleGraphError::Config { .. }));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn verify_reports_and_repairs() {
        let root = temp_root();
        let manager = CheckpointManager::new(root.join("checkpoint"));
        let mut snapshot =
            CheckpointSnapshot::empty(samplegraph_shared::MetadataUpdateMode::Merge, 10);
        snapshot
            .graph
            .upsert_node(ItemNode::new(ItemId(1), "one", "alice"));
        snapshot
            .graph
            .upsert_node(ItemNode::new(ItemId(2), "two", "alice"));
        snapshot.processed.insert(ItemId(1));
        manager.save(&mut snapshot).await.expect("save");

        let outcome = verify_checkpoint(&manager, false)
            .await
            .expect("verify")
            .expect("present");
        let mismatch = outcome.mismatch.clone().expect("node 2 unprocessed");
        assert_eq!(mismatch.unprocessed_nodes, 1);
        assert!(!outcome.repaired);

        let outcome = verify_checkpoint(&manager, true)
            .await
            .expect("verify")
            .expect("present");
        assert!(outcome.repaired);

        let again = verify_checkpoint(&manager, false)
            .await
            .expect("verify")
            .expect("present");
        assert!(again.is_consistent());

        assert!(
            verify_checkpoint(&CheckpointManager::new(root.join("absent")), false)
                .await
                .expect("verify")
                .is_none()
        );

        let _ = std::fs::remove_dir_all(&root);
    }
}

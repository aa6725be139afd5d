//! Milestone post-processing.
//!
//! When the graph crosses a milestone the just-saved checkpoint is copied to
//! `<milestone_dir>/milestone-<n>/snapshot` and three jobs run concurrently
//! against that copy:
//!
//! ```text
//! milestone-<n>/
//! ├── snapshot/            (read-only input)
//! ├── validation/
//! ├── edge-augmentation/   augmented_edges.json
//! ├── page-generation/     index.html
//! └── report.json
//! ```
//!
//! Validation failing is fatal; the other two only warn.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use samplegraph_graph::{Topology, tag_similarity_edges};
use samplegraph_shared::{Edge, ItemId, MilestoneConfig, Result, SampleGraphError};
use samplegraph_storage::{
    CheckpointIndex, CheckpointManager, CheckpointSnapshot, GRAPH_FILE, INDEX_FILE, verify,
};

use crate::milestone::milestone_dir;

pub const SNAPSHOT_DIR: &str = "snapshot";
pub const REPORT_FILE: &str = "report.json";
pub const AUGMENTED_EDGES_FILE: &str = "augmented_edges.json";
pub const PAGE_FILE: &str = "index.html";

/// Exit code recorded for a job whose task panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Exit code recorded when an external command could not be started.
const SPAWN_FAILED_EXIT_CODE: i32 = 127;

// ---------------------------------------------------------------------------
// Job model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Validation,
    EdgeAugmentation,
    PageGeneration,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::EdgeAugmentation => "edge-augmentation",
            Self::PageGeneration => "page-generation",
        }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub kind: JobKind,
    pub exit_code: i32,
    pub log: String,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Exit 0 with the collected log lines, or exit 1 with the error.
    fn from_result(kind: JobKind, result: Result<Vec<String>>) -> Self {
        match result {
            Ok(lines) => Self {
                kind,
                exit_code: 0,
                log: lines.join("\n"),
            },
            Err(e) => Self {
                kind,
                exit_code: 1,
                log: e.to_string(),
            },
        }
    }
}

/// Paths handed to a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Checkpoint copy; jobs must not write here.
    pub snapshot_dir: PathBuf,
    /// Directory owned by this job.
    pub output_dir: PathBuf,
}

/// A post-processing job. Failures are reported through the exit code.
#[async_trait]
pub trait PostJob: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn run(&self, ctx: &JobContext) -> JobReport;
}

async fn load_snapshot(dir: &Path) -> Result<CheckpointSnapshot> {
    CheckpointManager::new(dir)
        .load()
        .await?
        .ok_or_else(|| SampleGraphError::validation("snapshot holds no checkpoint"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural checks on the snapshot: loadable, counters consistent, no
/// dangling edges, and every node present in the metadata index.
pub struct ValidationJob;

#[async_trait]
impl PostJob for ValidationJob {
    fn kind(&self) -> JobKind {
        JobKind::Validation
    }

    async fn run(&self, ctx: &JobContext) -> JobReport {
        JobReport::from_result(self.kind(), validate_snapshot(&ctx.snapshot_dir).await)
    }
}

async fn validate_snapshot(dir: &Path) -> Result<Vec<String>> {
    let mut log = Vec::new();

    // Read the raw topology: loading a graph silently drops dangling edges.
    let graph_path = dir.join(GRAPH_FILE);
    let bytes = std::fs::read(&graph_path).map_err(|e| SampleGraphError::io(&graph_path, e))?;
    let topology: Topology = serde_json::from_slice(&bytes)?;
    let ids: HashSet<ItemId> = topology.nodes.iter().map(|n| n.id).collect();
    let dangling = topology
        .edges
        .iter()
        .filter(|e| !ids.contains(&e.source) || !ids.contains(&e.target))
        .count();
    if dangling > 0 {
        return Err(SampleGraphError::validation(format!(
            "{dangling} edges reference missing nodes"
        )));
    }
    log.push(format!(
        "topology: {} nodes, {} edges, no dangling endpoints",
        topology.nodes.len(),
        topology.edges.len()
    ));

    let snapshot = load_snapshot(dir).await?;
    verify(&snapshot)?;
    log.push(format!(
        "counters consistent: processed={} pending={}",
        snapshot.processed.len(),
        snapshot.pending.len()
    ));

    let index = CheckpointIndex::open_readonly(&dir.join(INDEX_FILE)).await?;
    let mut missing = Vec::new();
    for id in snapshot.graph.node_ids() {
        if !index.contains(id).await? {
            missing.push(id);
        }
    }
    let indexed = index.count().await?;
    if !missing.is_empty() || indexed != snapshot.graph.node_count() {
        return Err(SampleGraphError::validation(format!(
            "metadata index holds {indexed} rows for {} nodes; {} nodes missing",
            snapshot.graph.node_count(),
            missing.len()
        )));
    }
    log.push(format!("metadata index covers all {indexed} nodes"));

    Ok(log)
}

// ---------------------------------------------------------------------------
// Edge augmentation
// ---------------------------------------------------------------------------

/// Batch tag similarity over every node pair; writes the edges the snapshot
/// does not already have.
pub struct EdgeAugmentationJob {
    pub threshold: f64,
}

#[async_trait]
impl PostJob for EdgeAugmentationJob {
    fn kind(&self) -> JobKind {
        JobKind::EdgeAugmentation
    }

    async fn run(&self, ctx: &JobContext) -> JobReport {
        JobReport::from_result(self.kind(), self.augment(ctx).await)
    }
}

impl EdgeAugmentationJob {
    async fn augment(&self, ctx: &JobContext) -> Result<Vec<String>> {
        let snapshot = load_snapshot(&ctx.snapshot_dir).await?;
        let graph = &snapshot.graph;

        let candidates = tag_similarity_edges(graph.nodes(), self.threshold);
        let considered = candidates.len();
        let added: Vec<Edge> = candidates
            .into_iter()
            .filter(|e| !graph.has_edge(e.source, e.target, e.kind))
            .collect();

        let path = ctx.output_dir.join(AUGMENTED_EDGES_FILE);
        let json = serde_json::to_vec_pretty(&added)?;
        std::fs::write(&path, json).map_err(|e| SampleGraphError::io(&path, e))?;

        Ok(vec![format!(
            "{} qualifying tag pairs, {} new edges written to {}",
            considered,
            added.len(),
            AUGMENTED_EDGES_FILE
        )])
    }
}

// ---------------------------------------------------------------------------
// Page generation
// ---------------------------------------------------------------------------

/// Renders a static `index.html` summary of the snapshot.
pub struct PageGenerationJob {
    /// Rows in the top-by-degree table.
    pub top: usize,
}

impl Default for PageGenerationJob {
    fn default() -> Self {
        Self { top: 20 }
    }
}

#[async_trait]
impl PostJob for PageGenerationJob {
    fn kind(&self) -> JobKind {
        JobKind::PageGeneration
    }

    async fn run(&self, ctx: &JobContext) -> JobReport {
        JobReport::from_result(self.kind(), self.render(ctx).await)
    }
}

impl PageGenerationJob {
    async fn render(&self, ctx: &JobContext) -> Result<Vec<String>> {
        let snapshot = load_snapshot(&ctx.snapshot_dir).await?;
        let html = render_page(&snapshot, self.top, Utc::now());
        let path = ctx.output_dir.join(PAGE_FILE);
        std::fs::write(&path, html).map_err(|e| SampleGraphError::io(&path, e))?;
        Ok(vec![format!(
            "rendered {} for {} nodes",
            PAGE_FILE,
            snapshot.graph.node_count()
        )])
    }
}

fn render_page(snapshot: &CheckpointSnapshot, top: usize, at: DateTime<Utc>) -> String {
    let graph = &snapshot.graph;

    let mut ranked: Vec<_> = graph.nodes().map(|n| (graph.degree(n.id), n)).collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str("<title>SampleGraph snapshot</title>\n</head>\n<body>\n");
    let _ = writeln!(html, "<h1>SampleGraph snapshot</h1>");
    let _ = writeln!(
        html,
        "<p>{} nodes, {} edges, {} processed, {} pending. Generated {}.</p>",
        graph.node_count(),
        graph.edge_count(),
        snapshot.processed.len(),
        snapshot.pending.len(),
        at.to_rfc3339()
    );

    html.push_str("<h2>Edges by kind</h2>\n<table>\n<tr><th>kind</th><th>count</th></tr>\n");
    for (kind, count) in graph.edge_kind_counts() {
        let _ = writeln!(html, "<tr><td>{}</td><td>{count}</td></tr>", kind.as_str());
    }
    html.push_str("</table>\n");

    html.push_str("<h2>Most connected items</h2>\n<table>\n");
    html.push_str("<tr><th>id</th><th>name</th><th>user</th><th>degree</th></tr>\n");
    for (degree, node) in ranked.into_iter().take(top) {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{degree}</td></tr>",
            node.id,
            escape_html(&node.name),
            escape_html(&node.username)
        );
    }
    html.push_str("</table>\n</body>\n</html>\n");
    html
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// External command
// ---------------------------------------------------------------------------

/// Runs a configured program in place of a built-in job.
///
/// The program sees `SAMPLEGRAPH_SNAPSHOT` and `SAMPLEGRAPH_OUTPUT`; its exit
/// code is the job's exit code and its stdout/stderr the log.
pub struct CommandJob {
    kind: JobKind,
    program: String,
    args: Vec<String>,
}

impl CommandJob {
    pub fn new(kind: JobKind, argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            SampleGraphError::config(format!("empty command for {} job", kind.as_str()))
        })?;
        Ok(Self {
            kind,
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl PostJob for CommandJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn run(&self, ctx: &JobContext) -> JobReport {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("SAMPLEGRAPH_SNAPSHOT", &ctx.snapshot_dir)
            .env("SAMPLEGRAPH_OUTPUT", &ctx.output_dir)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) => {
                let mut log = String::from_utf8_lossy(&out.stdout).into_owned();
                log.push_str(&String::from_utf8_lossy(&out.stderr));
                JobReport {
                    kind: self.kind,
                    // Killed by a signal: no code.
                    exit_code: out.status.code().unwrap_or(-1),
                    log,
                }
            }
            Err(e) => JobReport {
                kind: self.kind,
                exit_code: SPAWN_FAILED_EXIT_CODE,
                log: format!("failed to start `{}`: {e}", self.program),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// PostProcessor
// ---------------------------------------------------------------------------

/// Everything one milestone produced; also written as `report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneOutcome {
    pub milestone: u64,
    pub dir: PathBuf,
    pub reports: Vec<JobReport>,
    pub completed_at: DateTime<Utc>,
}

impl MilestoneOutcome {
    pub fn report(&self, kind: JobKind) -> Option<&JobReport> {
        self.reports.iter().find(|r| r.kind == kind)
    }
}

/// Fans the milestone jobs out on a [`JoinSet`] and waits for all of them.
pub struct PostProcessor {
    jobs: Vec<Arc<dyn PostJob>>,
}

impl PostProcessor {
    pub fn new(jobs: Vec<Arc<dyn PostJob>>) -> Self {
        Self { jobs }
    }

    /// Built-in jobs, each replaced by its `[milestone.commands]` entry when set.
    pub fn from_config(config: &MilestoneConfig, tag_threshold: f64) -> Result<Self> {
        let commands = &config.commands;
        let validation: Arc<dyn PostJob> = match &commands.validation {
            Some(argv) => Arc::new(CommandJob::new(JobKind::Validation, argv)?),
            None => Arc::new(ValidationJob),
        };
        let augmentation: Arc<dyn PostJob> = match &commands.augmentation {
            Some(argv) => Arc::new(CommandJob::new(JobKind::EdgeAugmentation, argv)?),
            None => Arc::new(EdgeAugmentationJob {
                threshold: tag_threshold,
            }),
        };
        let render: Arc<dyn PostJob> = match &commands.render {
            Some(argv) => Arc::new(CommandJob::new(JobKind::PageGeneration, argv)?),
            None => Arc::new(PageGenerationJob::default()),
        };
        Ok(Self::new(vec![validation, augmentation, render]))
    }

    pub fn job_kinds(&self) -> Vec<JobKind> {
        self.jobs.iter().map(|j| j.kind()).collect()
    }

    /// Snapshot the checkpoint, run every job, write `report.json`.
    ///
    /// Returns [`SampleGraphError::ValidationFailure`] when the validation job
    /// exits nonzero; other nonzero exits are logged as warnings.
    #[instrument(skip_all, fields(milestone = milestone))]
    pub async fn run(
        &self,
        milestone: u64,
        checkpoint: &CheckpointManager,
        root: &Path,
    ) -> Result<MilestoneOutcome> {
        let dir = milestone_dir(root, milestone);
        let snapshot_dir = dir.join(SNAPSHOT_DIR);
        checkpoint.copy_to(&snapshot_dir)?;
        info!(snapshot = %snapshot_dir.display(), jobs = self.jobs.len(), "milestone post-processing started");

        let mut set = JoinSet::new();
        let mut kinds = HashMap::new();
        for job in &self.jobs {
            let kind = job.kind();
            let ctx = JobContext {
                snapshot_dir: snapshot_dir.clone(),
                output_dir: dir.join(kind.as_str()),
            };
            std::fs::create_dir_all(&ctx.output_dir)
                .map_err(|e| SampleGraphError::io(&ctx.output_dir, e))?;

            let job = Arc::clone(job);
            let handle = set.spawn(async move { job.run(&ctx).await });
            kinds.insert(handle.id(), kind);
        }

        let mut reports = Vec::with_capacity(self.jobs.len());
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, report)) => reports.push(report),
                Err(e) => {
                    let Some(&kind) = kinds.get(&e.id()) else {
                        return Err(SampleGraphError::PostProcess(format!(
                            "unknown task finished: {e}"
                        )));
                    };
                    reports.push(JobReport {
                        kind,
                        exit_code: PANIC_EXIT_CODE,
                        log: format!("job task failed: {e}"),
                    });
                }
            }
        }
        reports.sort_by_key(|r| r.kind);

        let outcome = MilestoneOutcome {
            milestone,
            dir: dir.clone(),
            reports,
            completed_at: Utc::now(),
        };
        let report_path = dir.join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(&outcome)?;
        std::fs::write(&report_path, json).map_err(|e| SampleGraphError::io(&report_path, e))?;

        for report in &outcome.reports {
            if report.succeeded() {
                info!(job = report.kind.as_str(), "job succeeded");
            } else {
                warn!(
                    job = report.kind.as_str(),
                    exit_code = report.exit_code,
                    log = %report.log,
                    "job failed"
                );
            }
        }

        if let Some(validation) = outcome.report(JobKind::Validation) {
            if !validation.succeeded() {
                return Err(SampleGraphError::ValidationFailure {
                    milestone,
                    exit_code: validation.exit_code,
                });
            }
        }
        Ok(outcome)
    }
}

//! Candidate selection: which item is processed next.
//!
//! - `search` pages through a persisted [`SearchCursor`], most popular first.
//! - `relationships` drains the pending queue in priority batches.
//! - `mixed` picks a source per round with a seedable RNG and falls back to
//!   the other source when the chosen one is empty.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use samplegraph_graph::PendingQueue;
use samplegraph_shared::{
    ApiError, DiscoveredVia, DiscoveryMode, ItemId, PendingItem, RunConfig, SearchCursor,
};
use samplegraph_storage::CheckpointSnapshot;

use crate::catalog::{ItemPayload, popularity_order};
use crate::client::ApiClient;

/// A unit of work for the crawl loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    /// Came with its search payload; ingesting costs no request.
    Search(ItemPayload),
    /// Needs `sounds/{id}/`.
    Pending(PendingItem),
}

impl Candidate {
    pub fn id(&self) -> ItemId {
        match self {
            Self::Search(payload) => payload.item_id(),
            Self::Pending(item) => item.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Search,
    Relationships,
}

/// Chooses candidates according to the run's discovery mode.
pub struct DiscoveryEngine {
    mode: DiscoveryMode,
    relationship_priority: f64,
    batch_size: usize,
    page_size: u32,
    query: String,
    sort: String,
    search_buffer: VecDeque<ItemPayload>,
    /// The buffered page was the last one.
    buffer_is_last_page: bool,
    /// Search was refused for this run; the saved cursor stays as it is.
    search_halted: bool,
    pending_batch: VecDeque<PendingItem>,
    seed: Option<PendingItem>,
    rng: StdRng,
}

impl DiscoveryEngine {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            mode: config.discovery_mode,
            relationship_priority: config.relationship_priority,
            batch_size: config.fetch_pending_batch_size.max(1),
            page_size: config.page_size,
            query: config.search_query.clone(),
            sort: config.search_sort.clone(),
            search_buffer: VecDeque::new(),
            buffer_is_last_page: false,
            search_halted: false,
            pending_batch: VecDeque::new(),
            seed: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Fix the RNG used by mixed mode.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    /// Prepare persisted state for this run: reset a cursor built for a
    /// different query, and schedule the seed item.
    pub fn begin(&mut self, state: &mut CheckpointSnapshot, seed: Option<ItemId>) {
        if !state.cursor.matches(&self.query, &self.sort) {
            info!(query = %self.query, sort = %self.sort, "search parameters changed, restarting cursor");
            state.cursor = SearchCursor::new(&self.query, &self.sort);
        }

        let Some(seed) = seed.filter(|id| !state.processed.contains(id)) else {
            return;
        };
        let record = PendingItem::with_priority(seed, DiscoveredVia::Search, u8::MAX);
        if self.mode.uses_queue() {
            state.pending.push(record);
        } else {
            self.seed = Some(record);
        }
        debug!(%seed, "seed item scheduled");
    }

    /// Next candidate, or `None` when every source is exhausted.
    pub async fn next_candidate(
        &mut self,
        client: &mut ApiClient,
        state: &mut CheckpointSnapshot,
    ) -> Result<Option<Candidate>, ApiError> {
        if let Some(seed) = self.seed.take() {
            return Ok(Some(Candidate::Pending(seed)));
        }

        let order = match self.mode {
            DiscoveryMode::Search => [Source::Search, Source::Search],
            DiscoveryMode::Relationships => [Source::Relationships, Source::Relationships],
            DiscoveryMode::Mixed => {
                if self.rng.gen_bool(self.relationship_priority.clamp(0.0, 1.0)) {
                    [Source::Relationships, Source::Search]
                } else {
                    [Source::Search, Source::Relationships]
                }
            }
        };

        for source in order {
            let next = match source {
                Source::Search => self.next_search(client, state).await?,
                Source::Relationships => self.next_pending(state),
            };
            if next.is_some() {
                return Ok(next);
            }
        }
        Ok(None)
    }

    fn next_pending(&mut self, state: &mut CheckpointSnapshot) -> Option<Candidate> {
        loop {
            if self.pending_batch.is_empty() {
                let processed = &state.processed;
                let graph = &state.graph;
                let batch = state
                    .pending
                    .pop_batch(self.batch_size, |id| processed.contains(&id) || graph.has_node(id));
                if batch.is_empty() {
                    return None;
                }
                debug!(size = batch.len(), remaining = state.pending.len(), "pending batch drawn");
                self.pending_batch.extend(batch);
            }

            let item = self.pending_batch.pop_front()?;
            if !state.processed.contains(&item.id) {
                return Some(Candidate::Pending(item));
            }
        }
    }

    async fn next_search(
        &mut self,
        client: &mut ApiClient,
        state: &mut CheckpointSnapshot,
    ) -> Result<Option<Candidate>, ApiError> {
        loop {
            if let Some(payload) = self.search_buffer.pop_front() {
                if self.search_buffer.is_empty() {
                    self.finish_buffered_page(&mut state.cursor);
                }
                if state.processed.contains(&payload.item_id()) {
                    continue;
                }
                return Ok(Some(Candidate::Search(payload)));
            }

            if state.cursor.exhausted || self.search_halted {
                return Ok(None);
            }

            let cursor = state.cursor.clone();
            let page = match client
                .search(&cursor.query, &cursor.sort, cursor.page, self.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_not_found() => {
                    info!(page = cursor.page, "search page past the end, cursor exhausted");
                    state.cursor.exhausted = true;
                    return Ok(None);
                }
                Err(e @ ApiError::Permanent { .. }) => {
                    warn!(page = cursor.page, error = %e, "search rejected, no more search candidates this run");
                    self.search_halted = true;
                    return Ok(None);
                }
                Err(e @ ApiError::Decode { .. }) => {
                    warn!(page = cursor.page, error = %e, "undecodable search page skipped");
                    state.cursor.page += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if page.results.is_empty() {
                info!(page = cursor.page, "search exhausted");
                state.cursor.exhausted = true;
                return Ok(None);
            }

            let is_last = page.is_last();
            let mut results = page.results;
            results.sort_by(popularity_order);
            let fresh: VecDeque<ItemPayload> = results
                .into_iter()
                .filter(|r| !state.processed.contains(&r.item_id()))
                .collect();

            debug!(page = cursor.page, fresh = fresh.len(), last = is_last, "search page buffered");
            self.buffer_is_last_page = is_last;
            if fresh.is_empty() {
                self.finish_buffered_page(&mut state.cursor);
            } else {
                self.search_buffer = fresh;
            }
        }
    }

    /// The buffered page is fully handed out: move the cursor past it.
    fn finish_buffered_page(&mut self, cursor: &mut SearchCursor) {
        cursor.page += 1;
        if self.buffer_is_last_page {
            info!(pages = cursor.page - 1, "search exhausted");
            cursor.exhausted = true;
        }
    }

    /// Hand undrawn pending records back to the queue so they are persisted.
    pub fn return_unconsumed(&mut self, pending: &mut PendingQueue) {
        if let Some(seed) = self.seed.take() {
            pending.push(seed);
        }
        for item in self.pending_batch.drain(..) {
            pending.push(item);
        }
    }
}

use std::collections::{hash_map::Entry, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Duration;
use log::debug;

use crate::api::ElectionApi;
use crate::cache::CacheClient;
use crate::error::{Error, Result};
use crate::model::results::{Abstentions, CandidateTally, ResultItem, ResultsResponse};
use crate::scheduled_task::RepeatingTask;
use crate::status::ElectionStatusMachine;
use crate::Config;

/// Fetches and aggregates per-position tallies once the election has ended
/// by either authority signal. Optionally keeps them fresh on a polling
/// interval, e.g. while the results page is open.
pub struct ResultsAggregator {
    api: Arc<dyn ElectionApi>,
    cache: Arc<CacheClient>,
    status: Arc<ElectionStatusMachine>,
    results_ttl: Duration,
    poll_interval: std::time::Duration,
    poll: Mutex<Option<RepeatingTask>>,
}

impl ResultsAggregator {
    pub fn new(
        api: Arc<dyn ElectionApi>,
        cache: Arc<CacheClient>,
        status: Arc<ElectionStatusMachine>,
        config: &Config,
    ) -> Self {
        Self {
            api,
            cache,
            status,
            results_ttl: config.results_ttl(),
            poll_interval: config.results_poll_interval(),
            poll: Mutex::new(None),
        }
    }

    /// Fetch the tallies and return them aggregated. Refused while the
    /// election is still genuinely running: the time boundary has not
    /// passed and the server still flags it active.
    pub async fn fetch(&self) -> Result<ResultsResponse> {
        if !self.status.results_available() {
            return Err(Error::ResultsNotAvailable);
        }
        let api = Arc::clone(&self.api);
        let fetch = move || {
            let api = Arc::clone(&api);
            async move { api.results().await }
        };
        let raw: ResultsResponse = self
            .cache
            .fetch("results", self.results_ttl, false, fetch)
            .await?;
        Ok(ResultsResponse {
            results: aggregate(raw.results),
            stats: raw.stats,
        })
    }

    /// Start refreshing the results on the polling interval. Failed polls
    /// (including refusals while the election is still running) are skipped
    /// quietly and tried again on the next tick.
    pub fn start_polling(self: &Arc<Self>) {
        let mut poll = self.poll.lock().unwrap();
        if poll.is_some() {
            return;
        }
        let aggregator = Arc::clone(self);
        *poll = Some(RepeatingTask::new(self.poll_interval, move || {
            let aggregator = Arc::clone(&aggregator);
            async move {
                if let Err(err) = aggregator.fetch().await {
                    debug!("Results poll skipped: {err}");
                }
            }
        }));
    }

    /// Stop polling. No further poll fires after this returns.
    pub fn stop_polling(&self) {
        self.poll.lock().unwrap().take();
    }
}

/// Reduce raw per-position rows into the displayable result set:
/// deduplicate redundant position rows, rank candidates, recompute
/// percentages and derive abstentions, and order by position priority.
///
/// The reduction is deterministic and idempotent: aggregated output fed
/// back in comes out unchanged.
pub fn aggregate(raw: Vec<ResultItem>) -> Vec<ResultItem> {
    // Duplicate position rows (same title, different ids) collapse onto the
    // row with the larger tally; the pick is associative and commutative so
    // input order cannot matter.
    let mut merged: HashMap<String, ResultItem> = HashMap::new();
    for item in raw {
        match merged.entry(item.position.title.clone()) {
            Entry::Occupied(mut slot) => {
                if item.total_votes > slot.get().total_votes {
                    slot.insert(item);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(item);
            }
        }
    }

    let mut items: Vec<ResultItem> = merged.into_values().collect();
    for item in &mut items {
        // Stable sort: candidates tied on votes keep their input order.
        item.candidates.sort_by(|a, b| b.vote_count.cmp(&a.vote_count));
        for candidate in &mut item.candidates {
            candidate.percentage = percentage(candidate.vote_count, item.total_votes);
        }
        item.abstentions = Some(derive_abstentions(&item.candidates, item.total_votes));
    }
    items.sort_by(|a, b| {
        (a.position.priority, &a.position.title).cmp(&(b.position.priority, &b.position.title))
    });
    items
}

fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

/// An explicit abstention pseudo-candidate is authoritative; otherwise the
/// shortfall between the position total and the candidate votes is the
/// abstention count.
fn derive_abstentions(candidates: &[CandidateTally], total_votes: u64) -> Abstentions {
    if let Some(tally) = candidates.iter().find(|c| c.counts_abstentions()) {
        return Abstentions {
            count: tally.vote_count,
            percentage: percentage(tally.vote_count, total_votes),
        };
    }
    let cast: u64 = candidates.iter().map(|c| c.vote_count).sum();
    let count = total_votes.saturating_sub(cast);
    Abstentions {
        count,
        percentage: percentage(count, total_votes),
    }
}

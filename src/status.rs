use std::sync::{Arc, Mutex};

use chrono::{Duration, FixedOffset, Utc};
use log::warn;

use crate::api::ElectionApi;
use crate::cache::CacheClient;
use crate::error::Error;
use crate::model::election::{ElectionStatus, FallbackWindow};
use crate::scheduled_task::RepeatingTask;
use crate::time_window::{derive_phase, format_remaining, Boundary, Phase};
use crate::Config;

/// A consistent view of the machine's state at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub phase: Phase,
    /// Server authority flag; `false` until a status has been fetched.
    pub is_active: bool,
    pub results_published: bool,
    pub loading: bool,
}

struct StatusState {
    /// Last status obtained from the backend, if any. Stays `None` when we
    /// are running on the synthesized fallback.
    status: Option<ElectionStatus>,
    boundary: Boundary,
    phase: Phase,
    loading: bool,
}

struct StatusInner {
    api: Arc<dyn ElectionApi>,
    cache: Arc<CacheClient>,
    zone: FixedOffset,
    fallback: FallbackWindow,
    status_ttl: Duration,
    deadline: std::time::Duration,
    state: Mutex<StatusState>,
}

/// Tracks the election status by polling the backend and re-deriving the
/// phase once per second, so the phase flips at the window boundary without
/// waiting for the next poll.
///
/// Both timers are owned handles; disposing the machine guarantees that no
/// further tick or poll fires.
pub struct ElectionStatusMachine {
    inner: Arc<StatusInner>,
    poll: RepeatingTask,
    tick: RepeatingTask,
}

impl ElectionStatusMachine {
    /// Start the machine: an immediate status fetch, a poll on the
    /// configured interval, and the once-per-second phase recompute tick.
    pub fn new(api: Arc<dyn ElectionApi>, cache: Arc<CacheClient>, config: &Config) -> Self {
        let zone = config.utc_offset();
        let fallback = config.fallback_window();
        let boundary = fallback.today(zone);
        let inner = Arc::new(StatusInner {
            api,
            cache,
            zone,
            fallback,
            status_ttl: config.status_ttl(),
            deadline: config.request_deadline(),
            state: Mutex::new(StatusState {
                status: None,
                phase: derive_phase(Utc::now(), boundary),
                boundary,
                loading: true,
            }),
        });

        let poll_inner = Arc::clone(&inner);
        let poll = RepeatingTask::new(config.status_poll_interval(), move || {
            let inner = Arc::clone(&poll_inner);
            async move { inner.fetch_status().await }
        });

        let tick_inner = Arc::clone(&inner);
        let tick = RepeatingTask::new(config.phase_tick_interval(), move || {
            let inner = Arc::clone(&tick_inner);
            async move { inner.recompute() }
        });

        Self { inner, poll, tick }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.inner.state.lock().unwrap();
        StatusSnapshot {
            phase: state.phase,
            is_active: state
                .status
                .as_ref()
                .map(|status| status.is_active)
                .unwrap_or(false),
            results_published: state
                .status
                .as_ref()
                .map(|status| status.results_published)
                .unwrap_or(false),
            loading: state.loading,
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().unwrap().phase
    }

    /// Whether a vote may be submitted right now. The server flag and the
    /// time-derived phase are independent authorities; the more restrictive
    /// one governs.
    pub fn can_vote(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.is_active && snapshot.phase == Phase::Active
    }

    /// Whether tallies may be fetched: the election must have ended by
    /// either signal, the time boundary or the server deactivating it.
    pub fn results_available(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.phase == Phase::Ended || !snapshot.is_active
    }

    /// Countdown to the next boundary, formatted for display.
    /// `None` once the election has ended.
    pub fn remaining(&self) -> Option<String> {
        let state = self.inner.state.lock().unwrap();
        let now = Utc::now();
        match derive_phase(now, state.boundary) {
            Phase::NotStarted => Some(format_remaining(state.boundary.start - now)),
            Phase::Active => Some(format_remaining(state.boundary.end - now)),
            Phase::Ended => None,
        }
    }

    /// Debounced forced refresh of the status, e.g. behind a refresh button.
    /// Resolves once the collapsed fetch has completed and been adopted.
    pub async fn refresh(&self) {
        let inner = Arc::clone(&self.inner);
        let api = Arc::clone(&inner.api);
        inner
            .cache
            .refresh("status", move || {
                let api = Arc::clone(&api);
                async move { api.election_status().await }
            })
            .await;
        match self.inner.cache.cached::<ElectionStatus>("status") {
            Some(status) => self.inner.adopt(status),
            None => self
                .inner
                .fall_back(Error::BadResponse("no status after refresh".to_string())),
        }
    }

    /// Stop both timers. Nothing fires after this returns.
    pub fn dispose(&self) {
        self.poll.cancel();
        self.tick.cancel();
    }
}

impl StatusInner {
    async fn fetch_status(self: Arc<Self>) {
        let api = Arc::clone(&self.api);
        let fetch = move || {
            let api = Arc::clone(&api);
            async move { api.election_status().await }
        };
        let outcome = tokio::time::timeout(
            self.deadline,
            self.cache.fetch("status", self.status_ttl, false, fetch),
        )
        .await;
        match outcome {
            Ok(Ok(status)) => self.adopt(status),
            Ok(Err(err)) => self.fall_back(err),
            Err(_) => self.fall_back(Error::Timeout(self.deadline.as_secs())),
        }
    }

    /// Take on a freshly fetched status. A status whose window cannot be
    /// accepted is handled like a failed fetch.
    fn adopt(&self, status: ElectionStatus) {
        match status.boundary(self.zone, &self.fallback) {
            Ok(boundary) => {
                let mut state = self.state.lock().unwrap();
                state.phase = derive_phase(Utc::now(), boundary);
                state.boundary = boundary;
                state.status = Some(status);
                state.loading = false;
            }
            Err(err) => self.fall_back(err),
        }
    }

    fn fall_back(&self, err: Error) {
        let mut state = self.state.lock().unwrap();
        if state.status.is_some() {
            // Keep the last good status; the tick keeps deriving from it.
            warn!("Status refresh failed ({err}); keeping last known status");
        } else {
            warn!("No election status available ({err}); assuming an inactive election");
            state.boundary = self.fallback.today(self.zone);
            state.phase = derive_phase(Utc::now(), state.boundary);
        }
        state.loading = false;
    }

    /// Pure re-derivation from the current instant and the last-known
    /// boundary. Runs every second; never reads the previous phase.
    fn recompute(&self) {
        let mut state = self.state.lock().unwrap();
        state.phase = derive_phase(Utc::now(), state.boundary);
        state.loading = false;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Timelike;

    use crate::api::stub::StubApi;

    use super::*;

    /// A status whose window covers the whole of today, so the derived
    /// phase is `Active` for the duration of the test run.
    fn all_day_status() -> ElectionStatus {
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        ElectionStatus {
            is_active: true,
            voting_start_date: today.clone(),
            voting_end_date: today,
            voting_start_time: "00:00".to_string(),
            voting_end_time: "23:59:59".to_string(),
            results_published: false,
        }
    }

    fn machine(api: Arc<StubApi>, config: &Config) -> ElectionStatusMachine {
        let cache = Arc::new(CacheClient::new(std::time::Duration::from_secs(2)));
        ElectionStatusMachine::new(api, cache, config)
    }

    #[tokio::test(start_paused = true)]
    async fn adopts_the_fetched_status() {
        let api = Arc::new(StubApi::new());
        api.status.set(Some(all_day_status()));
        let machine = machine(Arc::clone(&api), &Config::default());

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let snapshot = machine.snapshot();
        assert!(!snapshot.loading);
        assert!(snapshot.is_active);
        assert_eq!(snapshot.phase, Phase::Active);
        assert!(machine.can_vote());
        assert!(!machine.results_available());
    }

    #[tokio::test(start_paused = true)]
    async fn synthesizes_a_conservative_default_when_the_backend_is_down() {
        log4rs_test_utils::test_logging::init_logging_once_for(
            ["schoolvote_client"],
            None,
            None,
        );

        let api = Arc::new(StubApi::new());
        let machine = machine(Arc::clone(&api), &Config::default());

        // The initial fetch exhausts its retries before falling back.
        tokio::time::sleep(std::time::Duration::from_secs(8)).await;

        let snapshot = machine.snapshot();
        assert!(!snapshot.loading);
        assert!(!snapshot.is_active);
        // The default never permits a vote.
        assert!(!machine.can_vote());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivated_election_blocks_voting_inside_the_window() {
        let api = Arc::new(StubApi::new());
        let mut status = all_day_status();
        status.is_active = false;
        api.status.set(Some(status));
        let machine = machine(Arc::clone(&api), &Config::default());

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        // Time says Active, the server says no; the server wins.
        assert_eq!(machine.phase(), Phase::Active);
        assert!(!machine.can_vote());
        // Deactivation also releases the results.
        assert!(machine.results_available());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_window_falls_back_like_a_failed_fetch() {
        let api = Arc::new(StubApi::new());
        let mut status = all_day_status();
        status.voting_start_date = "2030-01-01".to_string();
        status.voting_end_date = "2020-01-01".to_string();
        api.status.set(Some(status));
        let machine = machine(Arc::clone(&api), &Config::default());

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let snapshot = machine.snapshot();
        assert!(!snapshot.is_active);
        assert!(!machine.can_vote());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_the_configured_interval() {
        let api = Arc::new(StubApi::new());
        api.status.set(Some(all_day_status()));
        let machine = machine(Arc::clone(&api), &Config::default());

        // Immediate fetch plus one per 30s interval; the short status TTL
        // makes each poll go back to the network.
        tokio::time::sleep(std::time::Duration::from_secs(65)).await;
        assert_eq!(api.status.calls(), 3);
        machine.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_after_dispose() {
        let api = Arc::new(StubApi::new());
        api.status.set(Some(all_day_status()));
        let machine = machine(Arc::clone(&api), &Config::default());

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        machine.dispose();
        let calls_at_dispose = api.status.calls();

        tokio::time::sleep(std::time::Duration::from_secs(300)).await;
        assert_eq!(api.status.calls(), calls_at_dispose);
    }

    #[tokio::test]
    async fn phase_flips_at_the_boundary_without_a_poll() {
        // Real time: the end of the window is two seconds away and the next
        // poll is far in the future, so only the tick can flip the phase.
        let now = Utc::now();
        if now.hour() == 23 && now.minute() >= 58 {
            // Too close to midnight for a same-day window; skip this run.
            return;
        }
        let end = now + Duration::seconds(3);
        let api = Arc::new(StubApi::new());
        let mut status = all_day_status();
        status.voting_end_time = end.format("%H:%M:%S").to_string();
        api.status.set(Some(status));
        let machine = machine(Arc::clone(&api), &Config::default());

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(machine.phase(), Phase::Active);

        tokio::time::sleep(std::time::Duration::from_secs(4)).await;
        assert_eq!(machine.phase(), Phase::Ended);
        assert!(machine.results_available());
        machine.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down_to_the_end() {
        let api = Arc::new(StubApi::new());
        api.status.set(Some(all_day_status()));
        let machine = machine(Arc::clone(&api), &Config::default());

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let remaining = machine.remaining().unwrap();
        assert!(remaining.ends_with('s'));
        machine.dispose();
    }
}

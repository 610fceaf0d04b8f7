use std::sync::Arc;

use chrono::{Duration, FixedOffset, NaiveTime};
use log::warn;
use serde::Deserialize;

pub mod api;
pub mod cache;
pub mod error;
pub mod model;
pub mod results;
pub mod scheduled_task;
pub mod status;
pub mod time_window;
pub mod vote;

use crate::api::{ElectionApi, HttpApi};
use crate::cache::CacheClient;
use crate::error::Result;
use crate::model::election::FallbackWindow;
use crate::model::settings::ElectionSettings;
use crate::model::voter::VoterIdentity;
use crate::results::ResultsAggregator;
use crate::status::ElectionStatusMachine;
use crate::vote::VoteProtocol;

/// Client configuration. Every field has a working default, so deployments
/// only override what differs; intervals and deadlines are in seconds
/// unless named otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    base_url: String,
    election_id: String,
    utc_offset_minutes: i32,
    fallback_start_time: String,
    fallback_end_time: String,
    status_ttl: u64,
    status_poll_interval: u64,
    phase_tick_interval: u64,
    results_ttl: u64,
    results_poll_interval: u64,
    positions_ttl: u64,
    settings_ttl: u64,
    debounce_window_ms: u64,
    request_deadline: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            election_id: String::new(),
            utc_offset_minutes: 0,
            fallback_start_time: "08:00".to_string(),
            fallback_end_time: "17:00".to_string(),
            status_ttl: 5,
            status_poll_interval: 30,
            phase_tick_interval: 1,
            results_ttl: 5,
            results_poll_interval: 10,
            positions_ttl: 60,
            settings_ttl: 300,
            debounce_window_ms: 2000,
            request_deadline: 10,
        }
    }
}

impl Config {
    pub fn new(base_url: &str, election_id: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            election_id: election_id.to_string(),
            ..Self::default()
        }
    }

    /// Base URL of the backend.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Identifier of the election this client is bound to, echoed in
    /// validation requests.
    pub fn election_id(&self) -> &str {
        &self.election_id
    }

    /// The institution's fixed reference zone. All boundary date/time
    /// strings from the backend are interpreted in this zone.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| {
            warn!(
                "UTC offset of {} minutes is out of range; using UTC",
                self.utc_offset_minutes
            );
            FixedOffset::east_opt(0).expect("zero offset is always valid")
        })
    }

    /// The default voting window applied when the backend supplies
    /// malformed times or no status at all. A guessed business rule, so it
    /// is configuration rather than logic.
    pub fn fallback_window(&self) -> FallbackWindow {
        let start = NaiveTime::parse_from_str(&self.fallback_start_time, "%H:%M").ok();
        let end = NaiveTime::parse_from_str(&self.fallback_end_time, "%H:%M").ok();
        match (start, end) {
            (Some(start), Some(end)) if start <= end => FallbackWindow { start, end },
            _ => {
                warn!(
                    "Invalid fallback window \"{}\"-\"{}\"; using 08:00-17:00",
                    self.fallback_start_time, self.fallback_end_time
                );
                FallbackWindow {
                    start: NaiveTime::from_hms_opt(8, 0, 0).expect("literal time is valid"),
                    end: NaiveTime::from_hms_opt(17, 0, 0).expect("literal time is valid"),
                }
            }
        }
    }

    /// How long a fetched status stays fresh. Kept shorter than the poll
    /// interval so every poll reaches the network.
    pub fn status_ttl(&self) -> Duration {
        Duration::seconds(self.status_ttl as i64)
    }

    /// How often the status is refetched.
    pub fn status_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.status_poll_interval)
    }

    /// How often the phase is re-derived from the clock.
    pub fn phase_tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.phase_tick_interval)
    }

    /// How long fetched results stay fresh.
    pub fn results_ttl(&self) -> Duration {
        Duration::seconds(self.results_ttl as i64)
    }

    /// How often the results page refetches while polling.
    pub fn results_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.results_poll_interval)
    }

    /// How long prefetched candidate data stays fresh.
    pub fn positions_ttl(&self) -> Duration {
        Duration::seconds(self.positions_ttl as i64)
    }

    /// How long cached settings stay fresh.
    pub fn settings_ttl(&self) -> Duration {
        Duration::seconds(self.settings_ttl as i64)
    }

    /// Width of the forced-refresh debounce window.
    pub fn debounce_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_window_ms)
    }

    /// Deadline for validation, submission and status calls.
    pub fn request_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_deadline)
    }
}

/// The composition root: owns the cache, the status machine, the vote
/// protocol and the results aggregator, wired to one backend.
pub struct ElectionClient {
    api: Arc<dyn ElectionApi>,
    cache: Arc<CacheClient>,
    status: Arc<ElectionStatusMachine>,
    votes: VoteProtocol,
    results: Arc<ResultsAggregator>,
    settings_ttl: Duration,
}

impl ElectionClient {
    /// Connect to the backend named in the config.
    pub fn new(config: Config) -> Result<Self> {
        let api: Arc<dyn ElectionApi> = Arc::new(HttpApi::new(
            config.base_url(),
            config.request_deadline(),
        )?);
        Ok(Self::with_api(api, config))
    }

    /// Wire the components around an existing `ElectionApi` implementation.
    pub fn with_api(api: Arc<dyn ElectionApi>, config: Config) -> Self {
        let cache = Arc::new(CacheClient::new(config.debounce_window()));
        let status = Arc::new(ElectionStatusMachine::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            &config,
        ));
        let votes = VoteProtocol::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            Arc::clone(&status),
            &config,
        );
        let results = Arc::new(ResultsAggregator::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            Arc::clone(&status),
            &config,
        ));
        Self {
            api,
            cache,
            status,
            votes,
            results,
            settings_ttl: config.settings_ttl(),
        }
    }

    pub fn status(&self) -> &ElectionStatusMachine {
        &self.status
    }

    pub fn votes(&self) -> &VoteProtocol {
        &self.votes
    }

    pub fn results(&self) -> &Arc<ResultsAggregator> {
        &self.results
    }

    /// The minimal identity cached by a first-time validation, for the
    /// candidate-selection step.
    pub fn cached_voter(&self) -> Option<VoterIdentity> {
        self.cache.cached("voter")
    }

    /// Admin settings, cached under the `"settings"` key.
    pub async fn settings(&self) -> Result<ElectionSettings> {
        let api = Arc::clone(&self.api);
        let fetch = move || {
            let api = Arc::clone(&api);
            async move { api.settings().await }
        };
        self.cache
            .fetch("settings", self.settings_ttl, false, fetch)
            .await
    }

    /// Overwrite the cached settings snapshot. A performance optimization
    /// only; the backend stays the source of truth.
    pub fn save_settings(&self, settings: &ElectionSettings) -> Result<()> {
        self.cache.put("settings", settings)
    }

    /// Tear the client down: stop every timer and release any caller still
    /// waiting on a debounced refresh. Nothing fires afterwards.
    pub fn dispose(self) {
        self.results.stop_polling();
        self.status.dispose();
        self.cache.dispose();
    }
}

#[cfg(test)]
mod tests {
    use crate::api::stub::StubApi;
    use crate::model::election::ElectionStatus;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn settings_are_cached_after_the_first_fetch() {
        let api = Arc::new(StubApi::new());
        api.status.set(Some(ElectionStatus::example()));
        api.settings.set(Some(ElectionSettings::example()));
        let client = ElectionClient::with_api(
            Arc::clone(&api) as Arc<dyn ElectionApi>,
            Config::default(),
        );

        let first = client.settings().await.unwrap();
        let second = client.settings().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.settings.calls(), 1);
        client.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn saved_settings_overwrite_the_cache_entry() {
        let api = Arc::new(StubApi::new());
        api.status.set(Some(ElectionStatus::example()));
        api.settings.set(Some(ElectionSettings::example()));
        let client = ElectionClient::with_api(
            Arc::clone(&api) as Arc<dyn ElectionApi>,
            Config::default(),
        );

        let mut settings = client.settings().await.unwrap();
        settings.max_votes_per_voter = 3;
        client.save_settings(&settings).unwrap();

        // Served from the cache entry, not the backend.
        let reloaded = client.settings().await.unwrap();
        assert_eq!(reloaded.max_votes_per_voter, 3);
        assert_eq!(api.settings.calls(), 1);
        client.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn validated_identity_is_visible_through_the_client() {
        let api = Arc::new(StubApi::new());
        api.status.set(Some(ElectionStatus::example()));
        api.validate.set(Some(crate::api::ValidateResponse {
            success: true,
            error_code: None,
            voter: Some(crate::model::voter::Voter::example()),
        }));
        let client = ElectionClient::with_api(
            Arc::clone(&api) as Arc<dyn ElectionApi>,
            Config::default(),
        );

        assert!(client.cached_voter().is_none());
        client.votes().validate("2024-00117").await.unwrap();
        let identity = client.cached_voter().unwrap();
        assert_eq!(identity.id, "2024-00117");
        client.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_silences_the_whole_client() {
        let api = Arc::new(StubApi::new());
        api.status.set(Some(ElectionStatus::example()));
        let client = ElectionClient::with_api(
            Arc::clone(&api) as Arc<dyn ElectionApi>,
            Config::default(),
        );

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        client.dispose();
        let status_calls = api.status.calls();

        tokio::time::sleep(std::time::Duration::from_secs(300)).await;
        assert_eq!(api.status.calls(), status_calls);
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = Config::new("https://vote.example.edu/api", "sc-2024");
        assert_eq!(config.base_url(), "https://vote.example.edu/api");
        assert_eq!(config.election_id(), "sc-2024");
        assert_eq!(config.debounce_window(), std::time::Duration::from_secs(2));
        assert_eq!(config.request_deadline(), std::time::Duration::from_secs(10));
        assert!(config.status_ttl() < Duration::seconds(config.status_poll_interval as i64));
    }

    #[test]
    fn invalid_fallback_window_reverts_to_the_defaults() {
        let mut config = Config::default();
        config.fallback_start_time = "late".to_string();
        let window = config.fallback_window();
        assert_eq!(window, FallbackWindow::example());

        // Inverted windows are configuration errors too.
        let mut config = Config::default();
        config.fallback_start_time = "18:00".to_string();
        assert_eq!(config.fallback_window(), FallbackWindow::example());
    }

    #[test]
    fn config_deserializes_with_partial_overrides() {
        let config: Config = serde_json::from_str(
            r#"{"base_url": "https://vote.example.edu/api", "utc_offset_minutes": 480}"#,
        )
        .unwrap();
        assert_eq!(config.base_url(), "https://vote.example.edu/api");
        assert_eq!(config.utc_offset(), FixedOffset::east_opt(8 * 3600).unwrap());
        assert_eq!(config.request_deadline(), std::time::Duration::from_secs(10));
    }
}

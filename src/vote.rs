use std::sync::{Arc, Mutex};

use chrono::Duration;
use log::{debug, info};

use crate::api::{
    ElectionApi, Selection, SubmitRequest, ValidateRequest, ValidationErrorCode, VoteReceipt,
};
use crate::cache::CacheClient;
use crate::error::{Error, Result};
use crate::model::voter::{Voter, VoterIdentity, VoteToken};
use crate::status::ElectionStatusMachine;
use crate::Config;

/// Where the current voting attempt stands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VoteStage {
    Idle,
    Validating,
    /// Validated with votes remaining; submission may proceed.
    Accepted,
    /// A valid terminal state, not an error: the voter already used all
    /// their votes and holds the tokens to prove it.
    AlreadyVoted,
    Rejected,
    Submitted,
}

struct AttemptState {
    stage: VoteStage,
    voter: Option<Voter>,
}

/// Drives one voting attempt end to end: validation, local vote-count
/// enforcement, submission, and token bookkeeping.
///
/// Validation and submission go straight to the backend rather than through
/// the cache: they are per-attempt calls that must never be answered stale
/// and never retried automatically.
pub struct VoteProtocol {
    api: Arc<dyn ElectionApi>,
    cache: Arc<CacheClient>,
    status: Arc<ElectionStatusMachine>,
    election_id: String,
    deadline: std::time::Duration,
    positions_ttl: Duration,
    state: Mutex<AttemptState>,
}

impl VoteProtocol {
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
            election_id: config.election_id().to_string(),
            deadline: config.request_deadline(),
            positions_ttl: config.positions_ttl(),
            state: Mutex::new(AttemptState {
                stage: VoteStage::Idle,
                voter: None,
            }),
        }
    }

    pub fn stage(&self) -> VoteStage {
        self.state.lock().unwrap().stage
    }

    /// The voter of the current attempt, as last reported by the backend
    /// plus any tokens recorded since.
    pub fn voter(&self) -> Option<Voter> {
        self.state.lock().unwrap().voter.clone()
    }

    /// Abandon the current attempt.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.stage = VoteStage::Idle;
        state.voter = None;
    }

    /// Validate a voter against the backend. Validation is read-only on the
    /// server, so repeating it for an unchanged voter yields the same
    /// record. `ALREADY_VOTED` comes back as a normal voter record with
    /// `has_voted` set; `WRONG_ELECTION` and timeouts are hard failures that
    /// are never retried here; the voter re-submits deliberately.
    pub async fn validate(&self, voter_id: &str) -> Result<Voter> {
        self.set_stage(VoteStage::Validating);
        let request = ValidateRequest {
            voter_id: voter_id.to_string(),
            current_election_id: self.election_id.clone(),
        };

        let response =
            match tokio::time::timeout(self.deadline, self.api.validate_voter(&request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    self.set_stage(VoteStage::Rejected);
                    return Err(err);
                }
                Err(_) => {
                    self.set_stage(VoteStage::Rejected);
                    return Err(Error::Timeout(self.deadline.as_secs()));
                }
            };

        match response.error_code {
            Some(ValidationErrorCode::WrongElection) => {
                self.set_stage(VoteStage::Rejected);
                Err(Error::WrongElection(voter_id.to_string()))
            }
            Some(ValidationErrorCode::AlreadyVoted) => {
                let mut voter = response.voter.ok_or_else(|| {
                    Error::BadResponse("ALREADY_VOTED without a voter record".to_string())
                })?;
                voter.has_voted = true;
                self.remember(voter.clone(), VoteStage::AlreadyVoted);
                Ok(voter)
            }
            None if response.success => {
                let voter = response.voter.ok_or_else(|| {
                    Error::BadResponse("validation succeeded without a voter record".to_string())
                })?;
                if !voter.has_voted {
                    // First-time voter: keep the identity at hand for the
                    // candidate-selection step and warm the candidate data.
                    self.cache.put("voter", &VoterIdentity::from(&voter))?;
                    self.prefetch_positions();
                }
                let stage = if voter.votes_remaining() > 0 {
                    VoteStage::Accepted
                } else {
                    VoteStage::AlreadyVoted
                };
                self.remember(voter.clone(), stage);
                Ok(voter)
            }
            None => {
                self.set_stage(VoteStage::Rejected);
                Err(Error::BadResponse(format!(
                    "validation refused for voter {voter_id}"
                )))
            }
        }
    }

    /// Submit the selections for the validated voter. Refused locally,
    /// without any network traffic, when the phase or authority flag forbid
    /// voting or the voter has no votes left; in the latter case the last
    /// token is surfaced as proof of the earlier vote. Never retried after a
    /// timeout; retry is the voter's decision.
    pub async fn submit(&self, selections: Vec<Selection>) -> Result<VoteReceipt> {
        if !self.status.can_vote() {
            return Err(Error::VotingClosed);
        }

        let voter_id = {
            let state = self.state.lock().unwrap();
            let voter = state.voter.as_ref().ok_or(Error::NotValidated)?;
            if voter.votes_remaining() == 0 {
                return Err(Error::VotesExhausted {
                    voter_id: voter.id.clone(),
                    vote_count: voter.vote_count,
                    max_votes: voter.max_votes,
                    last_token: voter.last_token().cloned(),
                });
            }
            voter.id.clone()
        };

        let request = SubmitRequest {
            voter_id,
            selections,
        };
        let receipt =
            match tokio::time::timeout(self.deadline, self.api.submit_vote(&request)).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::Timeout(self.deadline.as_secs())),
            };

        let mut state = self.state.lock().unwrap();
        if let Some(voter) = state.voter.as_mut() {
            voter.record_token(VoteToken {
                token: receipt.token.clone(),
                timestamp: receipt.timestamp,
            });
            info!(
                "Vote {} of {} recorded for voter {}",
                voter.vote_count, voter.max_votes, voter.id
            );
        }
        state.stage = VoteStage::Submitted;
        Ok(receipt)
    }

    fn remember(&self, voter: Voter, stage: VoteStage) {
        let mut state = self.state.lock().unwrap();
        state.voter = Some(voter);
        state.stage = stage;
    }

    fn set_stage(&self, stage: VoteStage) {
        self.state.lock().unwrap().stage = stage;
    }

    /// Warm the candidate data in the background. Best effort only: the
    /// outcome never affects the vote flow.
    fn prefetch_positions(&self) {
        let api = Arc::clone(&self.api);
        let cache = Arc::clone(&self.cache);
        let ttl = self.positions_ttl;
        tokio::spawn(async move {
            let fetch = move || {
                let api = Arc::clone(&api);
                async move { api.positions().await }
            };
            if let Err(err) = cache.fetch("positions", ttl, false, fetch).await {
                debug!("Candidate prefetch failed: {err}");
            }
        });
    }
}

use thiserror::Error;

use crate::model::voter::VoteToken;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("Malformed time input: {0}")]
    MalformedTimeInput(String),
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),
    #[error("Voter {0} belongs to a different election")]
    WrongElection(String),
    #[error("Voter {voter_id} has used all {max_votes} of their votes")]
    VotesExhausted {
        voter_id: String,
        vote_count: u32,
        max_votes: u32,
        /// Proof of the previous vote, so the voter can self-verify.
        last_token: Option<VoteToken>,
    },
    #[error("Voting is closed")]
    VotingClosed,
    #[error("No validated voter for this attempt")]
    NotValidated,
    #[error("Results are not available while voting is in progress")]
    ResultsNotAvailable,
    #[error("Unexpected backend response: {0}")]
    BadResponse(String),
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque proof-of-cast-vote issued by the backend per successful submission.
/// Tokens are append-only: once issued they are never mutated or discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteToken {
    pub token: String,
    pub timestamp: DateTime<Utc>,
}

/// A voter as reported by the backend validation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voter {
    pub id: String,
    pub name: String,
    pub has_voted: bool,
    pub vote_count: u32,
    pub max_votes: u32,
    #[serde(default)]
    pub vote_tokens: Vec<VoteToken>,
}

impl Voter {
    /// Votes this voter may still cast. The backend enforces the cap; we
    /// re-check it locally before allowing another submission attempt.
    pub fn votes_remaining(&self) -> u32 {
        self.max_votes.saturating_sub(self.vote_count)
    }

    /// The most recently issued token, if any.
    pub fn last_token(&self) -> Option<&VoteToken> {
        self.vote_tokens.last()
    }

    /// Record a freshly issued token.
    pub fn record_token(&mut self, token: VoteToken) {
        self.vote_tokens.push(token);
        self.vote_count += 1;
        self.has_voted = true;
    }
}

/// The subset of voter data cached for the candidate-selection step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterIdentity {
    pub id: String,
    pub name: String,
}

impl From<&Voter> for VoterIdentity {
    fn from(voter: &Voter) -> Self {
        Self {
            id: voter.id.clone(),
            name: voter.name.clone(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_a_token_consumes_a_vote() {
        let mut voter = Voter::example();
        assert_eq!(voter.votes_remaining(), 1);
        assert!(voter.last_token().is_none());

        voter.record_token(VoteToken {
            token: "TKN-1".to_string(),
            timestamp: Utc::now(),
        });

        assert!(voter.has_voted);
        assert_eq!(voter.votes_remaining(), 0);
        assert_eq!(voter.last_token().unwrap().token, "TKN-1");
    }

    #[test]
    fn tokens_are_append_only() {
        let mut voter = Voter::voted_example();
        let first = voter.vote_tokens.clone();
        voter.record_token(VoteToken {
            token: "TKN-2".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(voter.vote_tokens[..first.len()], first[..]);
        assert_eq!(voter.vote_tokens.len(), first.len() + 1);
    }
}

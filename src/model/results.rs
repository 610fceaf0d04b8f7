use serde::{Deserialize, Serialize};

/// An elected position, e.g. "President".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub title: String,
    /// Display order; smaller values rank higher on the results page.
    pub priority: i32,
}

/// One candidate's tally within a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTally {
    pub candidate_id: String,
    pub name: String,
    pub vote_count: u64,
    #[serde(default)]
    pub percentage: f64,
    /// Explicitly flagged abstention pseudo-candidate. Candidates whose name
    /// reads as an abstention are treated the same way.
    #[serde(default)]
    pub is_abstention: bool,
}

impl CandidateTally {
    /// Whether this entry tallies abstentions rather than a real candidate.
    pub fn counts_abstentions(&self) -> bool {
        if self.is_abstention {
            return true;
        }
        matches!(
            self.name.trim().to_lowercase().as_str(),
            "none" | "none of the listed" | "abstain"
        )
    }
}

/// Abstentions for one position, either taken from an explicit
/// pseudo-candidate or reconstructed from the vote-count shortfall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Abstentions {
    pub count: u64,
    pub percentage: f64,
}

/// Per-position tally as served by `GET /results`. The backend may emit
/// redundant rows for the same position title; aggregation deduplicates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    pub position: Position,
    pub candidates: Vec<CandidateTally>,
    pub total_votes: u64,
    /// Filled in by aggregation; raw server rows normally omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstentions: Option<Abstentions>,
}

/// Turnout statistics served alongside the results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteStats {
    pub total: u64,
    pub voted: u64,
    pub not_voted: u64,
    pub percentage: f64,
}

/// The full `GET /results` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsResponse {
    pub results: Vec<ResultItem>,
    pub stats: VoteStats,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abstention_names_are_recognised_case_insensitively() {
        for name in ["None", "NONE OF THE LISTED", "abstain"] {
            assert!(CandidateTally::example(name, 3).counts_abstentions());
        }
        assert!(!CandidateTally::example("Nonette Cruz", 3).counts_abstentions());
    }

    #[test]
    fn explicit_flag_wins_over_name() {
        let mut tally = CandidateTally::example("Protest Vote", 7);
        tally.is_abstention = true;
        assert!(tally.counts_abstentions());
    }

    #[test]
    fn raw_rows_deserialize_without_abstentions() {
        let item: ResultItem = serde_json::from_str(
            r#"{
                "position": {"id": "p1", "title": "President", "priority": 1},
                "candidates": [
                    {"candidateId": "c1", "name": "Ana", "voteCount": 10}
                ],
                "totalVotes": 12
            }"#,
        )
        .unwrap();
        assert!(item.abstentions.is_none());
        assert_eq!(item.candidates[0].vote_count, 10);
        assert!(!item.candidates[0].is_abstention);
    }
}

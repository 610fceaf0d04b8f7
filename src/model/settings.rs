use serde::{Deserialize, Serialize};

/// Admin panel settings. Cached client-side under the `"settings"` key purely
/// as a performance optimization; the backend remains the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionSettings {
    pub election_title: String,
    pub organization: String,
    pub max_votes_per_voter: u32,
}

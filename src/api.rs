use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    election::ElectionStatus,
    results::{Position, ResultsResponse},
    settings::ElectionSettings,
    voter::Voter,
};

/// The backend HTTP contract. Kept behind a trait so every component can be
/// exercised against a scripted backend.
#[async_trait]
pub trait ElectionApi: Send + Sync {
    async fn election_status(&self) -> Result<ElectionStatus>;
    async fn validate_voter(&self, request: &ValidateRequest) -> Result<ValidateResponse>;
    async fn submit_vote(&self, request: &SubmitRequest) -> Result<VoteReceipt>;
    async fn results(&self) -> Result<ResultsResponse>;
    async fn positions(&self) -> Result<Vec<Position>>;
    async fn settings(&self) -> Result<ElectionSettings>;
}

/// Body of `POST /voters/validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub voter_id: String,
    pub current_election_id: String,
}

/// Error codes the validation endpoint may attach to its response body.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorCode {
    AlreadyVoted,
    WrongElection,
}

/// Response of `POST /voters/validate`. An unsuccessful validation still
/// carries the voter record where the backend has one (notably for
/// `ALREADY_VOTED`, which is a terminal state rather than an error).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ValidationErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voter: Option<Voter>,
}

/// One candidate choice for one position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub position_id: String,
    pub candidate_id: String,
}

/// Body of `POST /votes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub voter_id: String,
    pub selections: Vec<Selection>,
}

/// Receipt for a successfully submitted vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteReceipt {
    pub token: String,
    pub timestamp: DateTime<Utc>,
    pub vote_count: u32,
}

/// `ElectionApi` implementation over the real backend.
pub struct HttpApi {
    base_url: String,
    client: Client,
}

impl HttpApi {
    /// Build a client for the backend at `base_url`. The timeout applies to
    /// whole requests at the transport level; protocol-level deadlines are
    /// layered on top by the callers that need them.
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(self.url(path)).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl ElectionApi for HttpApi {
    async fn election_status(&self) -> Result<ElectionStatus> {
        self.get_json("/election/status").await
    }

    async fn validate_voter(&self, request: &ValidateRequest) -> Result<ValidateResponse> {
        let response = self
            .client
            .post(self.url("/voters/validate"))
            .json(request)
            .send()
            .await?;
        // Validation failures arrive as a JSON body carrying an error code,
        // not as a bare HTTP status; parse the body either way.
        let status = response.status();
        match response.json::<ValidateResponse>().await {
            Ok(body) => Ok(body),
            Err(_) if !status.is_success() => Err(Error::BadResponse(format!(
                "validation failed with HTTP {status}"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn submit_vote(&self, request: &SubmitRequest) -> Result<VoteReceipt> {
        let response = self
            .client
            .post(self.url("/votes"))
            .json(request)
            .send()
            .await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn results(&self) -> Result<ResultsResponse> {
        self.get_json("/results").await
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        self.get_json("/positions").await
    }

    async fn settings(&self) -> Result<ElectionSettings> {
        self.get_json("/settings").await
    }
}

use std::time::Duration;

use async_trait::async_trait;
use dunegate_core::config::{AppConfig, QueryPerformance};
use dunegate_core::{
    AccountUsage, JobId, QueryId, QueryMetadata, QueryParams, QuerySummary, RemoteError,
    RemoteQueryClient, RemoteStatus, RowBatch,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::wire::{
    numeric_id, ErrorResponse, ExecuteRequest, ExecuteResponse, GraphqlResponse, QueriesData,
    QueryResponse, ResultsResponse, StatusResponse, UsageResponse, UsersData,
};

const API_KEY_HEADER: &str = "X-Dune-Api-Key";
const GRAPHQL_REFERER: &str = "https://dune.com/browse/queries";
const SEARCH_PAGE_SIZE: u32 = 10;

const SEARCH_QUERIES: &str = r#"
query SearchQueries($term: String!, $limit: Int!) {
  queries(filters: { name: { contains: $term } }, pagination: { first: $limit }) {
    edges { node { id name description user { name handle } } }
  }
}"#;

const FIND_USER: &str = r#"
query FindUser($name: String!) {
  users(filters: { name: { equals: $name } }) {
    edges { node { id name handle } }
  }
}"#;

const LIST_USER_QUERIES: &str = r#"
query ListUserQueries($userId: Int!, $limit: Int!) {
  queries(filters: { userId: { equals: $userId } }, pagination: { first: $limit }) {
    edges { node { id name description user { name handle } } }
  }
}"#;

/// Backoff schedule for idempotent reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay: Duration::from_millis(250), backoff_multiplier: 2 }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(self.backoff_multiplier.saturating_pow(attempt))
    }
}

#[derive(Clone, Debug)]
pub struct DuneClientConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub graphql_url: String,
    pub timeout: Duration,
    pub performance: QueryPerformance,
    pub retry: RetryPolicy,
}

impl DuneClientConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            api_key: config.dune.api_key.clone(),
            base_url: config.dune.base_url.clone(),
            graphql_url: config.dune.graphql_url.clone(),
            timeout: Duration::from_secs(config.dune.timeout_secs),
            performance: config.dune.performance,
            retry: RetryPolicy { max_retries: config.dune.max_retries, ..RetryPolicy::default() },
        }
    }
}

/// HTTP implementation of [`RemoteQueryClient`] against the Dune API.
///
/// Reads are retried on transport failures, `429` and `5xx`. Submissions are
/// sent exactly once: a retried execute could bill the account twice.
#[derive(Clone)]
pub struct DuneClient {
    http: Client,
    config: DuneClientConfig,
}

impl DuneClient {
    pub fn new(config: DuneClientConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("dunegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| RemoteError::Transport(error.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn from_app_config(config: &AppConfig) -> Result<Self, RemoteError> {
        Self::new(DuneClientConfig::from_app_config(config))
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(API_KEY_HEADER, self.config.api_key.expose_secret())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RemoteError> {
        let url = self.api_url(path);
        self.with_retries(path, || self.authorized(self.http.get(&url).query(query))).await
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        operation: &str,
        query: &str,
        variables: Value,
    ) -> Result<T, RemoteError> {
        let payload = json!({ "operationName": operation, "query": query, "variables": variables });
        let response: GraphqlResponse<T> = self
            .with_retries(operation, || {
                self.http
                    .post(&self.config.graphql_url)
                    .header(reqwest::header::REFERER, GRAPHQL_REFERER)
                    .json(&payload)
            })
            .await?;

        if let Some(error) = response.errors.first() {
            return Err(RemoteError::Rejected { status: 200, message: error.message.clone() });
        }
        response
            .data
            .ok_or_else(|| RemoteError::Decode(format!("{operation} returned no data")))
    }

    async fn with_retries<T, F>(&self, operation: &str, build: F) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let retry = self.config.retry;
        let mut attempt = 0;
        loop {
            let outcome = match build().send().await {
                Ok(response) => decode(response).await,
                Err(error) => Err(Attempt::Retryable(RemoteError::Transport(error.to_string()))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(Attempt::Fatal(error)) => return Err(error),
                Err(Attempt::Retryable(error)) if attempt >= retry.max_retries => return Err(error),
                Err(Attempt::Retryable(error)) => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        event_name = "dune.request.retry",
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying dune request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

enum Attempt {
    Retryable(RemoteError),
    Fatal(RemoteError),
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, Attempt> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|error| Attempt::Fatal(RemoteError::Decode(error.to_string())));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|parsed| parsed.error)
        .unwrap_or_else(|_| body.trim().chars().take(300).collect());

    let error = if status == StatusCode::NOT_FOUND {
        RemoteError::NotFound(message)
    } else {
        RemoteError::Rejected { status: status.as_u16(), message }
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(Attempt::Retryable(error))
    } else {
        Err(Attempt::Fatal(error))
    }
}

#[async_trait]
impl RemoteQueryClient for DuneClient {
    async fn search(&self, term: &str) -> Result<Vec<QuerySummary>, RemoteError> {
        let data: QueriesData = self
            .graphql(
                "SearchQueries",
                SEARCH_QUERIES,
                json!({ "term": term, "limit": SEARCH_PAGE_SIZE }),
            )
            .await?;
        Ok(data.into_summaries())
    }

    async fn list_user_queries(
        &self,
        user_handle: &str,
        limit: u32,
    ) -> Result<Vec<QuerySummary>, RemoteError> {
        let users: UsersData =
            self.graphql("FindUser", FIND_USER, json!({ "name": user_handle })).await?;
        let user_id = users
            .users
            .edges
            .into_iter()
            .filter_map(|edge| edge.node)
            .find_map(|user| user.id.as_ref().and_then(numeric_id))
            .ok_or_else(|| RemoteError::NotFound(format!("user `{user_handle}`")))?;

        let data: QueriesData = self
            .graphql(
                "ListUserQueries",
                LIST_USER_QUERIES,
                json!({ "userId": user_id, "limit": limit }),
            )
            .await?;
        Ok(data.into_summaries())
    }

    async fn get_metadata(&self, query_id: QueryId) -> Result<QueryMetadata, RemoteError> {
        let response: QueryResponse = self.get_json(&format!("query/{query_id}"), &[]).await?;
        Ok(response.into())
    }

    async fn submit(&self, query_id: QueryId, params: &QueryParams) -> Result<JobId, RemoteError> {
        let url = self.api_url(&format!("query/{query_id}/execute"));
        let body = ExecuteRequest {
            query_parameters: params,
            performance: self.config.performance.as_str(),
        };

        let response = self
            .authorized(self.http.post(&url).json(&body))
            .send()
            .await
            .map_err(|error| RemoteError::Transport(error.to_string()))?;
        let execution: ExecuteResponse = match decode(response).await {
            Ok(execution) => execution,
            Err(Attempt::Retryable(error) | Attempt::Fatal(error)) => return Err(error),
        };

        debug!(
            event_name = "dune.execute.accepted",
            query_id = %query_id,
            execution_id = %execution.execution_id,
            "execution accepted"
        );
        Ok(execution.into())
    }

    async fn poll_status(&self, job_id: &JobId) -> Result<RemoteStatus, RemoteError> {
        let response: StatusResponse =
            self.get_json(&format!("execution/{job_id}/status"), &[]).await?;
        response.into_status().map_err(RemoteError::Decode)
    }

    async fn fetch_rows(
        &self,
        job_id: &JobId,
        limit: u64,
        offset: u64,
    ) -> Result<RowBatch, RemoteError> {
        let response: ResultsResponse = self
            .get_json(
                &format!("execution/{job_id}/results"),
                &[("limit", limit.to_string()), ("offset", offset.to_string())],
            )
            .await?;
        Ok(response.into())
    }

    async fn account_usage(&self) -> Result<AccountUsage, RemoteError> {
        let response: UsageResponse = self.get_json("usage", &[]).await?;
        Ok(response.into())
    }
}

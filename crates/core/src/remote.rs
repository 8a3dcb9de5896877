//! Capability boundary to the remote analytics service.
//!
//! The gateway only ever talks to the service through [`RemoteQueryClient`].
//! Retries, authentication headers and wire formats are the implementor's
//! business; every call here is a single suspension point.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::account::AccountUsage;
use crate::domain::job::JobId;
use crate::domain::query::{QueryId, QueryMetadata, QueryParams, QuerySummary};
use crate::domain::results::{Column, RowBatch};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("remote resource not found: {0}")]
    NotFound(String),
    #[error("could not decode remote response: {0}")]
    Decode(String),
}

/// Execution state as the remote service reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteStatus {
    pub state: RemoteState,
    pub row_count: Option<u64>,
    pub columns: Vec<Column>,
    pub error: Option<String>,
}

impl RemoteStatus {
    pub fn new(state: RemoteState) -> Self {
        Self { state, row_count: None, columns: Vec::new(), error: None }
    }
}

#[async_trait]
pub trait RemoteQueryClient: Send + Sync {
    async fn search(&self, term: &str) -> Result<Vec<QuerySummary>, RemoteError>;

    async fn list_user_queries(
        &self,
        user_handle: &str,
        limit: u32,
    ) -> Result<Vec<QuerySummary>, RemoteError>;

    async fn get_metadata(&self, query_id: QueryId) -> Result<QueryMetadata, RemoteError>;

    async fn submit(&self, query_id: QueryId, params: &QueryParams) -> Result<JobId, RemoteError>;

    async fn poll_status(&self, job_id: &JobId) -> Result<RemoteStatus, RemoteError>;

    async fn fetch_rows(
        &self,
        job_id: &JobId,
        limit: u64,
        offset: u64,
    ) -> Result<RowBatch, RemoteError>;

    async fn account_usage(&self) -> Result<AccountUsage, RemoteError>;
}

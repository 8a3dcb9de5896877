//! In-memory remote used by tests across the workspace.
//!
//! Every submitted job replays the current status script (the last status
//! repeats forever) and serves rows from the current dataset. Call counters
//! make "no remote call happened" assertions possible.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::account::AccountUsage;
use crate::domain::job::JobId;
use crate::domain::query::{QueryId, QueryMetadata, QueryParams, QuerySummary};
use crate::domain::results::{Column, Row, RowBatch};
use crate::remote::{RemoteError, RemoteQueryClient, RemoteState, RemoteStatus};

#[derive(Default)]
struct FixtureState {
    metadata: HashMap<QueryId, QueryMetadata>,
    search_results: Vec<QuerySummary>,
    searched_terms: Vec<String>,
    user_queries: HashMap<String, Vec<QuerySummary>>,
    status_script: Vec<RemoteStatus>,
    jobs: HashMap<JobId, VecDeque<RemoteStatus>>,
    submitted: Vec<(QueryId, QueryParams)>,
    columns: Vec<Column>,
    rows: Vec<Row>,
    usage: AccountUsage,
    submit_error: Option<RemoteError>,
    poll_error: Option<RemoteError>,
    fetch_error: Option<RemoteError>,
}

#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<FixtureState>,
    next_job: AtomicU64,
    search_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    largest_page: AtomicU64,
}

impl InMemoryRemote {
    /// Jobs complete on the first poll unless a status script says otherwise.
    pub fn new() -> Self {
        let remote = Self::default();
        remote.set_status_script(vec![RemoteStatus::new(RemoteState::Completed)]);
        remote
    }

    pub fn with_metadata(self, metadata: QueryMetadata) -> Self {
        self.lock().metadata.insert(metadata.id, metadata);
        self
    }

    pub fn with_search_results(self, results: Vec<QuerySummary>) -> Self {
        self.lock().search_results = results;
        self
    }

    pub fn with_user_queries(self, handle: &str, queries: Vec<QuerySummary>) -> Self {
        self.lock().user_queries.insert(handle.to_string(), queries);
        self
    }

    pub fn with_dataset(self, columns: Vec<Column>, rows: Vec<Row>) -> Self {
        self.set_dataset(columns, rows);
        self
    }

    pub fn with_usage(self, usage: AccountUsage) -> Self {
        self.lock().usage = usage;
        self
    }

    /// Applies to jobs submitted after the call.
    pub fn set_status_script(&self, script: Vec<RemoteStatus>) {
        self.lock().status_script = script;
    }

    pub fn set_dataset(&self, columns: Vec<Column>, rows: Vec<Row>) {
        let mut state = self.lock();
        state.columns = columns;
        state.rows = rows;
    }

    pub fn set_submit_error(&self, error: Option<RemoteError>) {
        self.lock().submit_error = error;
    }

    pub fn set_poll_error(&self, error: Option<RemoteError>) {
        self.lock().poll_error = error;
    }

    pub fn set_fetch_error(&self, error: Option<RemoteError>) {
        self.lock().fetch_error = error;
    }

    pub fn submitted(&self) -> Vec<(QueryId, QueryParams)> {
        self.lock().submitted.clone()
    }

    /// Terms exactly as the remote received them.
    pub fn searched_terms(&self) -> Vec<String> {
        self.lock().searched_terms.clone()
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Largest number of rows handed out by a single `fetch_rows` call.
    pub fn largest_page(&self) -> u64 {
        self.largest_page.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RemoteQueryClient for InMemoryRemote {
    async fn search(&self, term: &str) -> Result<Vec<QuerySummary>, RemoteError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.searched_terms.push(term.to_string());
        Ok(state
            .search_results
            .iter()
            .filter(|summary| summary.name.contains(term))
            .cloned()
            .collect())
    }

    async fn list_user_queries(
        &self,
        user_handle: &str,
        limit: u32,
    ) -> Result<Vec<QuerySummary>, RemoteError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let queries = state
            .user_queries
            .get(user_handle)
            .ok_or_else(|| RemoteError::NotFound(format!("user {user_handle}")))?;
        Ok(queries.iter().take(limit as usize).cloned().collect())
    }

    async fn get_metadata(&self, query_id: QueryId) -> Result<QueryMetadata, RemoteError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .metadata
            .get(&query_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("query {query_id}")))
    }

    async fn submit(&self, query_id: QueryId, params: &QueryParams) -> Result<JobId, RemoteError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(error) = state.submit_error.clone() {
            return Err(error);
        }

        let job_id = JobId(format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst) + 1));
        let script = state.status_script.iter().cloned().collect();
        state.jobs.insert(job_id.clone(), script);
        state.submitted.push((query_id, params.clone()));
        Ok(job_id)
    }

    async fn poll_status(&self, job_id: &JobId) -> Result<RemoteStatus, RemoteError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(error) = state.poll_error.clone() {
            return Err(error);
        }

        let row_count = state.rows.len() as u64;
        let columns = state.columns.clone();
        let script = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RemoteError::NotFound(format!("execution {job_id}")))?;
        let mut status = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
        .unwrap_or_else(|| RemoteStatus::new(RemoteState::Completed));

        if status.state == RemoteState::Completed {
            status.row_count = status.row_count.or(Some(row_count));
            if status.columns.is_empty() {
                status.columns = columns;
            }
        }
        Ok(status)
    }

    async fn fetch_rows(
        &self,
        job_id: &JobId,
        limit: u64,
        offset: u64,
    ) -> Result<RowBatch, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        if let Some(error) = state.fetch_error.clone() {
            return Err(error);
        }
        if !state.jobs.contains_key(job_id) {
            return Err(RemoteError::NotFound(format!("execution {job_id}")));
        }

        let total = state.rows.len() as u64;
        let start = offset.min(total) as usize;
        let end = offset.saturating_add(limit).min(total) as usize;
        let rows: Vec<Row> = state.rows[start..end].to_vec();
        self.largest_page.fetch_max(rows.len() as u64, Ordering::SeqCst);

        Ok(RowBatch {
            columns: state.columns.clone(),
            rows,
            next_offset: (end as u64 > offset && (end as u64) < total).then_some(end as u64),
            total_row_count: Some(total),
        })
    }

    async fn account_usage(&self) -> Result<AccountUsage, RemoteError> {
        Ok(self.lock().usage.clone())
    }
}

/// Builds a row from `(column, value)` pairs.
pub fn row<const N: usize>(cells: [(&str, serde_json::Value); N]) -> Row {
    cells.into_iter().map(|(name, value)| (name.to_string(), value)).collect()
}

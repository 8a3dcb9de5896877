//! Composition root for the agent-facing operations.
//!
//! Lookups go cache first, then remote. Executions go budget, then job
//! tracker, then (on request) summarizer or exporter. Each session has an
//! async lane so authorize, submit and record never interleave for one
//! session while different sessions proceed independently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::budget::{BudgetDecision, BudgetManager, BudgetPolicy, BudgetStatus};
use crate::cache::TtlCache;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::cost::{CostEstimator, FlatCostEstimator};
use crate::domain::account::AccountUsage;
use crate::domain::job::{JobId, JobRecord};
use crate::domain::query::{QueryId, QueryMetadata, QueryParams, QuerySummary};
use crate::domain::session::SessionId;
use crate::errors::{GatewayError, GatewayResult};
use crate::export::{CsvExporter, ExportReceipt, DEFAULT_EXPORT_DIR};
use crate::jobs::{JobTracker, Submission};
use crate::remote::RemoteQueryClient;
use crate::summarizer::{ResultSummarizer, Summary, DEFAULT_PAGE_SIZE, DEFAULT_PREVIEW_ROWS};

pub const DEFAULT_SESSION_ID: &str = "default";
pub const DEFAULT_USER_QUERY_LIMIT: u32 = 10;
const MAX_USER_QUERY_LIMIT: u32 = 100;
const MAX_PREVIEW_ROWS: usize = 1000;

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub policy: BudgetPolicy,
    pub default_query_cost: Decimal,
    pub metadata_ttl: Duration,
    pub search_ttl: Duration,
    pub cache_max_entries: u64,
    pub job_timeout: Duration,
    pub page_size: u64,
    pub preview_rows: usize,
    pub export_dir: PathBuf,
    pub user_handle: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            policy: BudgetPolicy::default(),
            default_query_cost: Decimal::ZERO,
            metadata_ttl: Duration::from_secs(3600),
            search_ttl: Duration::from_secs(300),
            cache_max_entries: 1024,
            job_timeout: Duration::from_secs(600),
            page_size: DEFAULT_PAGE_SIZE,
            preview_rows: DEFAULT_PREVIEW_ROWS,
            export_dir: PathBuf::from(DEFAULT_EXPORT_DIR),
            user_handle: None,
        }
    }
}

impl GatewaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            policy: config.budget.policy(),
            default_query_cost: config.budget.default_query_cost,
            metadata_ttl: config.cache.metadata_ttl(),
            search_ttl: config.cache.search_ttl(),
            cache_max_entries: config.cache.max_entries,
            job_timeout: config.jobs.timeout(),
            page_size: config.jobs.page_size,
            preview_rows: config.jobs.preview_rows,
            export_dir: config.export.directory.clone(),
            user_handle: config.dune.user_handle.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteRequest {
    pub session_id: SessionId,
    pub query_id: QueryId,
    pub params: QueryParams,
    pub timeout: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(session_id: SessionId, query_id: QueryId) -> Self {
        Self { session_id, query_id, params: QueryParams::new(), timeout: None }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Accepted execution plus the session's budget after it was recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub job: JobRecord,
    pub budget: BudgetStatus,
}

type SessionLanes = HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>;

pub struct Gateway {
    remote: Arc<dyn RemoteQueryClient>,
    budget: BudgetManager,
    metadata_cache: TtlCache<QueryId, QueryMetadata>,
    search_cache: TtlCache<String, Vec<QuerySummary>>,
    jobs: JobTracker,
    summarizer: ResultSummarizer,
    exporter: CsvExporter,
    estimator: Arc<dyn CostEstimator>,
    settings: GatewaySettings,
    lanes: Mutex<SessionLanes>,
}

impl Gateway {
    pub fn new(remote: Arc<dyn RemoteQueryClient>, settings: GatewaySettings) -> Self {
        Self::with_clock(remote, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        remote: Arc<dyn RemoteQueryClient>,
        settings: GatewaySettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            budget: BudgetManager::with_clock(settings.policy.clone(), clock.clone()),
            metadata_cache: TtlCache::with_clock(
                settings.cache_max_entries,
                settings.metadata_ttl,
                clock.clone(),
            ),
            search_cache: TtlCache::with_clock(
                settings.cache_max_entries,
                settings.search_ttl,
                clock.clone(),
            ),
            jobs: JobTracker::with_clock(remote.clone(), clock),
            summarizer: ResultSummarizer::new(remote.clone(), settings.page_size),
            exporter: CsvExporter::new(
                remote.clone(),
                settings.export_dir.clone(),
                settings.page_size,
            ),
            estimator: Arc::new(FlatCostEstimator::new(settings.default_query_cost)),
            lanes: Mutex::new(HashMap::new()),
            remote,
            settings,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub async fn search_public_queries(&self, term: &str) -> GatewayResult<Vec<QuerySummary>> {
        let normalized = normalize_term(term);
        if normalized.is_empty() {
            return Err(GatewayError::InvalidParameters("search term must not be empty".to_string()));
        }

        let key = format!("search:{normalized}");
        if let Some(hit) = self.search_cache.get(&key) {
            debug!(event_name = "gateway.search.cache_hit", term = %normalized, "search served from cache");
            return Ok(hit);
        }

        let results = self.remote.search(&normalized).await?;
        self.search_cache.insert(key, results.clone());
        info!(
            event_name = "gateway.search.fetched",
            term = %normalized,
            results = results.len(),
            "search fetched from remote"
        );
        Ok(results)
    }

    /// Queries owned by `user_handle`, or by the configured handle when absent.
    pub async fn list_user_queries(
        &self,
        user_handle: Option<&str>,
        limit: Option<u32>,
    ) -> GatewayResult<Vec<QuerySummary>> {
        let handle = user_handle
            .map(str::trim)
            .filter(|handle| !handle.is_empty())
            .or(self.settings.user_handle.as_deref())
            .ok_or_else(|| {
                GatewayError::InvalidParameters(
                    "no user handle given and none configured (set dune.user_handle)".to_string(),
                )
            })?
            .to_string();
        let limit = limit.unwrap_or(DEFAULT_USER_QUERY_LIMIT).clamp(1, MAX_USER_QUERY_LIMIT);

        let key = format!("user:{}:{limit}", handle.to_ascii_lowercase());
        if let Some(hit) = self.search_cache.get(&key) {
            return Ok(hit);
        }

        let queries = self.remote.list_user_queries(&handle, limit).await?;
        self.search_cache.insert(key, queries.clone());
        Ok(queries)
    }

    /// Cache-backed metadata; `refresh` drops the cached entry first.
    pub async fn get_query_details(
        &self,
        query_id: QueryId,
        refresh: bool,
    ) -> GatewayResult<QueryMetadata> {
        validate_query_id(query_id)?;
        if refresh {
            self.metadata_cache.invalidate(&query_id);
        } else if let Some(hit) = self.metadata_cache.get(&query_id) {
            return Ok(hit);
        }

        let metadata = self.remote.get_metadata(query_id).await?;
        self.metadata_cache.insert(query_id, metadata.clone());
        Ok(metadata)
    }

    pub async fn execute_query(&self, request: ExecuteRequest) -> GatewayResult<Execution> {
        let ExecuteRequest { session_id, query_id, params, timeout } = request;
        validate_query_id(query_id)?;
        self.validate_params(query_id, &params)?;
        let timeout = timeout.unwrap_or(self.settings.job_timeout);
        if timeout.is_zero() {
            return Err(GatewayError::InvalidParameters(
                "execution timeout must be greater than zero".to_string(),
            ));
        }

        let estimate = self.estimator.estimate(query_id, &params);
        let lane = self.lane(&session_id);
        let outcome = {
            let _turn = lane.lock().await;
            self.charge_and_submit(&session_id, query_id, &params, timeout, estimate).await
        };
        self.release_lane(&session_id, lane);
        outcome
    }

    async fn charge_and_submit(
        &self,
        session_id: &SessionId,
        query_id: QueryId,
        params: &QueryParams,
        timeout: Duration,
        estimate: Decimal,
    ) -> GatewayResult<Execution> {
        let grant = match self.budget.authorize(session_id, estimate) {
            BudgetDecision::Allow(grant) => grant,
            BudgetDecision::Deny { limit, reason } => {
                info!(
                    event_name = "gateway.execute.denied",
                    session_id = %session_id,
                    query_id = %query_id,
                    limit = %limit,
                    "execution denied by budget"
                );
                return Err(GatewayError::BudgetExceeded { limit, reason });
            }
        };

        match self.jobs.submit(query_id, params, timeout).await {
            Submission::Accepted(job) => {
                let budget = self.budget.record(grant, estimate);
                info!(
                    event_name = "gateway.execute.submitted",
                    session_id = %session_id,
                    query_id = %query_id,
                    job_id = %job.id,
                    queries_used = budget.queries_used,
                    "execution submitted"
                );
                Ok(Execution { job, budget })
            }
            Submission::Rejected { record, error } => {
                drop(grant);
                warn!(
                    event_name = "gateway.execute.submit_failed",
                    session_id = %session_id,
                    query_id = %query_id,
                    job_id = %record.id,
                    error = %error,
                    "execution submission failed; budget untouched"
                );
                Err(GatewayError::SubmissionFailed { job_id: record.id, error })
            }
        }
    }

    pub async fn get_job_status(&self, job_id: &JobId) -> GatewayResult<JobRecord> {
        self.jobs.poll(job_id).await
    }

    pub async fn get_job_results_summary(
        &self,
        job_id: &JobId,
        preview_rows: Option<usize>,
    ) -> GatewayResult<Summary> {
        let preview_rows = preview_rows.unwrap_or(self.settings.preview_rows);
        if preview_rows > MAX_PREVIEW_ROWS {
            return Err(GatewayError::InvalidParameters(format!(
                "preview_rows must be at most {MAX_PREVIEW_ROWS}"
            )));
        }

        let record = self.jobs.poll(job_id).await?;
        self.summarizer.summarize(&record, preview_rows).await
    }

    pub async fn export_results_to_csv(
        &self,
        job_id: &JobId,
        destination: Option<&str>,
    ) -> GatewayResult<ExportReceipt> {
        let record = self.jobs.poll(job_id).await?;
        self.exporter.export(&record, destination).await
    }

    pub async fn get_account_status(&self) -> GatewayResult<AccountUsage> {
        Ok(self.remote.account_usage().await?)
    }

    pub fn get_session_budget(&self, session_id: &SessionId) -> BudgetStatus {
        self.budget.status(session_id)
    }

    /// Returns the fresh status and whether the session had any history.
    /// Waits for an in-flight execution of the same session to finish first.
    pub async fn reset_session_budget(&self, session_id: &SessionId) -> (BudgetStatus, bool) {
        let lane = self.lane(session_id);
        let outcome = {
            let _turn = lane.lock().await;
            let existed = self.budget.reset(session_id);
            (self.budget.status(session_id), existed)
        };
        self.release_lane(session_id, lane);
        outcome
    }

    fn validate_params(&self, query_id: QueryId, params: &QueryParams) -> GatewayResult<()> {
        let known = self.metadata_cache.get(&query_id);
        for (key, value) in params {
            if key.trim().is_empty() {
                return Err(GatewayError::InvalidParameters(
                    "parameter names must not be empty".to_string(),
                ));
            }
            if !matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                return Err(GatewayError::InvalidParameters(format!(
                    "parameter `{key}` must be a string, number or boolean"
                )));
            }
            if let Some(metadata) = &known {
                if !metadata.declares_parameter(key) {
                    return Err(GatewayError::InvalidParameters(format!(
                        "query {query_id} has no parameter named `{key}`"
                    )));
                }
            }
        }
        Ok(())
    }

    fn lane(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.lanes).entry(session_id.clone()).or_default().clone()
    }

    /// Drops the session's lane once no other caller holds or awaits it.
    fn release_lane(&self, session_id: &SessionId, lane: Arc<tokio::sync::Mutex<()>>) {
        let mut lanes = lock(&self.lanes);
        // Clones are only handed out under the map lock: one here, one in the map.
        let idle = lanes.get(session_id).is_some_and(|held| Arc::ptr_eq(held, &lane))
            && Arc::strong_count(&lane) == 2;
        if idle {
            lanes.remove(session_id);
        }
    }
}

fn validate_query_id(query_id: QueryId) -> GatewayResult<()> {
    if query_id.0 == 0 {
        return Err(GatewayError::InvalidParameters("query id must be a positive integer".to_string()));
    }
    Ok(())
}

/// Collapses whitespace only; the remote filter may be case-sensitive.
fn normalize_term(term: &str) -> String {
    term.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn lock(lanes: &Mutex<SessionLanes>) -> MutexGuard<'_, SessionLanes> {
    match lanes.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{lock, normalize_term, ExecuteRequest, Gateway, GatewaySettings};
    use crate::domain::query::QueryId;
    use crate::domain::session::SessionId;
    use crate::fixtures::InMemoryRemote;

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(InMemoryRemote::new()), GatewaySettings::default())
    }

    fn execute(session: &str) -> ExecuteRequest {
        ExecuteRequest::new(SessionId(session.to_string()), QueryId(42))
    }

    #[test]
    fn search_terms_keep_case_and_collapse_whitespace() {
        assert_eq!(normalize_term("  Uniswap   V3 "), "Uniswap V3");
        assert_eq!(normalize_term("\t"), "");
    }

    #[tokio::test]
    async fn finished_executions_leave_no_session_lanes_behind() {
        let gateway = gateway();

        for session in ["a", "b", "c", "a"] {
            gateway.execute_query(execute(session)).await.expect("execute");
        }
        let (_, existed) = gateway.reset_session_budget(&SessionId("b".to_string())).await;

        assert!(existed);
        assert!(lock(&gateway.lanes).is_empty());
    }

    #[tokio::test]
    async fn reset_waits_for_the_session_turn_in_progress() {
        let gateway = gateway();
        let session = SessionId("s1".to_string());
        gateway.execute_query(execute("s1")).await.expect("execute");

        let held = gateway.lane(&session);
        let turn = held.lock().await;
        let reset = gateway.reset_session_budget(&session);
        tokio::pin!(reset);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut reset).await.is_err());
        assert_eq!(gateway.get_session_budget(&session).queries_used, 1);
        assert_eq!(lock(&gateway.lanes).len(), 1);

        drop(turn);
        drop(held);
        let (status, existed) = reset.await;

        assert!(existed);
        assert_eq!(status.queries_used, 0);
        assert!(lock(&gateway.lanes).is_empty());
    }
}

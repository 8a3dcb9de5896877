//! Job lifecycle tracking.
//!
//! Turns the remote "submit, then poll" contract into an explicit state
//! machine:
//!
//! ```text
//! Submitted -> Pending -> Executing -> { Completed | Failed | TimedOut }
//! ```
//!
//! State only moves when someone calls [`JobTracker::poll`]; there is no
//! background timer. Terminal records are answered from the tracker and never
//! trigger another remote call.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::domain::job::{JobId, JobOutcome, JobRecord, JobState};
use crate::domain::query::{QueryId, QueryParams};
use crate::errors::{GatewayError, GatewayResult};
use crate::remote::{RemoteError, RemoteQueryClient, RemoteState, RemoteStatus};

/// Result of handing a query to the remote service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Accepted(JobRecord),
    /// The record is already `Failed` and tracked under a local handle.
    Rejected { record: JobRecord, error: RemoteError },
}

impl Submission {
    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Accepted(record) | Self::Rejected { record, .. } => record,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            Self::Accepted(record) | Self::Rejected { record, .. } => record,
        }
    }
}

pub struct JobTracker {
    remote: Arc<dyn RemoteQueryClient>,
    records: RwLock<HashMap<JobId, JobRecord>>,
    clock: Arc<dyn Clock>,
}

impl JobTracker {
    pub fn new(remote: Arc<dyn RemoteQueryClient>) -> Self {
        Self::with_clock(remote, Arc::new(SystemClock))
    }

    pub fn with_clock(remote: Arc<dyn RemoteQueryClient>, clock: Arc<dyn Clock>) -> Self {
        Self { remote, records: RwLock::new(HashMap::new()), clock }
    }

    /// Submits the query and starts tracking it. Never retries.
    pub async fn submit(
        &self,
        query_id: QueryId,
        params: &QueryParams,
        timeout: Duration,
    ) -> Submission {
        let submitted = self.remote.submit(query_id, params).await;
        let now = self.clock.now();
        let deadline = deadline_after(now, timeout);

        let submission = match submitted {
            Ok(job_id) => {
                info!(
                    event_name = "jobs.submit.accepted",
                    job_id = %job_id,
                    query_id = %query_id,
                    timeout_secs = timeout.as_secs(),
                    "query submitted"
                );
                Submission::Accepted(JobRecord {
                    id: job_id,
                    query_id,
                    state: JobState::Submitted,
                    submitted_at: now,
                    last_polled_at: None,
                    deadline,
                    outcome: None,
                })
            }
            Err(error) => {
                let job_id = JobId(format!("local-{}", Uuid::new_v4()));
                warn!(
                    event_name = "jobs.submit.rejected",
                    job_id = %job_id,
                    query_id = %query_id,
                    error = %error,
                    "query submission failed"
                );
                let record = JobRecord {
                    id: job_id,
                    query_id,
                    state: JobState::Failed,
                    submitted_at: now,
                    last_polled_at: None,
                    deadline,
                    outcome: Some(JobOutcome {
                        error: Some(error.to_string()),
                        ..JobOutcome::default()
                    }),
                };
                Submission::Rejected { record, error }
            }
        };

        let record = submission.record();
        self.write().insert(record.id.clone(), record.clone());
        submission
    }

    /// Current record without contacting the remote service.
    pub fn get(&self, job_id: &JobId) -> GatewayResult<JobRecord> {
        self.read().get(job_id).cloned().ok_or_else(|| GatewayError::JobNotFound(job_id.clone()))
    }

    /// Advances a non-terminal record by one observation of the remote status.
    ///
    /// Idempotent for terminal records. A remote error leaves the record as it
    /// was and surfaces as [`GatewayError::RemoteUnavailable`].
    pub async fn poll(&self, job_id: &JobId) -> GatewayResult<JobRecord> {
        let current = self.get(job_id)?;
        if current.is_terminal() {
            return Ok(current);
        }

        let now = self.clock.now();
        if now >= current.deadline {
            return self.apply(job_id, now, |record| {
                record.state = JobState::TimedOut;
                record.outcome = Some(JobOutcome {
                    error: Some(format!(
                        "no terminal state before deadline {}",
                        record.deadline.to_rfc3339()
                    )),
                    ..JobOutcome::default()
                });
            });
        }

        let status = self.remote.poll_status(job_id).await?;
        let observed_at = self.clock.now();

        self.apply(job_id, observed_at, |record| {
            record.state = advance(record.state, status.state);
            if record.state.is_terminal() {
                record.outcome = Some(outcome_from(&status));
            }
        })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn apply<F>(
        &self,
        job_id: &JobId,
        observed_at: DateTime<Utc>,
        update: F,
    ) -> GatewayResult<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut records = self.write();
        let record =
            records.get_mut(job_id).ok_or_else(|| GatewayError::JobNotFound(job_id.clone()))?;

        // Another poll got here first with a terminal answer; keep it.
        if record.is_terminal() {
            return Ok(record.clone());
        }

        let from = record.state;
        update(record);
        record.last_polled_at = Some(observed_at);

        if from != record.state {
            info!(
                event_name = "jobs.poll.transition",
                job_id = %job_id,
                from = %from,
                to = %record.state,
                "job state changed"
            );
        } else {
            debug!(event_name = "jobs.poll.unchanged", job_id = %job_id, state = %from, "job state unchanged");
        }

        Ok(record.clone())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Next local state for a remote observation. Never moves backwards from
/// `Executing` to `Pending`.
pub fn advance(current: JobState, remote: RemoteState) -> JobState {
    if current.is_terminal() {
        return current;
    }
    match remote {
        RemoteState::Pending if current == JobState::Executing => JobState::Executing,
        RemoteState::Pending => JobState::Pending,
        RemoteState::Executing => JobState::Executing,
        RemoteState::Completed => JobState::Completed,
        RemoteState::Failed | RemoteState::Cancelled | RemoteState::Expired => JobState::Failed,
    }
}

fn outcome_from(status: &RemoteStatus) -> JobOutcome {
    let error = match status.state {
        RemoteState::Completed => None,
        RemoteState::Cancelled => {
            Some(status.error.clone().unwrap_or_else(|| "execution was cancelled".to_string()))
        }
        RemoteState::Expired => {
            Some(status.error.clone().unwrap_or_else(|| "execution results expired".to_string()))
        }
        _ => Some(status.error.clone().unwrap_or_else(|| "execution failed".to_string())),
    };

    JobOutcome { row_count: status.row_count, columns: status.columns.clone(), error }
}

fn deadline_after(start: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| start.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::{advance, JobTracker, Submission};
    use crate::clock::ManualClock;
    use crate::domain::account::AccountUsage;
    use crate::domain::job::{JobId, JobRecord, JobState};
    use crate::domain::query::{QueryId, QueryMetadata, QueryParams, QuerySummary};
    use crate::domain::results::RowBatch;
    use crate::errors::GatewayError;
    use crate::fixtures::InMemoryRemote;
    use crate::remote::{RemoteError, RemoteQueryClient, RemoteState, RemoteStatus};

    fn tracker(remote: &Arc<InMemoryRemote>) -> (JobTracker, ManualClock) {
        let clock = ManualClock::default();
        let tracker = JobTracker::with_clock(remote.clone(), Arc::new(clock.clone()));
        (tracker, clock)
    }

    async fn submit(tracker: &JobTracker, timeout_secs: u64) -> JobRecord {
        tracker
            .submit(QueryId(1), &QueryParams::new(), Duration::from_secs(timeout_secs))
            .await
            .into_record()
    }

    #[test]
    fn advance_follows_the_lifecycle() {
        assert_eq!(advance(JobState::Submitted, RemoteState::Pending), JobState::Pending);
        assert_eq!(advance(JobState::Pending, RemoteState::Executing), JobState::Executing);
        assert_eq!(advance(JobState::Executing, RemoteState::Pending), JobState::Executing);
        assert_eq!(advance(JobState::Submitted, RemoteState::Completed), JobState::Completed);
        assert_eq!(advance(JobState::Executing, RemoteState::Cancelled), JobState::Failed);
        assert_eq!(advance(JobState::Completed, RemoteState::Failed), JobState::Completed);
    }

    #[tokio::test]
    async fn submit_creates_submitted_record() {
        let remote = Arc::new(InMemoryRemote::new());
        let (tracker, _clock) = tracker(&remote);

        let record = tracker
            .submit(QueryId(7), &QueryParams::new(), Duration::from_secs(60))
            .await
            .into_record();

        assert_eq!(record.state, JobState::Submitted);
        assert_eq!(record.query_id, QueryId(7));
        assert_eq!(tracker.get(&record.id).expect("tracked"), record);
        assert_eq!(remote.submit_calls(), 1);
    }

    #[tokio::test]
    async fn remote_submit_failure_yields_failed_record() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_submit_error(Some(RemoteError::Rejected {
            status: 402,
            message: "out of credits".to_string(),
        }));
        let (tracker, _clock) = tracker(&remote);

        let submission =
            tracker.submit(QueryId(7), &QueryParams::new(), Duration::from_secs(60)).await;
        let Submission::Rejected { record, error } = submission else {
            panic!("submission should be rejected");
        };

        assert_eq!(error.to_string(), "remote rejected request with status 402: out of credits");
        assert!(record.id.0.starts_with("local-"));
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error().is_some_and(|error| error.contains("out of credits")));
        assert_eq!(tracker.poll(&record.id).await.expect("tracked"), record);
        assert_eq!(remote.poll_calls(), 0);
    }

    #[tokio::test]
    async fn poll_walks_through_states_to_completion() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_status_script(vec![
            RemoteStatus::new(RemoteState::Pending),
            RemoteStatus::new(RemoteState::Executing),
            RemoteStatus::new(RemoteState::Completed),
        ]);
        let (tracker, _clock) = tracker(&remote);
        let job = submit(&tracker, 60).await;

        assert_eq!(tracker.poll(&job.id).await.expect("poll").state, JobState::Pending);
        assert_eq!(tracker.poll(&job.id).await.expect("poll").state, JobState::Executing);
        let done = tracker.poll(&job.id).await.expect("poll");
        assert_eq!(done.state, JobState::Completed);
        assert!(done.last_polled_at.is_some());
        assert!(done.outcome.is_some());
    }

    #[tokio::test]
    async fn polling_a_terminal_record_does_not_contact_remote() {
        let remote = Arc::new(InMemoryRemote::new());
        let (tracker, _clock) = tracker(&remote);
        let job = submit(&tracker, 60).await;

        let first = tracker.poll(&job.id).await.expect("poll");
        assert_eq!(first.state, JobState::Completed);
        assert_eq!(remote.poll_calls(), 1);

        for _ in 0..3 {
            assert_eq!(tracker.poll(&job.id).await.expect("poll"), first);
        }
        assert_eq!(remote.poll_calls(), 1);
    }

    #[tokio::test]
    async fn deadline_turns_pending_into_timed_out_without_remote_call() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_status_script(vec![RemoteStatus::new(RemoteState::Pending)]);
        let (tracker, clock) = tracker(&remote);
        let job = submit(&tracker, 30).await;

        assert_eq!(tracker.poll(&job.id).await.expect("poll").state, JobState::Pending);
        clock.advance(chrono::Duration::seconds(31));

        let timed_out = tracker.poll(&job.id).await.expect("poll");
        assert_eq!(timed_out.state, JobState::TimedOut);
        assert_eq!(remote.poll_calls(), 1);
        assert_eq!(tracker.poll(&job.id).await.expect("poll"), timed_out);
    }

    #[tokio::test]
    async fn remote_poll_error_leaves_record_untouched() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_status_script(vec![RemoteStatus::new(RemoteState::Executing)]);
        let (tracker, _clock) = tracker(&remote);
        let job = submit(&tracker, 30).await;

        remote.set_poll_error(Some(RemoteError::Transport("connection reset".to_string())));
        let error = tracker.poll(&job.id).await.expect_err("remote failure");

        assert!(matches!(error, GatewayError::RemoteUnavailable(_)));
        assert_eq!(tracker.get(&job.id).expect("tracked").state, JobState::Submitted);
    }

    #[tokio::test]
    async fn unknown_handle_is_job_not_found() {
        let remote = Arc::new(InMemoryRemote::new());
        let (tracker, _clock) = tracker(&remote);

        let error = tracker.poll(&JobId("nope".to_string())).await.expect_err("unknown");
        assert_eq!(error, GatewayError::JobNotFound(JobId("nope".to_string())));
    }

    #[tokio::test]
    async fn failed_remote_state_records_error_message() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_status_script(vec![RemoteStatus {
            error: Some("line 3: column foo does not exist".to_string()),
            ..RemoteStatus::new(RemoteState::Failed)
        }]);
        let (tracker, _clock) = tracker(&remote);
        let job = submit(&tracker, 30).await;

        let failed = tracker.poll(&job.id).await.expect("poll");
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error(), Some("line 3: column foo does not exist"));
    }

    /// Holds the first status read until released; later reads see `Completed`.
    #[derive(Default)]
    struct GatedRemote {
        inner: InMemoryRemote,
        polls: AtomicUsize,
        first_poll_started: Notify,
        release_first_poll: Notify,
    }

    #[async_trait]
    impl RemoteQueryClient for GatedRemote {
        async fn search(&self, term: &str) -> Result<Vec<QuerySummary>, RemoteError> {
            self.inner.search(term).await
        }

        async fn list_user_queries(
            &self,
            user_handle: &str,
            limit: u32,
        ) -> Result<Vec<QuerySummary>, RemoteError> {
            self.inner.list_user_queries(user_handle, limit).await
        }

        async fn get_metadata(&self, query_id: QueryId) -> Result<QueryMetadata, RemoteError> {
            self.inner.get_metadata(query_id).await
        }

        async fn submit(&self, query_id: QueryId, params: &QueryParams) -> Result<JobId, RemoteError> {
            self.inner.submit(query_id, params).await
        }

        async fn poll_status(&self, _job_id: &JobId) -> Result<RemoteStatus, RemoteError> {
            if self.polls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.first_poll_started.notify_one();
                self.release_first_poll.notified().await;
                return Ok(RemoteStatus::new(RemoteState::Executing));
            }
            Ok(RemoteStatus { row_count: Some(3), ..RemoteStatus::new(RemoteState::Completed) })
        }

        async fn fetch_rows(
            &self,
            job_id: &JobId,
            limit: u64,
            offset: u64,
        ) -> Result<RowBatch, RemoteError> {
            self.inner.fetch_rows(job_id, limit, offset).await
        }

        async fn account_usage(&self) -> Result<AccountUsage, RemoteError> {
            self.inner.account_usage().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_answer_from_overlapping_poll_keeps_terminal_record() {
        let remote = Arc::new(GatedRemote::default());
        let tracker = Arc::new(JobTracker::new(remote.clone()));
        let job = submit(&tracker, 600).await;

        let slow = {
            let tracker = tracker.clone();
            let job_id = job.id.clone();
            tokio::spawn(async move { tracker.poll(&job_id).await })
        };
        remote.first_poll_started.notified().await;

        let completed = tracker.poll(&job.id).await.expect("poll");
        assert_eq!(completed.state, JobState::Completed);
        assert_eq!(completed.outcome.as_ref().and_then(|outcome| outcome.row_count), Some(3));

        remote.release_first_poll.notify_one();
        let late = slow.await.expect("poll task").expect("poll");

        assert_eq!(late, completed);
        assert_eq!(tracker.get(&job.id).expect("tracked"), completed);
        assert_eq!(tracker.poll(&job.id).await.expect("poll"), completed);
        assert_eq!(remote.polls.load(Ordering::SeqCst), 2);
    }
}

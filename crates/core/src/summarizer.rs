//! Bounded summaries of completed result sets.
//!
//! Rows are consumed page by page and never held in full. Only the preview
//! and one accumulator per numeric column survive the pass.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::info;

use crate::domain::job::{JobId, JobRecord, JobState};
use crate::domain::results::{Column, Row, RowBatch};
use crate::errors::{GatewayError, GatewayResult};
use crate::remote::RemoteQueryClient;

pub const DEFAULT_PREVIEW_ROWS: usize = 5;
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

/// `min` and `max` are exact while every value seen is an integer that fits
/// 64 bits; otherwise they, like `mean`, are `f64` approximations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub min: Number,
    pub max: Number,
    pub mean: f64,
    /// Non-null numeric values seen.
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub job_id: JobId,
    pub columns: Vec<Column>,
    pub preview: Vec<Row>,
    pub stats: Vec<ColumnStats>,
    pub total_rows: u64,
    pub truncated: bool,
}

/// Fails unless the record is `Completed`.
pub fn require_completed(record: &JobRecord) -> GatewayResult<()> {
    match record.state {
        JobState::Completed => Ok(()),
        JobState::Failed | JobState::TimedOut => Err(GatewayError::JobNotCompleted {
            job_id: record.id.clone(),
            state: record.state,
        }),
        state => Err(GatewayError::JobNotTerminal { job_id: record.id.clone(), state }),
    }
}

pub struct ResultSummarizer {
    remote: Arc<dyn RemoteQueryClient>,
    page_size: u64,
}

impl ResultSummarizer {
    pub fn new(remote: Arc<dyn RemoteQueryClient>, page_size: u64) -> Self {
        Self { remote, page_size: page_size.max(1) }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub async fn summarize(&self, record: &JobRecord, preview_rows: usize) -> GatewayResult<Summary> {
        require_completed(record)?;

        let mut columns: Vec<Column> =
            record.outcome.as_ref().map(|outcome| outcome.columns.clone()).unwrap_or_default();
        let mut accumulators: Vec<NumericAccumulator> = Vec::new();
        let mut preview = Vec::with_capacity(preview_rows);
        let mut total_rows = 0_u64;

        let mut pages = RowPages::new(self.remote.as_ref(), &record.id, self.page_size);
        while let Some(batch) = pages.next_page().await? {
            if columns.is_empty() {
                columns = batch_columns(&batch);
            }
            if accumulators.is_empty() {
                accumulators = columns.iter().map(NumericAccumulator::for_column).collect();
            }

            for row in batch.rows {
                for accumulator in &mut accumulators {
                    accumulator.observe(row.get(&accumulator.column));
                }
                total_rows += 1;
                if preview.len() < preview_rows {
                    preview.push(row);
                }
            }
        }

        let stats: Vec<ColumnStats> =
            accumulators.into_iter().filter_map(NumericAccumulator::finish).collect();

        info!(
            event_name = "summarizer.summary.built",
            job_id = %record.id,
            total_rows,
            numeric_columns = stats.len(),
            "result summary built"
        );

        Ok(Summary {
            job_id: record.id.clone(),
            columns,
            preview,
            stats,
            total_rows,
            truncated: total_rows > preview_rows as u64,
        })
    }
}

/// Sequential reader over `fetch_rows`, shared by summaries and exports.
pub(crate) struct RowPages<'a> {
    remote: &'a dyn RemoteQueryClient,
    job_id: &'a JobId,
    page_size: u64,
    offset: Option<u64>,
}

impl<'a> RowPages<'a> {
    pub(crate) fn new(remote: &'a dyn RemoteQueryClient, job_id: &'a JobId, page_size: u64) -> Self {
        Self { remote, job_id, page_size: page_size.max(1), offset: Some(0) }
    }

    pub(crate) async fn next_page(&mut self) -> GatewayResult<Option<RowBatch>> {
        let Some(offset) = self.offset else {
            return Ok(None);
        };

        let batch = self.remote.fetch_rows(self.job_id, self.page_size, offset).await?;
        self.offset = match batch.next_offset {
            Some(next) if next > offset && !batch.rows.is_empty() => Some(next),
            _ => None,
        };
        Ok(Some(batch))
    }
}

pub(crate) fn batch_columns(batch: &RowBatch) -> Vec<Column> {
    if !batch.columns.is_empty() {
        return batch.columns.clone();
    }
    batch
        .rows
        .first()
        .map(|row| row.keys().map(|name| Column::new(name.clone(), None)).collect())
        .unwrap_or_default()
}

struct NumericAccumulator {
    column: String,
    declared: Option<bool>,
    disqualified: bool,
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
    /// Exact bounds, kept until the first non-integer value.
    integer_bounds: Option<(i128, i128)>,
    integers_only: bool,
}

impl NumericAccumulator {
    fn for_column(column: &Column) -> Self {
        Self {
            column: column.name.clone(),
            declared: column.declared_numeric(),
            disqualified: false,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
            integer_bounds: None,
            integers_only: true,
        }
    }

    fn observe(&mut self, value: Option<&Value>) {
        if self.disqualified || self.declared == Some(false) {
            return;
        }

        let (number, integer) = match value {
            None | Some(Value::Null) => return,
            Some(Value::Number(number)) => (
                number.as_f64(),
                number.as_i64().map(i128::from).or_else(|| number.as_u64().map(i128::from)),
            ),
            Some(Value::String(text)) if self.declared == Some(true) => {
                let text = text.trim();
                (text.parse().ok(), text.parse::<i128>().ok())
            }
            Some(_) => (None, None),
        };

        match number {
            Some(number) if number.is_finite() => {
                self.min = self.min.min(number);
                self.max = self.max.max(number);
                self.sum += number;
                self.count += 1;
                self.observe_integer(integer);
            }
            // Declared numeric columns skip unparseable cells; inferred ones stop being numeric.
            _ if self.declared == Some(true) => {}
            _ => self.disqualified = true,
        }
    }

    fn observe_integer(&mut self, integer: Option<i128>) {
        if !self.integers_only {
            return;
        }
        match (integer, self.integer_bounds) {
            (Some(value), Some((min, max))) => {
                self.integer_bounds = Some((min.min(value), max.max(value)));
            }
            (Some(value), None) => self.integer_bounds = Some((value, value)),
            (None, _) => self.integers_only = false,
        }
    }

    fn finish(self) -> Option<ColumnStats> {
        if self.disqualified || self.count == 0 {
            return None;
        }
        let exact = self.integer_bounds.filter(|_| self.integers_only);
        Some(ColumnStats {
            column: self.column,
            min: bound(exact.map(|(min, _)| min), self.min)?,
            max: bound(exact.map(|(_, max)| max), self.max)?,
            mean: self.sum / self.count as f64,
            count: self.count,
        })
    }
}

fn bound(exact: Option<i128>, approximate: f64) -> Option<Number> {
    let exact = exact.and_then(|value| {
        i64::try_from(value)
            .map(Number::from)
            .ok()
            .or_else(|| u64::try_from(value).ok().map(Number::from))
    });
    exact.or_else(|| Number::from_f64(approximate))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::{json, Number};

    use super::{require_completed, ResultSummarizer};
    use crate::domain::job::{JobId, JobOutcome, JobRecord, JobState};
    use crate::domain::query::QueryId;
    use crate::domain::results::Column;
    use crate::errors::GatewayError;
    use crate::fixtures::{row, InMemoryRemote};
    use crate::remote::RemoteQueryClient;

    fn record(id: JobId, state: JobState) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id,
            query_id: QueryId(1),
            state,
            submitted_at: now,
            last_polled_at: Some(now),
            deadline: now,
            outcome: Some(JobOutcome::default()),
        }
    }

    async fn completed_job(remote: &InMemoryRemote) -> JobRecord {
        let id = remote.submit(QueryId(1), &Default::default()).await.expect("submit");
        record(id, JobState::Completed)
    }

    #[test]
    fn only_completed_records_pass_the_precondition() {
        let id = JobId("job-1".to_string());
        assert!(require_completed(&record(id.clone(), JobState::Completed)).is_ok());
        assert!(matches!(
            require_completed(&record(id.clone(), JobState::Executing)),
            Err(GatewayError::JobNotTerminal { state: JobState::Executing, .. })
        ));
        assert!(matches!(
            require_completed(&record(id.clone(), JobState::TimedOut)),
            Err(GatewayError::JobNotCompleted { state: JobState::TimedOut, .. })
        ));
        assert!(matches!(
            require_completed(&record(id, JobState::Failed)),
            Err(GatewayError::JobNotCompleted { state: JobState::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn hundred_rows_yield_bounded_preview_and_stats() {
        let rows = (1..=100)
            .map(|n| row([("block", json!(n)), ("pool", json!(format!("pool-{n}")))]))
            .collect();
        let remote = Arc::new(InMemoryRemote::new().with_dataset(
            vec![Column::new("block", Some("bigint")), Column::new("pool", Some("varchar"))],
            rows,
        ));
        let job = completed_job(&remote).await;

        let summary = ResultSummarizer::new(remote.clone(), 30).summarize(&job, 5).await.expect("summary");

        assert_eq!(summary.preview.len(), 5);
        assert_eq!(summary.preview[0].get("block"), Some(&json!(1)));
        assert_eq!(summary.total_rows, 100);
        assert!(summary.truncated);
        assert_eq!(summary.stats.len(), 1);
        let block = &summary.stats[0];
        assert_eq!(block.column, "block");
        assert_eq!(block.min, Number::from(1));
        assert_eq!(block.max, Number::from(100));
        assert_eq!(block.mean, 50.5);
        assert_eq!(block.count, 100);
        assert_eq!(remote.fetch_calls(), 4);
        assert!(remote.largest_page() <= 30);
    }

    #[tokio::test]
    async fn undeclared_columns_are_numeric_only_when_every_value_is_a_number() {
        let rows = vec![
            row([("amount", json!(2.5)), ("mixed", json!(1)), ("label", json!("a"))]),
            row([("amount", json!(null)), ("mixed", json!("two")), ("label", json!("b"))]),
            row([("amount", json!(7.5)), ("mixed", json!(3)), ("label", json!("c"))]),
        ];
        let remote = Arc::new(InMemoryRemote::new().with_dataset(
            vec![Column::new("amount", None), Column::new("mixed", None), Column::new("label", None)],
            rows,
        ));
        let job = completed_job(&remote).await;

        let summary = ResultSummarizer::new(remote, 1000).summarize(&job, 5).await.expect("summary");

        assert!(!summary.truncated);
        assert_eq!(summary.stats.len(), 1);
        assert_eq!(summary.stats[0].column, "amount");
        assert_eq!(summary.stats[0].count, 2);
        assert_eq!(summary.stats[0].mean, 5.0);
    }

    #[tokio::test]
    async fn declared_numeric_strings_are_parsed() {
        let rows = vec![
            row([("volume", json!("10.5"))]),
            row([("volume", json!("4.5"))]),
            row([("volume", json!(null))]),
        ];
        let remote = Arc::new(InMemoryRemote::new().with_dataset(
            vec![Column::new("volume", Some("decimal(38,2)"))],
            rows,
        ));
        let job = completed_job(&remote).await;

        let summary = ResultSummarizer::new(remote, 1000).summarize(&job, 5).await.expect("summary");

        let volume = &summary.stats[0];
        assert_eq!(volume.min.as_f64(), Some(4.5));
        assert_eq!(volume.max.as_f64(), Some(10.5));
        assert_eq!((volume.mean, volume.count), (7.5, 2));
    }

    #[tokio::test]
    async fn large_integer_bounds_stay_exact() {
        let big = 9_007_199_254_740_993_u64;
        let rows = vec![
            row([("wei", json!(big)), ("mixed", json!(big))]),
            row([("wei", json!(u64::MAX)), ("mixed", json!(0.5))]),
            row([("wei", json!("18446744073709551616")), ("mixed", json!(null))]),
        ];
        let remote = Arc::new(InMemoryRemote::new().with_dataset(
            vec![Column::new("wei", Some("uint256")), Column::new("mixed", Some("double"))],
            rows,
        ));
        let job = completed_job(&remote).await;

        let summary = ResultSummarizer::new(remote, 1000).summarize(&job, 5).await.expect("summary");

        let wei = &summary.stats[0];
        assert_eq!(wei.min, Number::from(big));
        assert_eq!(wei.min.to_string(), "9007199254740993");
        // Past u64 the exact bound has no JSON integer form.
        assert_eq!(wei.max.as_f64(), Some(2_f64.powi(64)));
        assert_eq!(wei.count, 3);

        let mixed = &summary.stats[1];
        assert_eq!(mixed.min.as_f64(), Some(0.5));
        assert_eq!(mixed.max.as_f64(), Some(big as f64));
    }

    #[tokio::test]
    async fn empty_result_set_is_not_truncated() {
        let remote = Arc::new(
            InMemoryRemote::new().with_dataset(vec![Column::new("block", Some("bigint"))], Vec::new()),
        );
        let job = completed_job(&remote).await;

        let summary = ResultSummarizer::new(remote, 1000).summarize(&job, 5).await.expect("summary");

        assert_eq!(summary.total_rows, 0);
        assert!(summary.preview.is_empty());
        assert!(summary.stats.is_empty());
        assert!(!summary.truncated);
    }
}

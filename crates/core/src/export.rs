//! CSV export of completed result sets.
//!
//! Rows go to disk one page at a time. The file is written under a partial
//! name and renamed once the last page lands, so a failed export never leaves
//! a truncated CSV behind under the final name.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::domain::job::{JobId, JobRecord};
use crate::domain::results::{Column, Row};
use crate::errors::{GatewayError, GatewayResult};
use crate::remote::RemoteQueryClient;
use crate::summarizer::{batch_columns, require_completed, RowPages};

pub const DEFAULT_EXPORT_DIR: &str = "./dune_exports";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub job_id: JobId,
    pub path: PathBuf,
    pub rows_written: u64,
    pub columns: usize,
}

pub struct CsvExporter {
    remote: Arc<dyn RemoteQueryClient>,
    directory: PathBuf,
    page_size: u64,
}

impl CsvExporter {
    pub fn new(remote: Arc<dyn RemoteQueryClient>, directory: impl Into<PathBuf>, page_size: u64) -> Self {
        Self { remote, directory: directory.into(), page_size: page_size.max(1) }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Resolves `destination` inside the export directory.
    ///
    /// Only relative paths made of plain components are accepted.
    pub fn resolve_destination(
        &self,
        job_id: &JobId,
        destination: Option<&str>,
    ) -> GatewayResult<PathBuf> {
        let Some(destination) = destination.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(self.directory.join(default_file_name(job_id)));
        };

        let relative = Path::new(destination);
        let mut cleaned = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => cleaned.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(GatewayError::InvalidParameters(format!(
                        "export destination `{destination}` must not contain `..`"
                    )))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(GatewayError::InvalidParameters(format!(
                        "export destination `{destination}` must be relative to the export directory"
                    )))
                }
            }
        }

        if cleaned.as_os_str().is_empty() {
            return Err(GatewayError::InvalidParameters(format!(
                "export destination `{destination}` does not name a file"
            )));
        }
        Ok(self.directory.join(cleaned))
    }

    pub async fn export(
        &self,
        record: &JobRecord,
        destination: Option<&str>,
    ) -> GatewayResult<ExportReceipt> {
        require_completed(record)?;
        let path = self.resolve_destination(&record.id, destination)?;
        let partial = partial_path(&path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                export_error(format!("cannot create {}: {error}", parent.display()))
            })?;
        }

        let written = self.write_pages(record, &partial).await;
        let (rows_written, columns) = match written {
            Ok(counts) => counts,
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    warn!(
                        event_name = "export.cleanup.failed",
                        path = %partial.display(),
                        error = %cleanup,
                        "could not remove partial export"
                    );
                }
                return Err(error);
            }
        };

        tokio::fs::rename(&partial, &path).await.map_err(|error| {
            export_error(format!("cannot move export into {}: {error}", path.display()))
        })?;

        info!(
            event_name = "export.csv.written",
            job_id = %record.id,
            path = %path.display(),
            rows_written,
            "results exported"
        );

        Ok(ExportReceipt { job_id: record.id.clone(), path, rows_written, columns })
    }

    async fn write_pages(&self, record: &JobRecord, partial: &Path) -> GatewayResult<(u64, usize)> {
        let mut file = tokio::fs::File::create(partial).await.map_err(|error| {
            export_error(format!("cannot create {}: {error}", partial.display()))
        })?;

        let mut columns: Vec<Column> =
            record.outcome.as_ref().map(|outcome| outcome.columns.clone()).unwrap_or_default();
        let mut header_written = false;
        let mut rows_written = 0_u64;

        let mut pages = RowPages::new(self.remote.as_ref(), &record.id, self.page_size);
        while let Some(batch) = pages.next_page().await? {
            if columns.is_empty() {
                columns = batch_columns(&batch);
            }

            let mut chunk = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
            if !header_written && !columns.is_empty() {
                chunk
                    .write_record(columns.iter().map(|column| column.name.as_str()))
                    .map_err(|error| export_error(error.to_string()))?;
                header_written = true;
            }
            for row in &batch.rows {
                chunk
                    .write_record(csv_record(&columns, row))
                    .map_err(|error| export_error(error.to_string()))?;
                rows_written += 1;
            }

            let bytes = chunk.into_inner().map_err(|error| export_error(error.to_string()))?;
            file.write_all(&bytes).await.map_err(|error| {
                export_error(format!("cannot write {}: {error}", partial.display()))
            })?;
        }

        file.flush()
            .await
            .map_err(|error| export_error(format!("cannot flush {}: {error}", partial.display())))?;
        Ok((rows_written, columns.len()))
    }
}

pub fn default_file_name(job_id: &JobId) -> String {
    let safe: String = job_id
        .0
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    format!("dune_results_{safe}.csv")
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn csv_record(columns: &[Column], row: &Row) -> Vec<String> {
    columns.iter().map(|column| csv_cell(row.get(&column.name))).collect()
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(Value::Number(number)) => number.to_string(),
        Some(other) => other.to_string(),
    }
}

fn export_error(message: String) -> GatewayError {
    GatewayError::Export(message)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use super::{default_file_name, CsvExporter};
    use crate::domain::job::{JobId, JobOutcome, JobRecord, JobState};
    use crate::domain::query::QueryId;
    use crate::domain::results::Column;
    use crate::errors::GatewayError;
    use crate::fixtures::{row, InMemoryRemote};
    use crate::remote::{RemoteError, RemoteQueryClient};

    fn completed(id: JobId) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id,
            query_id: QueryId(3),
            state: JobState::Completed,
            submitted_at: now,
            last_polled_at: Some(now),
            deadline: now,
            outcome: Some(JobOutcome::default()),
        }
    }

    fn remote_with_rows(count: usize) -> Arc<InMemoryRemote> {
        let rows = (0..count)
            .map(|n| row([("pool", json!(format!("pool, {n}"))), ("tvl", json!(n as f64 * 1.5))]))
            .collect();
        Arc::new(InMemoryRemote::new().with_dataset(
            vec![Column::new("pool", Some("varchar")), Column::new("tvl", Some("double"))],
            rows,
        ))
    }

    #[test]
    fn default_name_embeds_sanitized_job_id() {
        assert_eq!(default_file_name(&JobId("01HX-abc".to_string())), "dune_results_01HX-abc.csv");
        assert_eq!(default_file_name(&JobId("a/b".to_string())), "dune_results_a_b.csv");
    }

    #[test]
    fn destinations_must_stay_inside_export_directory() {
        let exporter = CsvExporter::new(Arc::new(InMemoryRemote::new()), "/var/exports", 100);
        let job = JobId("job-1".to_string());

        assert_eq!(
            exporter.resolve_destination(&job, Some("./daily/pools.csv")).expect("relative"),
            std::path::PathBuf::from("/var/exports/daily/pools.csv")
        );
        assert!(matches!(
            exporter.resolve_destination(&job, Some("../escape.csv")),
            Err(GatewayError::InvalidParameters(_))
        ));
        assert!(matches!(
            exporter.resolve_destination(&job, Some("/etc/passwd")),
            Err(GatewayError::InvalidParameters(_))
        ));
        assert_eq!(
            exporter.resolve_destination(&job, None).expect("default"),
            std::path::PathBuf::from("/var/exports/dune_results_job-1.csv")
        );
    }

    #[tokio::test]
    async fn export_streams_every_row_with_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = remote_with_rows(25);
        let job_id = remote.submit(QueryId(3), &Default::default()).await.expect("submit");
        let exporter = CsvExporter::new(remote.clone(), dir.path(), 10);

        let receipt = exporter.export(&completed(job_id), None).await.expect("export");

        assert_eq!(receipt.rows_written, 25);
        assert_eq!(receipt.columns, 2);
        assert_eq!(remote.fetch_calls(), 3);
        assert!(remote.largest_page() <= 10);

        let contents = std::fs::read_to_string(&receipt.path).expect("read export");
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("pool,tvl"));
        assert_eq!(lines.next(), Some("\"pool, 0\",0.0"));
        assert_eq!(contents.lines().count(), 26);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_file_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = remote_with_rows(5);
        let job_id = remote.submit(QueryId(3), &Default::default()).await.expect("submit");
        remote.set_fetch_error(Some(RemoteError::Transport("reset".to_string())));
        let exporter = CsvExporter::new(remote, dir.path(), 10);

        let error = exporter.export(&completed(job_id), Some("out.csv")).await.expect_err("fails");

        assert!(matches!(error, GatewayError::RemoteUnavailable(_)));
        let leftovers = std::fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn export_requires_completed_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exporter = CsvExporter::new(Arc::new(InMemoryRemote::new()), dir.path(), 10);
        let mut record = completed(JobId("job-9".to_string()));
        record.state = JobState::Pending;

        let error = exporter.export(&record, None).await.expect_err("not terminal");
        assert!(matches!(error, GatewayError::JobNotTerminal { .. }));
    }
}

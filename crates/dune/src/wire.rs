//! Response shapes of the Dune REST and GraphQL endpoints, and their mapping
//! onto the gateway's domain types.

use dunegate_core::{
    AccountUsage, BillingPeriod, Column, JobId, QueryId, QueryMetadata, QueryParameter,
    QuerySummary, RemoteState, RemoteStatus, Row, RowBatch,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub(crate) struct QueryResponse {
    pub query_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub query_sql: String,
    #[serde(default)]
    pub parameters: Vec<ParameterResponse>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ParameterResponse {
    pub key: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: Option<Value>,
}

impl From<QueryResponse> for QueryMetadata {
    fn from(response: QueryResponse) -> Self {
        Self {
            id: QueryId(response.query_id),
            name: response.name,
            description: response.description.unwrap_or_default(),
            owner: response.owner,
            sql: response.query_sql,
            parameters: response
                .parameters
                .into_iter()
                .map(|parameter| QueryParameter {
                    key: parameter.key,
                    kind: parameter.kind,
                    value: parameter.value.and_then(|value| match value {
                        Value::Null => None,
                        Value::String(text) => Some(text),
                        other => Some(other.to_string()),
                    }),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ExecuteRequest<'a> {
    pub query_parameters: &'a dunegate_core::QueryParams,
    pub performance: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecuteResponse {
    pub execution_id: String,
}

impl From<ExecuteResponse> for JobId {
    fn from(response: ExecuteResponse) -> Self {
        JobId(response.execution_id)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResultMetadata {
    #[serde(default)]
    pub column_names: Vec<String>,
    #[serde(default)]
    pub column_types: Vec<String>,
    #[serde(default)]
    pub total_row_count: Option<u64>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

impl ResultMetadata {
    pub fn columns(&self) -> Vec<Column> {
        self.column_names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                Column::new(name.clone(), self.column_types.get(index).map(String::as_str))
            })
            .collect()
    }

    pub fn total_rows(&self) -> Option<u64> {
        self.total_row_count.or(self.row_count)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecutionError {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ExecutionError {
    fn describe(&self) -> Option<String> {
        match (self.kind.as_deref(), self.message.as_deref()) {
            (_, Some(message)) if !message.is_empty() => Some(message.to_string()),
            (Some(kind), _) => Some(kind.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusResponse {
    pub state: String,
    #[serde(default)]
    pub result_metadata: Option<ResultMetadata>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
}

impl StatusResponse {
    pub fn into_status(self) -> Result<RemoteStatus, String> {
        let state = parse_state(&self.state)?;
        let metadata = self.result_metadata.unwrap_or_default();
        Ok(RemoteStatus {
            state,
            row_count: metadata.total_rows(),
            columns: metadata.columns(),
            error: self.error.as_ref().and_then(ExecutionError::describe),
        })
    }
}

/// Maps `QUERY_STATE_*` names; partial completions count as completed.
pub(crate) fn parse_state(raw: &str) -> Result<RemoteState, String> {
    let normalized = raw.trim().to_ascii_uppercase();
    let name = normalized.strip_prefix("QUERY_STATE_").unwrap_or(&normalized);
    match name {
        "PENDING" => Ok(RemoteState::Pending),
        "EXECUTING" => Ok(RemoteState::Executing),
        "COMPLETED" | "COMPLETED_PARTIAL" => Ok(RemoteState::Completed),
        "FAILED" => Ok(RemoteState::Failed),
        "CANCELLED" | "CANCELED" => Ok(RemoteState::Cancelled),
        "EXPIRED" => Ok(RemoteState::Expired),
        _ => Err(format!("unknown execution state `{raw}`")),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultsResponse {
    #[serde(default)]
    pub result: Option<ResultSet>,
    #[serde(default)]
    pub next_offset: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResultSet {
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub metadata: ResultMetadata,
}

impl From<ResultsResponse> for RowBatch {
    fn from(response: ResultsResponse) -> Self {
        let result = response.result.unwrap_or_default();
        Self {
            columns: result.metadata.columns(),
            total_row_count: result.metadata.total_rows(),
            rows: result.rows,
            next_offset: response.next_offset,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageResponse {
    #[serde(default)]
    pub billing_periods: Vec<BillingPeriodResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BillingPeriodResponse {
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub credits_used: f64,
    #[serde(default)]
    pub credits_included: f64,
}

impl From<UsageResponse> for AccountUsage {
    fn from(response: UsageResponse) -> Self {
        Self {
            billing_periods: response
                .billing_periods
                .into_iter()
                .map(|period| BillingPeriod {
                    start_date: period.start_date,
                    end_date: period.end_date,
                    credits_used: period.credits_used,
                    credits_included: period.credits_included,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphqlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphqlError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Connection<T> {
    #[serde(default = "Vec::new")]
    pub edges: Vec<Edge<T>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Edge<T> {
    pub node: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueriesData {
    pub queries: Connection<QueryNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UsersData {
    pub users: Connection<UserNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryNode {
    pub id: Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub user: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserNode {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub handle: Option<String>,
}

/// GraphQL ids come back as numbers or numeric strings.
pub(crate) fn numeric_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

impl QueriesData {
    pub fn into_summaries(self) -> Vec<QuerySummary> {
        self.queries
            .edges
            .into_iter()
            .filter_map(|edge| edge.node)
            .filter_map(|node| {
                Some(QuerySummary {
                    id: QueryId(numeric_id(&node.id)?),
                    name: node.name.unwrap_or_default(),
                    owner: node
                        .user
                        .and_then(|user| user.handle)
                        .unwrap_or_else(|| "unknown".to_string()),
                    description: node.description.unwrap_or_default(),
                })
            })
            .collect()
    }
}

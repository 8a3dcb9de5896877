//! MCP Server Implementation
//!
//! Maps each MCP tool onto one [`Gateway`] operation. Results are rendered as
//! pretty JSON text; failures the agent can act on (budget denials, unfinished
//! jobs, bad arguments) come back as tool errors rather than protocol errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dunegate_core::gateway::DEFAULT_SESSION_ID;
use dunegate_core::{ExecuteRequest, Gateway, JobId, QueryId, SessionId};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, ErrorCode, Implementation, ProtocolVersion, ServerCapabilities,
    ServerInfo,
};
use rmcp::{schemars, tool, tool_handler, tool_router, ErrorData, ServerHandler, ServiceExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{tool_guide, McpError, McpResult};

/// Main MCP server for Dunegate
#[derive(Clone)]
pub struct DunegateMcpServer {
    gateway: Arc<Gateway>,
    tool_router: ToolRouter<Self>,
}

// ============================================================================
// Tool inputs
// ============================================================================

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SearchInput {
    #[schemars(description = "Words to look for in public query names")]
    pub term: String,
}

#[derive(Debug, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct UserQueriesInput {
    #[schemars(description = "Dune user handle; defaults to the configured handle")]
    #[serde(default)]
    pub user_handle: Option<String>,

    #[schemars(description = "Maximum queries to return (1-100, default 10)")]
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct QueryDetailsInput {
    #[schemars(description = "Numeric Dune query id")]
    pub query_id: u64,

    #[schemars(description = "Bypass the metadata cache and fetch again")]
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ExecuteQueryInput {
    #[schemars(description = "Numeric Dune query id")]
    pub query_id: u64,

    #[schemars(description = "Conversation id the budget is charged to (default \"default\")")]
    #[serde(default)]
    pub session_id: Option<String>,

    #[schemars(description = "Query parameter values keyed by parameter name")]
    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    #[schemars(description = "Seconds to wait for a terminal state before giving up")]
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct JobInput {
    #[schemars(description = "Job handle returned by execute_query")]
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SummaryInput {
    #[schemars(description = "Job handle returned by execute_query")]
    pub job_id: String,

    #[schemars(description = "Rows to include in the preview (default 5)")]
    #[serde(default)]
    pub preview_rows: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ExportInput {
    #[schemars(description = "Job handle returned by execute_query")]
    pub job_id: String,

    #[schemars(description = "File name relative to the export directory")]
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SessionInput {
    #[schemars(description = "Conversation id (default \"default\")")]
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// Tools
// ============================================================================

#[tool_router]
impl DunegateMcpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway, tool_router: Self::tool_router() }
    }

    /// Names of every registered tool.
    pub fn tool_names(&self) -> Vec<String> {
        self.tool_router.list_all().into_iter().map(|tool| tool.name.to_string()).collect()
    }

    /// Run the server with stdio transport
    pub async fn run_stdio(self) -> anyhow::Result<()> {
        info!(
            event_name = "mcp.server.starting",
            tools = self.tool_router.list_all().len(),
            "starting MCP server with stdio transport"
        );

        let service = self.serve(rmcp::transport::stdio()).await?;
        let reason = service.waiting().await?;

        info!(event_name = "mcp.server.stopped", reason = ?reason, "MCP server shutdown complete");
        Ok(())
    }

    #[tool(description = "Search public Dune queries by name. Returns id, name, owner and description; never SQL.")]
    pub async fn search_public_queries(
        &self,
        Parameters(input): Parameters<SearchInput>,
    ) -> Result<CallToolResult, ErrorData> {
        debug!(term = %input.term, "search_public_queries called");
        respond(self.gateway.search_public_queries(&input.term).await.map_err(McpError::from))
    }

    #[tool(description = "List queries owned by a Dune user, or by the configured user when no handle is given.")]
    pub async fn list_user_queries(
        &self,
        Parameters(input): Parameters<UserQueriesInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let result = self
            .gateway
            .list_user_queries(input.user_handle.as_deref(), input.limit)
            .await
            .map_err(McpError::from);
        respond(result)
    }

    #[tool(description = "Get a query's name, SQL and declared parameters. Cached; set refresh to refetch.")]
    pub async fn get_query_details(
        &self,
        Parameters(input): Parameters<QueryDetailsInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let result = self
            .gateway
            .get_query_details(QueryId(input.query_id), input.refresh)
            .await
            .map_err(McpError::from);
        respond(result)
    }

    #[tool(description = "Execute a Dune query. Charged to the session budget; returns a job handle to poll with get_job_status.")]
    pub async fn execute_query(
        &self,
        Parameters(input): Parameters<ExecuteQueryInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let session_id = session_or_default(input.session_id);
        debug!(session_id = %session_id, query_id = input.query_id, "execute_query called");

        let request = ExecuteRequest {
            session_id,
            query_id: QueryId(input.query_id),
            params: input.params,
            timeout: input.timeout_secs.map(Duration::from_secs),
        };
        let result = self.gateway.execute_query(request).await.map(|execution| {
            json!({
                "job_id": execution.job.id,
                "query_id": execution.job.query_id,
                "state": execution.job.state,
                "submitted_at": execution.job.submitted_at,
                "deadline": execution.job.deadline,
                "budget": execution.budget,
                "next_step": "poll get_job_status until the job is completed",
            })
        });
        respond(result.map_err(McpError::from))
    }

    #[tool(description = "Poll a job and return its current state, row count and columns once completed.")]
    pub async fn get_job_status(
        &self,
        Parameters(input): Parameters<JobInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let result = match job_id(&input.job_id) {
            Ok(job_id) => self.gateway.get_job_status(&job_id).await.map_err(McpError::from),
            Err(error) => Err(error),
        };
        respond(result)
    }

    #[tool(description = "Summarize a completed job: columns, a short preview, and min/max/mean of numeric columns.")]
    pub async fn get_job_results_summary(
        &self,
        Parameters(input): Parameters<SummaryInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let result = match job_id(&input.job_id) {
            Ok(job_id) => self
                .gateway
                .get_job_results_summary(&job_id, input.preview_rows)
                .await
                .map_err(McpError::from),
            Err(error) => Err(error),
        };
        respond(result)
    }

    #[tool(description = "Write a completed job's full result set to a CSV file. Returns the path and row count.")]
    pub async fn export_results_to_csv(
        &self,
        Parameters(input): Parameters<ExportInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let result = match job_id(&input.job_id) {
            Ok(job_id) => self
                .gateway
                .export_results_to_csv(&job_id, input.destination.as_deref())
                .await
                .map_err(McpError::from),
            Err(error) => Err(error),
        };
        respond(result)
    }

    #[tool(description = "Show the Dune account's credit usage for its billing periods.")]
    pub async fn get_account_status(&self) -> Result<CallToolResult, ErrorData> {
        let result = self.gateway.get_account_status().await.map(|usage| {
            let current = usage.current_period().map(|period| {
                json!({
                    "start_date": period.start_date,
                    "end_date": period.end_date,
                    "credits_used": period.credits_used,
                    "credits_included": period.credits_included,
                    "credits_remaining": period.credits_remaining(),
                })
            });
            json!({ "current_period": current, "billing_periods": usage.billing_periods })
        });
        respond(result.map_err(McpError::from))
    }

    #[tool(description = "Show how much of the session's query and cost budget is used and remaining.")]
    pub async fn get_session_budget(
        &self,
        Parameters(input): Parameters<SessionInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let session_id = session_or_default(input.session_id);
        respond(Ok(self.gateway.get_session_budget(&session_id)))
    }

    #[tool(description = "Reset a session's budget counters to zero.")]
    pub async fn reset_session_budget(
        &self,
        Parameters(input): Parameters<SessionInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let session_id = session_or_default(input.session_id);
        let (budget, existed) = self.gateway.reset_session_budget(&session_id).await;
        let message = if existed {
            format!("budget for session `{session_id}` reset")
        } else {
            format!("session `{session_id}` had no usage; nothing to reset")
        };
        respond(Ok(json!({ "reset": existed, "message": message, "budget": budget })))
    }
}

#[tool_handler]
impl ServerHandler for DunegateMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "dunegate-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Implementation::from_build_env()
            },
            instructions: Some(format!(
                "Dunegate - budget-enforced access to Dune Analytics. \
                 Find a query, read its details, execute it within the session budget, \
                 poll the job, then summarize or export the results.\n\nTools by category:\n{}",
                tool_guide()
            )),
            ..Default::default()
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn session_or_default(session_id: Option<String>) -> SessionId {
    session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(SessionId)
        .unwrap_or_else(|| SessionId::new(DEFAULT_SESSION_ID))
}

fn job_id(raw: &str) -> McpResult<JobId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(McpError::InvalidArgument("job_id must not be empty".to_string()));
    }
    Ok(JobId(trimmed.to_string()))
}

fn respond<T: Serialize>(result: McpResult<T>) -> Result<CallToolResult, ErrorData> {
    let rendered = result.and_then(|payload| Ok(serde_json::to_string_pretty(&payload)?));
    match rendered {
        Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
        Err(error) if error.is_tool_error() => {
            let payload = json!({
                "status": "error",
                "error_class": error.error_class(),
                "code": error.error_code(),
                "message": error.agent_message(),
            });
            let text = serde_json::to_string_pretty(&payload)
                .unwrap_or_else(|_| error.agent_message());
            Ok(CallToolResult::error(vec![Content::text(text)]))
        }
        Err(error) => Err(ErrorData::new(ErrorCode(error.error_code()), error.to_string(), None)),
    }
}

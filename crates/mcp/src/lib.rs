//! Dunegate MCP (Model Context Protocol) Server
//!
//! Exposes the budget-enforcing Dune gateway to AI agents as MCP tools over
//! stdio.
//!
//! ## Architecture
//!
//! - `DunegateMcpServer`: tool router and `ServerHandler` over a shared [`Gateway`]
//! - `tools`: tool names grouped by category
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dunegate_core::config::{AppConfig, LoadOptions};
//! use dunegate_core::{Gateway, GatewaySettings};
//! use dunegate_dune::DuneClient;
//! use dunegate_mcp::DunegateMcpServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(LoadOptions::default())?;
//!     let client = DuneClient::from_app_config(&config)?;
//!     let gateway = Gateway::new(Arc::new(client), GatewaySettings::from_config(&config));
//!     DunegateMcpServer::new(Arc::new(gateway)).run_stdio().await
//! }
//! ```
//!
//! [`Gateway`]: dunegate_core::Gateway

mod server;
mod tools;

pub use server::*;
pub use tools::*;

use dunegate_core::GatewayError;
use thiserror::Error;

/// Errors raised while answering a tool call.
#[derive(Error, Debug)]
pub enum McpError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl McpError {
    /// Convert to JSON-RPC error code
    pub fn error_code(&self) -> i32 {
        match self {
            McpError::InvalidArgument(_) => -32602,
            McpError::Gateway(error) => match error {
                GatewayError::InvalidParameters(_) | GatewayError::JobNotFound(_) => -32602,
                GatewayError::BudgetExceeded { .. } => -32001,
                GatewayError::RemoteUnavailable(_) | GatewayError::SubmissionFailed { .. } => {
                    -32002
                }
                GatewayError::JobNotTerminal { .. } | GatewayError::JobNotCompleted { .. } => {
                    -32600
                }
                GatewayError::Export(_) => -32603,
            },
            McpError::Serialization(_) => -32603,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            McpError::Gateway(error) => error.error_class(),
            McpError::InvalidArgument(_) => "invalid_parameters",
            McpError::Serialization(_) => "internal",
        }
    }

    /// Failures the agent can act on are reported inside the tool result;
    /// everything else becomes a protocol error.
    pub fn is_tool_error(&self) -> bool {
        !matches!(self, McpError::Serialization(_))
    }

    /// Message shown to the agent. Budget denials are prefixed so they cannot
    /// be mistaken for a remote hiccup worth retrying.
    pub fn agent_message(&self) -> String {
        match self {
            McpError::Gateway(GatewayError::BudgetExceeded { .. }) => {
                format!("EXECUTION DENIED: {self}")
            }
            _ => self.to_string(),
        }
    }
}

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

#[cfg(test)]
mod tests {
    use dunegate_core::{BudgetLimit, GatewayError, JobId, JobState, RemoteError};

    use super::McpError;

    #[test]
    fn budget_denials_are_prefixed_for_the_agent() {
        let error = McpError::from(GatewayError::BudgetExceeded {
            limit: BudgetLimit::MaxQueries,
            reason: "5 of 5 queries used".to_string(),
        });

        assert!(error.agent_message().starts_with("EXECUTION DENIED:"));
        assert_eq!(error.error_class(), "budget_exceeded");
        assert_eq!(error.error_code(), -32001);
        assert!(error.is_tool_error());
    }

    #[test]
    fn gateway_errors_map_to_json_rpc_codes() {
        let not_found = McpError::from(GatewayError::JobNotFound(JobId("missing".to_string())));
        let pending = McpError::from(GatewayError::JobNotTerminal {
            job_id: JobId("01HX".to_string()),
            state: JobState::Executing,
        });
        let remote = McpError::from(GatewayError::from(RemoteError::Transport("reset".to_string())));

        assert_eq!(not_found.error_code(), -32602);
        assert_eq!(pending.error_code(), -32600);
        assert_eq!(remote.error_code(), -32002);
        assert_eq!(remote.agent_message(), remote.to_string());
    }

    #[test]
    fn serialization_failures_are_protocol_errors() {
        let error = McpError::from(serde_json::from_str::<u32>("nope").expect_err("invalid json"));

        assert!(!error.is_tool_error());
        assert_eq!(error.error_code(), -32603);
        assert_eq!(error.error_class(), "internal");
    }
}

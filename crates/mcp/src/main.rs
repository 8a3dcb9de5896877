//! Dunegate MCP Server Binary
//!
//! ## Usage
//!
//! ```bash
//! # API key from the environment, everything else from defaults or dunegate.toml
//! DUNE_API_KEY=... dunegate-mcp
//!
//! # Tighter session budget and JSON logs
//! DUNEGATE_BUDGET_MAX_QUERIES=3 DUNEGATE_LOGGING_FORMAT=json dunegate-mcp
//! ```
//!
//! Logs go to stderr; stdout carries the MCP stdio transport.

use std::sync::Arc;

use anyhow::{Context, Result};
use dunegate_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};
use dunegate_core::{Gateway, GatewaySettings};
use dunegate_dune::DuneClient;
use dunegate_mcp::DunegateMcpServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())
        .context("failed to load dunegate configuration")?;
    init_logging(&config.logging);

    let client = DuneClient::from_app_config(&config).context("failed to build Dune client")?;
    let settings = GatewaySettings::from_config(&config);

    info!(
        event_name = "mcp.server.configured",
        base_url = %config.dune.base_url,
        max_queries = settings.policy.max_queries,
        max_session_cost = %settings.policy.max_session_cost,
        export_dir = %settings.export_dir.display(),
        "gateway configured"
    );

    let gateway = Gateway::new(Arc::new(client), settings);
    DunegateMcpServer::new(Arc::new(gateway)).run_stdio().await
}

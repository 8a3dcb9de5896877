use std::env;
use std::fs;
use std::path::Path;

use dunegate_core::config::{resolve_config_path, AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    CommandResult { exit_code: 0, output: render(&config) }
}

fn render(config: &AppConfig) -> String {
    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "dune.api_key",
        &redact_token(config.dune.api_key.expose_secret()),
        source("dune.api_key", &["DUNEGATE_DUNE_API_KEY", "DUNE_API_KEY", "DUNE_API_KEYS"]),
    ));
    lines.push(render_line(
        "dune.base_url",
        &config.dune.base_url,
        source("dune.base_url", &["DUNEGATE_DUNE_BASE_URL", "DUNE_API_BASE_URL"]),
    ));
    lines.push(render_line(
        "dune.graphql_url",
        &config.dune.graphql_url,
        source("dune.graphql_url", &["DUNEGATE_DUNE_GRAPHQL_URL"]),
    ));
    lines.push(render_line(
        "dune.timeout_secs",
        &config.dune.timeout_secs.to_string(),
        source("dune.timeout_secs", &["DUNEGATE_DUNE_TIMEOUT_SECS"]),
    ));
    lines.push(render_line(
        "dune.max_retries",
        &config.dune.max_retries.to_string(),
        source("dune.max_retries", &["DUNEGATE_DUNE_MAX_RETRIES"]),
    ));
    lines.push(render_line(
        "dune.user_handle",
        config.dune.user_handle.as_deref().unwrap_or("<unset>"),
        source("dune.user_handle", &["DUNEGATE_DUNE_USER_HANDLE", "DUNE_USER_HANDLE"]),
    ));
    lines.push(render_line(
        "dune.performance",
        config.dune.performance.as_str(),
        source("dune.performance", &["DUNEGATE_DUNE_PERFORMANCE"]),
    ));

    lines.push(render_line(
        "budget.max_queries",
        &config.budget.max_queries.to_string(),
        source("budget.max_queries", &["DUNEGATE_BUDGET_MAX_QUERIES", "MAX_QUERIES_PER_SESSION"]),
    ));
    lines.push(render_line(
        "budget.max_session_cost",
        &config.budget.max_session_cost.to_string(),
        source(
            "budget.max_session_cost",
            &["DUNEGATE_BUDGET_MAX_SESSION_COST", "MAX_CREDITS_PER_SESSION"],
        ),
    ));
    lines.push(render_line(
        "budget.max_query_cost",
        &config.budget.max_query_cost.to_string(),
        source("budget.max_query_cost", &["DUNEGATE_BUDGET_MAX_QUERY_COST"]),
    ));
    lines.push(render_line(
        "budget.default_query_cost",
        &config.budget.default_query_cost.to_string(),
        source("budget.default_query_cost", &["DUNEGATE_BUDGET_DEFAULT_QUERY_COST"]),
    ));

    lines.push(render_line(
        "cache.metadata_ttl_secs",
        &config.cache.metadata_ttl_secs.to_string(),
        source("cache.metadata_ttl_secs", &["DUNEGATE_CACHE_METADATA_TTL_SECS"]),
    ));
    lines.push(render_line(
        "cache.search_ttl_secs",
        &config.cache.search_ttl_secs.to_string(),
        source("cache.search_ttl_secs", &["DUNEGATE_CACHE_SEARCH_TTL_SECS"]),
    ));
    lines.push(render_line(
        "cache.max_entries",
        &config.cache.max_entries.to_string(),
        source("cache.max_entries", &["DUNEGATE_CACHE_MAX_ENTRIES"]),
    ));

    lines.push(render_line(
        "jobs.timeout_secs",
        &config.jobs.timeout_secs.to_string(),
        source("jobs.timeout_secs", &["DUNEGATE_JOBS_TIMEOUT_SECS"]),
    ));
    lines.push(render_line(
        "jobs.page_size",
        &config.jobs.page_size.to_string(),
        source("jobs.page_size", &["DUNEGATE_JOBS_PAGE_SIZE"]),
    ));
    lines.push(render_line(
        "jobs.preview_rows",
        &config.jobs.preview_rows.to_string(),
        source("jobs.preview_rows", &["DUNEGATE_JOBS_PREVIEW_ROWS"]),
    ));

    lines.push(render_line(
        "export.directory",
        &config.export.directory.display().to_string(),
        source("export.directory", &["DUNEGATE_EXPORT_DIRECTORY", "EXPORT_DIRECTORY"]),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", &["DUNEGATE_LOGGING_LEVEL", "DUNEGATE_LOG_LEVEL"]),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", &["DUNEGATE_LOGGING_FORMAT", "DUNEGATE_LOG_FORMAT"]),
    ));

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps the first four characters of long keys so operators can tell them apart.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if trimmed.chars().count() > 12 {
        let prefix: String = trimmed.chars().take(4).collect();
        return format!("{prefix}***");
    }

    "<redacted>".to_string()
}

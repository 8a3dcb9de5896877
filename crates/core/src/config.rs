use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::BudgetPolicy;

pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["dunegate.toml", "config/dunegate.toml"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub dune: DuneConfig,
    pub budget: BudgetConfig,
    pub cache: CacheConfig,
    pub jobs: JobsConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DuneConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub graphql_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub user_handle: Option<String>,
    pub performance: QueryPerformance,
}

#[derive(Clone, Debug)]
pub struct BudgetConfig {
    pub max_queries: u32,
    pub max_session_cost: Decimal,
    pub max_query_cost: Decimal,
    /// Flat cost charged against the session budget for every execution.
    pub default_query_cost: Decimal,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub metadata_ttl_secs: u64,
    pub search_ttl_secs: u64,
    pub max_entries: u64,
}

#[derive(Clone, Debug)]
pub struct JobsConfig {
    pub timeout_secs: u64,
    pub page_size: u64,
    pub preview_rows: usize,
}

#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub directory: PathBuf,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Execution tier requested from the remote engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPerformance {
    Medium,
    Large,
}

impl QueryPerformance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub dune_api_key: Option<String>,
    pub dune_base_url: Option<String>,
    pub dune_user_handle: Option<String>,
    pub max_queries: Option<u32>,
    pub export_directory: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dune: DuneConfig {
                api_key: String::new().into(),
                base_url: "https://api.dune.com/api/v1".to_string(),
                graphql_url: "https://core-api.dune.com/public/graphql".to_string(),
                timeout_secs: 30,
                max_retries: 2,
                user_handle: None,
                performance: QueryPerformance::Medium,
            },
            budget: BudgetConfig {
                max_queries: 5,
                max_session_cost: Decimal::new(100, 0),
                max_query_cost: Decimal::new(100, 0),
                default_query_cost: Decimal::ZERO,
            },
            cache: CacheConfig { metadata_ttl_secs: 3600, search_ttl_secs: 300, max_entries: 1024 },
            jobs: JobsConfig { timeout_secs: 600, page_size: 1000, preview_rows: 5 },
            export: ExportConfig { directory: PathBuf::from("./dune_exports") },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl FromStr for QueryPerformance {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(ConfigError::Validation(format!(
                "unsupported dune.performance `{other}` (expected medium|large)"
            ))),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl BudgetConfig {
    pub fn policy(&self) -> BudgetPolicy {
        BudgetPolicy {
            max_queries: self.max_queries,
            max_session_cost: self.max_session_cost,
            max_query_cost: self.max_query_cost,
        }
    }
}

impl CacheConfig {
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_secs)
    }
}

impl JobsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options
                .config_path
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(dune) = patch.dune {
            if let Some(dune_api_key_value) = dune.api_key {
                self.dune.api_key = secret_value(dune_api_key_value);
            }
            if let Some(base_url) = dune.base_url {
                self.dune.base_url = base_url;
            }
            if let Some(graphql_url) = dune.graphql_url {
                self.dune.graphql_url = graphql_url;
            }
            if let Some(timeout_secs) = dune.timeout_secs {
                self.dune.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = dune.max_retries {
                self.dune.max_retries = max_retries;
            }
            if let Some(user_handle) = dune.user_handle {
                self.dune.user_handle = Some(user_handle);
            }
            if let Some(performance) = dune.performance {
                self.dune.performance = performance;
            }
        }

        if let Some(budget) = patch.budget {
            if let Some(max_queries) = budget.max_queries {
                self.budget.max_queries = max_queries;
            }
            if let Some(max_session_cost) = budget.max_session_cost {
                self.budget.max_session_cost = max_session_cost;
            }
            if let Some(max_query_cost) = budget.max_query_cost {
                self.budget.max_query_cost = max_query_cost;
            }
            if let Some(default_query_cost) = budget.default_query_cost {
                self.budget.default_query_cost = default_query_cost;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(metadata_ttl_secs) = cache.metadata_ttl_secs {
                self.cache.metadata_ttl_secs = metadata_ttl_secs;
            }
            if let Some(search_ttl_secs) = cache.search_ttl_secs {
                self.cache.search_ttl_secs = search_ttl_secs;
            }
            if let Some(max_entries) = cache.max_entries {
                self.cache.max_entries = max_entries;
            }
        }

        if let Some(jobs) = patch.jobs {
            if let Some(timeout_secs) = jobs.timeout_secs {
                self.jobs.timeout_secs = timeout_secs;
            }
            if let Some(page_size) = jobs.page_size {
                self.jobs.page_size = page_size;
            }
            if let Some(preview_rows) = jobs.preview_rows {
                self.jobs.preview_rows = preview_rows;
            }
        }

        if let Some(export) = patch.export {
            if let Some(directory) = export.directory {
                self.export.directory = directory;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        // Older deployments export the key as a comma list; the first entry is used.
        let legacy_api_key = read_env("DUNE_API_KEY").or_else(|| {
            read_env("DUNE_API_KEYS").and_then(|keys| {
                keys.split(',').map(str::trim).find(|key| !key.is_empty()).map(str::to_string)
            })
        });
        if let Some(value) = read_env("DUNEGATE_DUNE_API_KEY").or(legacy_api_key) {
            self.dune.api_key = secret_value(value);
        }
        if let Some(value) =
            read_env("DUNEGATE_DUNE_BASE_URL").or_else(|| read_env("DUNE_API_BASE_URL"))
        {
            self.dune.base_url = value;
        }
        if let Some(value) = read_env("DUNEGATE_DUNE_GRAPHQL_URL") {
            self.dune.graphql_url = value;
        }
        if let Some(value) = read_env("DUNEGATE_DUNE_TIMEOUT_SECS") {
            self.dune.timeout_secs = parse_u64("DUNEGATE_DUNE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DUNEGATE_DUNE_MAX_RETRIES") {
            self.dune.max_retries = parse_u32("DUNEGATE_DUNE_MAX_RETRIES", &value)?;
        }
        if let Some(value) =
            read_env("DUNEGATE_DUNE_USER_HANDLE").or_else(|| read_env("DUNE_USER_HANDLE"))
        {
            self.dune.user_handle = Some(value);
        }
        if let Some(value) = read_env("DUNEGATE_DUNE_PERFORMANCE") {
            self.dune.performance = value.parse()?;
        }

        if let Some((key, value)) =
            read_env_any(&["DUNEGATE_BUDGET_MAX_QUERIES", "MAX_QUERIES_PER_SESSION"])
        {
            self.budget.max_queries = parse_u32(key, &value)?;
        }
        if let Some((key, value)) =
            read_env_any(&["DUNEGATE_BUDGET_MAX_SESSION_COST", "MAX_CREDITS_PER_SESSION"])
        {
            self.budget.max_session_cost = parse_decimal(key, &value)?;
        }
        if let Some(value) = read_env("DUNEGATE_BUDGET_MAX_QUERY_COST") {
            self.budget.max_query_cost = parse_decimal("DUNEGATE_BUDGET_MAX_QUERY_COST", &value)?;
        }
        if let Some(value) = read_env("DUNEGATE_BUDGET_DEFAULT_QUERY_COST") {
            self.budget.default_query_cost =
                parse_decimal("DUNEGATE_BUDGET_DEFAULT_QUERY_COST", &value)?;
        }

        if let Some(value) = read_env("DUNEGATE_CACHE_METADATA_TTL_SECS") {
            self.cache.metadata_ttl_secs = parse_u64("DUNEGATE_CACHE_METADATA_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("DUNEGATE_CACHE_SEARCH_TTL_SECS") {
            self.cache.search_ttl_secs = parse_u64("DUNEGATE_CACHE_SEARCH_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("DUNEGATE_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = parse_u64("DUNEGATE_CACHE_MAX_ENTRIES", &value)?;
        }

        if let Some(value) = read_env("DUNEGATE_JOBS_TIMEOUT_SECS") {
            self.jobs.timeout_secs = parse_u64("DUNEGATE_JOBS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DUNEGATE_JOBS_PAGE_SIZE") {
            self.jobs.page_size = parse_u64("DUNEGATE_JOBS_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read_env("DUNEGATE_JOBS_PREVIEW_ROWS") {
            self.jobs.preview_rows = parse_u64("DUNEGATE_JOBS_PREVIEW_ROWS", &value)? as usize;
        }

        if let Some(value) =
            read_env("DUNEGATE_EXPORT_DIRECTORY").or_else(|| read_env("EXPORT_DIRECTORY"))
        {
            self.export.directory = PathBuf::from(value);
        }

        let log_level =
            read_env("DUNEGATE_LOGGING_LEVEL").or_else(|| read_env("DUNEGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DUNEGATE_LOGGING_FORMAT").or_else(|| read_env("DUNEGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(dune_api_key) = overrides.dune_api_key {
            self.dune.api_key = secret_value(dune_api_key);
        }
        if let Some(dune_base_url) = overrides.dune_base_url {
            self.dune.base_url = dune_base_url;
        }
        if let Some(user_handle) = overrides.dune_user_handle {
            self.dune.user_handle = Some(user_handle);
        }
        if let Some(max_queries) = overrides.max_queries {
            self.budget.max_queries = max_queries;
        }
        if let Some(directory) = overrides.export_directory {
            self.export.directory = directory;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_dune(&self.dune)?;
        validate_budget(&self.budget)?;
        validate_cache(&self.cache)?;
        validate_jobs(&self.jobs)?;
        validate_export(&self.export)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// First existing config file: the explicit path, else the default candidates.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    CONFIG_FILE_CANDIDATES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_dune(dune: &DuneConfig) -> Result<(), ConfigError> {
    if dune.api_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "dune.api_key is required. Create one at https://dune.com/settings/api and set DUNEGATE_DUNE_API_KEY (or DUNE_API_KEY)".to_string(),
        ));
    }

    for (field, url) in [("dune.base_url", &dune.base_url), ("dune.graphql_url", &dune.graphql_url)]
    {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "{field} must start with http:// or https:// (got `{url}`)"
            )));
        }
    }

    if dune.timeout_secs == 0 || dune.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "dune.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if dune.max_retries > 10 {
        return Err(ConfigError::Validation("dune.max_retries must be at most 10".to_string()));
    }

    if dune.user_handle.as_deref().is_some_and(|handle| handle.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "dune.user_handle must not be blank when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_budget(budget: &BudgetConfig) -> Result<(), ConfigError> {
    if budget.max_queries == 0 {
        return Err(ConfigError::Validation(
            "budget.max_queries must be greater than zero".to_string(),
        ));
    }

    let costs = [
        ("budget.max_session_cost", budget.max_session_cost),
        ("budget.max_query_cost", budget.max_query_cost),
        ("budget.default_query_cost", budget.default_query_cost),
    ];
    for (field, value) in costs {
        if value.is_sign_negative() {
            return Err(ConfigError::Validation(format!("{field} must not be negative")));
        }
    }

    if budget.default_query_cost > budget.max_query_cost {
        return Err(ConfigError::Validation(format!(
            "budget.default_query_cost ({}) exceeds budget.max_query_cost ({}); every execution would be denied",
            budget.default_query_cost, budget.max_query_cost
        )));
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.max_entries == 0 {
        return Err(ConfigError::Validation(
            "cache.max_entries must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_jobs(jobs: &JobsConfig) -> Result<(), ConfigError> {
    if jobs.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "jobs.timeout_secs must be greater than zero".to_string(),
        ));
    }

    if jobs.page_size == 0 || jobs.page_size > 100_000 {
        return Err(ConfigError::Validation(
            "jobs.page_size must be in range 1..=100000".to_string(),
        ));
    }

    if jobs.preview_rows == 0 || jobs.preview_rows > 1000 {
        return Err(ConfigError::Validation(
            "jobs.preview_rows must be in range 1..=1000".to_string(),
        ));
    }

    Ok(())
}

fn validate_export(export: &ExportConfig) -> Result<(), ConfigError> {
    if export.directory.as_os_str().is_empty() {
        return Err(ConfigError::Validation("export.directory must not be empty".to_string()));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_env_any<'a>(keys: &[&'a str]) -> Option<(&'a str, String)> {
    keys.iter().find_map(|key| read_env(key).map(|value| (*key, value)))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    Decimal::from_str(value.trim()).map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    dune: Option<DunePatch>,
    budget: Option<BudgetPatch>,
    cache: Option<CachePatch>,
    jobs: Option<JobsPatch>,
    export: Option<ExportPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DunePatch {
    api_key: Option<String>,
    base_url: Option<String>,
    graphql_url: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    user_handle: Option<String>,
    performance: Option<QueryPerformance>,
}

#[derive(Debug, Default, Deserialize)]
struct BudgetPatch {
    max_queries: Option<u32>,
    max_session_cost: Option<Decimal>,
    max_query_cost: Option<Decimal>,
    default_query_cost: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    metadata_ttl_secs: Option<u64>,
    search_ttl_secs: Option<u64>,
    max_entries: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsPatch {
    timeout_secs: Option<u64>,
    page_size: Option<u64>,
    preview_rows: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ExportPatch {
    directory: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

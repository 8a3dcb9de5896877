use std::env;
use std::sync::{Mutex, OnceLock};

use dunegate_cli::commands::{config, doctor};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY: &str = "dk_test_0123456789abcdef";

#[test]
fn config_reports_sources_and_redacts_api_key() {
    with_env(&[("DUNEGATE_DUNE_API_KEY", API_KEY), ("DUNE_USER_HANDLE", "analyst")], || {
        let result = config::run();
        assert_eq!(result.exit_code, 0, "expected config to render");

        assert!(result
            .output
            .contains("- dune.api_key = dk_t*** (source: env (DUNEGATE_DUNE_API_KEY))"));
        assert!(result.output.contains("- dune.user_handle = analyst (source: env (DUNE_USER_HANDLE))"));
        assert!(result.output.contains("- budget.max_queries = 5 (source: default)"));
        assert!(!result.output.contains(API_KEY));
    });
}

#[test]
fn config_honors_legacy_budget_alias() {
    with_env(&[("DUNE_API_KEY", API_KEY), ("MAX_QUERIES_PER_SESSION", "2")], || {
        let result = config::run();
        assert_eq!(result.exit_code, 0);
        assert!(result
            .output
            .contains("- budget.max_queries = 2 (source: env (MAX_QUERIES_PER_SESSION))"));
    });
}

#[test]
fn config_returns_validation_failure_without_api_key() {
    with_env(&[], || {
        let result = config::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "config");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
        assert!(payload["message"].as_str().unwrap_or_default().contains("dune.api_key"));
    });
}

#[test]
fn doctor_skips_remote_check_when_config_is_invalid() {
    with_env(&[], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let report = parse_payload(&result.output);
        assert_eq!(report["overall_status"], "fail");
        assert_eq!(report["checks"][0]["name"], "config_validation");
        assert_eq!(report["checks"][0]["status"], "fail");
        assert_eq!(report["checks"][2]["name"], "dune_connectivity");
        assert_eq!(report["checks"][2]["status"], "skipped");
    });
}

#[test]
fn doctor_passes_against_reachable_api() {
    let runtime = tokio::runtime::Runtime::new().expect("test runtime");
    let server = runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/usage"))
            .and(header("X-Dune-Api-Key", API_KEY))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "billingPeriods": [{
                    "startDate": "2026-10-01",
                    "endDate": "2026-10-31",
                    "creditsUsed": 100.0,
                    "creditsIncluded": 2500.0
                }]
            })))
            .mount(&server)
            .await;
        server
    });
    let base_url = format!("{}/api/v1", server.uri());

    with_env(
        &[
            ("DUNEGATE_DUNE_API_KEY", API_KEY),
            ("DUNEGATE_DUNE_BASE_URL", &base_url),
            ("DUNEGATE_EXPORT_DIRECTORY", "."),
        ],
        || {
            let result = doctor::run(false);
            assert_eq!(result.exit_code, 0, "unexpected report:\n{}", result.output);
            assert!(result.output.starts_with("doctor: all readiness checks passed"));
            assert!(result.output.contains("2400 of 2500 credits left this period"));
        },
    );
}

#[test]
fn doctor_reports_rejected_api_key() {
    let runtime = tokio::runtime::Runtime::new().expect("test runtime");
    let server = runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/usage"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "invalid API Key"})))
            .expect(1)
            .mount(&server)
            .await;
        server
    });
    let base_url = format!("{}/api/v1", server.uri());

    with_env(&[("DUNEGATE_DUNE_API_KEY", API_KEY), ("DUNEGATE_DUNE_BASE_URL", &base_url)], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let report = parse_payload(&result.output);
        assert_eq!(report["checks"][2]["status"], "fail");
        assert!(report["checks"][2]["details"]
            .as_str()
            .unwrap_or_default()
            .contains("invalid API Key"));
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let keys = [
        "DUNEGATE_DUNE_API_KEY",
        "DUNE_API_KEY",
        "DUNE_API_KEYS",
        "DUNEGATE_DUNE_BASE_URL",
        "DUNE_API_BASE_URL",
        "DUNEGATE_DUNE_GRAPHQL_URL",
        "DUNEGATE_DUNE_TIMEOUT_SECS",
        "DUNEGATE_DUNE_MAX_RETRIES",
        "DUNEGATE_DUNE_USER_HANDLE",
        "DUNE_USER_HANDLE",
        "DUNEGATE_DUNE_PERFORMANCE",
        "DUNEGATE_BUDGET_MAX_QUERIES",
        "MAX_QUERIES_PER_SESSION",
        "DUNEGATE_BUDGET_MAX_SESSION_COST",
        "MAX_CREDITS_PER_SESSION",
        "DUNEGATE_BUDGET_MAX_QUERY_COST",
        "DUNEGATE_BUDGET_DEFAULT_QUERY_COST",
        "DUNEGATE_CACHE_METADATA_TTL_SECS",
        "DUNEGATE_CACHE_SEARCH_TTL_SECS",
        "DUNEGATE_CACHE_MAX_ENTRIES",
        "DUNEGATE_JOBS_TIMEOUT_SECS",
        "DUNEGATE_JOBS_PAGE_SIZE",
        "DUNEGATE_JOBS_PREVIEW_ROWS",
        "DUNEGATE_EXPORT_DIRECTORY",
        "EXPORT_DIRECTORY",
        "DUNEGATE_LOGGING_LEVEL",
        "DUNEGATE_LOGGING_FORMAT",
        "DUNEGATE_LOG_LEVEL",
        "DUNEGATE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}

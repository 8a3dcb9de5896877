//! MCP Tools for Dunegate
//!
//! This module organizes the MCP tools into categories:
//! - Discovery: finding queries and reading their definitions
//! - Execution: submitting queries and following their jobs
//! - Results: summaries and CSV exports of completed jobs
//! - Budget: session limits and account credits

/// Discovery tools category
pub struct DiscoveryTools;

/// Execution tools category
pub struct ExecutionTools;

/// Results tools category
pub struct ResultsTools;

/// Budget tools category
pub struct BudgetTools;

/// Tool category trait
pub trait ToolCategory {
    /// Category name
    fn category_name() -> &'static str
    where
        Self: Sized;
    /// List of tool names in this category
    fn tool_names() -> &'static [&'static str]
    where
        Self: Sized;
}

impl ToolCategory for DiscoveryTools {
    fn category_name() -> &'static str {
        "discovery"
    }
    fn tool_names() -> &'static [&'static str] {
        &["search_public_queries", "list_user_queries", "get_query_details"]
    }
}

impl ToolCategory for ExecutionTools {
    fn category_name() -> &'static str {
        "execution"
    }
    fn tool_names() -> &'static [&'static str] {
        &["execute_query", "get_job_status"]
    }
}

impl ToolCategory for ResultsTools {
    fn category_name() -> &'static str {
        "results"
    }
    fn tool_names() -> &'static [&'static str] {
        &["get_job_results_summary", "export_results_to_csv"]
    }
}

impl ToolCategory for BudgetTools {
    fn category_name() -> &'static str {
        "budget"
    }
    fn tool_names() -> &'static [&'static str] {
        &["get_account_status", "get_session_budget", "reset_session_budget"]
    }
}

/// All tool names
pub const ALL_TOOL_NAMES: &[&str] = &[
    "search_public_queries",
    "list_user_queries",
    "get_query_details",
    "execute_query",
    "get_job_status",
    "get_job_results_summary",
    "export_results_to_csv",
    "get_account_status",
    "get_session_budget",
    "reset_session_budget",
];

/// Total number of tools
pub const TOTAL_TOOLS: usize = ALL_TOOL_NAMES.len();

fn category_line<C: ToolCategory>() -> String {
    format!("{}: {}", C::category_name(), C::tool_names().join(", "))
}

/// One line per category, in the order an agent typically works through them.
pub fn tool_guide() -> String {
    [
        category_line::<DiscoveryTools>(),
        category_line::<ExecutionTools>(),
        category_line::<ResultsTools>(),
        category_line::<BudgetTools>(),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_counts() {
        assert_eq!(DiscoveryTools::tool_names().len(), 3);
        assert_eq!(ExecutionTools::tool_names().len(), 2);
        assert_eq!(ResultsTools::tool_names().len(), 2);
        assert_eq!(BudgetTools::tool_names().len(), 3);
        assert_eq!(TOTAL_TOOLS, 10);
    }

    #[test]
    fn categories_cover_every_tool_once() {
        let mut grouped: Vec<&str> = [
            DiscoveryTools::tool_names(),
            ExecutionTools::tool_names(),
            ResultsTools::tool_names(),
            BudgetTools::tool_names(),
        ]
        .concat();
        grouped.sort_unstable();

        let mut all = ALL_TOOL_NAMES.to_vec();
        all.sort_unstable();
        assert_eq!(grouped, all);
    }

    #[test]
    fn guide_lists_categories_in_workflow_order() {
        let guide = tool_guide();
        let lines: Vec<&str> = guide.lines().collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "discovery: search_public_queries, list_user_queries, get_query_details");
        assert!(lines[3].starts_with("budget: "));
    }
}

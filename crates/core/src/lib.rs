pub mod budget;
pub mod cache;
pub mod clock;
pub mod config;
pub mod cost;
pub mod domain;
pub mod errors;
pub mod export;
pub mod fixtures;
pub mod gateway;
pub mod jobs;
pub mod remote;
pub mod summarizer;

pub use budget::{BudgetDecision, BudgetGrant, BudgetLimit, BudgetManager, BudgetPolicy, BudgetStatus};
pub use cache::TtlCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use cost::{CostEstimator, FlatCostEstimator};
pub use domain::account::{AccountUsage, BillingPeriod};
pub use domain::job::{JobId, JobOutcome, JobRecord, JobState};
pub use domain::query::{QueryId, QueryMetadata, QueryParameter, QueryParams, QuerySummary};
pub use domain::results::{Column, Row, RowBatch};
pub use domain::session::{Session, SessionId};
pub use errors::{GatewayError, GatewayResult};
pub use export::ExportReceipt;
pub use gateway::{ExecuteRequest, Execution, Gateway, GatewaySettings};
pub use jobs::{JobTracker, Submission};
pub use remote::{RemoteError, RemoteQueryClient, RemoteState, RemoteStatus};
pub use summarizer::{ColumnStats, ResultSummarizer, Summary};

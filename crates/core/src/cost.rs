use rust_decimal::Decimal;

use crate::domain::query::{QueryId, QueryParams};

/// Predicts what an execution will charge before it is submitted.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, query_id: QueryId, params: &QueryParams) -> Decimal;
}

/// Charges the same amount for every execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlatCostEstimator {
    per_query: Decimal,
}

impl FlatCostEstimator {
    pub fn new(per_query: Decimal) -> Self {
        Self { per_query: per_query.max(Decimal::ZERO) }
    }
}

impl CostEstimator for FlatCostEstimator {
    fn estimate(&self, _query_id: QueryId, _params: &QueryParams) -> Decimal {
        self.per_query
    }
}

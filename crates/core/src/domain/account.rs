use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start_date: String,
    pub end_date: String,
    pub credits_used: f64,
    pub credits_included: f64,
}

impl BillingPeriod {
    pub fn credits_remaining(&self) -> f64 {
        self.credits_included - self.credits_used
    }
}

/// Account-level credit usage as reported by the remote service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountUsage {
    #[serde(default)]
    pub billing_periods: Vec<BillingPeriod>,
}

impl AccountUsage {
    pub fn current_period(&self) -> Option<&BillingPeriod> {
        self.billing_periods.first()
    }
}

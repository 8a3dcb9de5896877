//! Per-session budget guard.
//!
//! `authorize` evaluates the session counters against an immutable
//! [`BudgetPolicy`] and, on success, hands out a [`BudgetGrant`] that reserves
//! one query and the estimated cost. The grant is the only way to `record`
//! consumption; dropping it unrecorded (for example when the submission fails)
//! releases the reservation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::domain::session::{Session, SessionId};
use crate::errors::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BudgetLimit {
    #[serde(rename = "maxQueries")]
    MaxQueries,
    #[serde(rename = "maxSessionCost")]
    MaxSessionCost,
    #[serde(rename = "maxQueryCost")]
    MaxQueryCost,
}

impl BudgetLimit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxQueries => "maxQueries",
            Self::MaxSessionCost => "maxSessionCost",
            Self::MaxQueryCost => "maxQueryCost",
        }
    }
}

impl fmt::Display for BudgetLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub max_queries: u32,
    pub max_session_cost: Decimal,
    pub max_query_cost: Decimal,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_queries: 5,
            max_session_cost: Decimal::new(100, 0),
            max_query_cost: Decimal::new(100, 0),
        }
    }
}

#[derive(Debug)]
pub enum BudgetDecision {
    Allow(BudgetGrant),
    Deny { limit: BudgetLimit, reason: String },
}

impl BudgetDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    pub fn into_result(self) -> Result<BudgetGrant, GatewayError> {
        match self {
            Self::Allow(grant) => Ok(grant),
            Self::Deny { limit, reason } => Err(GatewayError::BudgetExceeded { limit, reason }),
        }
    }
}

/// Reservation produced by an allowed authorization.
#[must_use = "an unrecorded grant is released when dropped"]
#[derive(Debug)]
pub struct BudgetGrant {
    session_id: SessionId,
    estimated_cost: Decimal,
    ledgers: Weak<Mutex<HashMap<SessionId, SessionLedger>>>,
    settled: bool,
}

impl BudgetGrant {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn estimated_cost(&self) -> Decimal {
        self.estimated_cost
    }
}

impl Drop for BudgetGrant {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Some(ledgers) = self.ledgers.upgrade() else {
            return;
        };
        let mut ledgers = lock(&ledgers);
        if let Some(ledger) = ledgers.get_mut(&self.session_id) {
            ledger.release(self.estimated_cost);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub session_id: SessionId,
    pub queries_used: u32,
    pub queries_remaining: u32,
    pub max_queries: u32,
    pub cost_used: Decimal,
    pub cost_remaining: Decimal,
    pub max_session_cost: Decimal,
    pub max_query_cost: Decimal,
}

#[derive(Debug)]
struct SessionLedger {
    session: Session,
    reserved_queries: u32,
    reserved_cost: Decimal,
}

impl SessionLedger {
    fn release(&mut self, cost: Decimal) {
        self.reserved_queries = self.reserved_queries.saturating_sub(1);
        self.reserved_cost = (self.reserved_cost - cost).max(Decimal::ZERO);
    }
}

pub struct BudgetManager {
    policy: BudgetPolicy,
    ledgers: Arc<Mutex<HashMap<SessionId, SessionLedger>>>,
    clock: Arc<dyn Clock>,
}

impl BudgetManager {
    pub fn new(policy: BudgetPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: BudgetPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, ledgers: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    /// Checks the three limits in order; the first breached one wins.
    /// Negative estimates are treated as zero.
    pub fn authorize(&self, session_id: &SessionId, estimated_cost: Decimal) -> BudgetDecision {
        let estimated_cost = non_negative(session_id, "estimated_cost", estimated_cost);
        let mut ledgers = lock(&self.ledgers);
        let now = self.clock.now();
        let ledger = ledgers.entry(session_id.clone()).or_insert_with(|| SessionLedger {
            session: Session::new(session_id.clone(), now),
            reserved_queries: 0,
            reserved_cost: Decimal::ZERO,
        });

        let queries_committed = ledger.session.queries_used + ledger.reserved_queries;
        let cost_committed = ledger.session.cost_used + ledger.reserved_cost;

        let denial = if queries_committed >= self.policy.max_queries {
            Some((
                BudgetLimit::MaxQueries,
                format!(
                    "session `{session_id}` has used {queries_committed} of {} allowed queries",
                    self.policy.max_queries
                ),
            ))
        } else if cost_committed + estimated_cost > self.policy.max_session_cost {
            Some((
                BudgetLimit::MaxSessionCost,
                format!(
                    "estimated cost {estimated_cost} would bring session `{session_id}` to {} of {} credits",
                    cost_committed + estimated_cost,
                    self.policy.max_session_cost
                ),
            ))
        } else if estimated_cost > self.policy.max_query_cost {
            Some((
                BudgetLimit::MaxQueryCost,
                format!(
                    "estimated cost {estimated_cost} exceeds the per-query limit of {} credits",
                    self.policy.max_query_cost
                ),
            ))
        } else {
            None
        };

        if let Some((limit, reason)) = denial {
            info!(
                event_name = "budget.authorize.denied",
                session_id = %session_id,
                limit = %limit,
                estimated_cost = %estimated_cost,
                "budget authorization denied"
            );
            return BudgetDecision::Deny { limit, reason };
        }

        ledger.reserved_queries += 1;
        ledger.reserved_cost += estimated_cost;

        BudgetDecision::Allow(BudgetGrant {
            session_id: session_id.clone(),
            estimated_cost,
            ledgers: Arc::downgrade(&self.ledgers),
            settled: false,
        })
    }

    /// Converts a reservation into consumption. Call only once the query is
    /// confirmed submitted.
    pub fn record(&self, mut grant: BudgetGrant, actual_cost: Decimal) -> BudgetStatus {
        grant.settled = true;
        let actual_cost = non_negative(&grant.session_id, "actual_cost", actual_cost);
        let mut ledgers = lock(&self.ledgers);
        let now = self.clock.now();
        let ledger = ledgers.entry(grant.session_id.clone()).or_insert_with(|| SessionLedger {
            session: Session::new(grant.session_id.clone(), now),
            reserved_queries: 1,
            reserved_cost: grant.estimated_cost,
        });

        ledger.release(grant.estimated_cost);
        ledger.session.queries_used += 1;
        ledger.session.cost_used += actual_cost;

        if actual_cost > grant.estimated_cost {
            warn!(
                event_name = "budget.record.overrun",
                session_id = %grant.session_id,
                estimated_cost = %grant.estimated_cost,
                actual_cost = %actual_cost,
                "recorded cost is above the authorized estimate"
            );
        }

        self.status_of(&grant.session_id, Some(&ledger.session))
    }

    pub fn status(&self, session_id: &SessionId) -> BudgetStatus {
        let ledgers = lock(&self.ledgers);
        self.status_of(session_id, ledgers.get(session_id).map(|ledger| &ledger.session))
    }

    /// Forgets a session's counters. Returns whether the session existed.
    pub fn reset(&self, session_id: &SessionId) -> bool {
        let removed = lock(&self.ledgers).remove(session_id).is_some();
        if removed {
            info!(event_name = "budget.session.reset", session_id = %session_id, "session budget reset");
        }
        removed
    }

    fn status_of(&self, session_id: &SessionId, session: Option<&Session>) -> BudgetStatus {
        let (queries_used, cost_used) =
            session.map(|session| (session.queries_used, session.cost_used)).unwrap_or_default();

        BudgetStatus {
            session_id: session_id.clone(),
            queries_used,
            queries_remaining: self.policy.max_queries.saturating_sub(queries_used),
            max_queries: self.policy.max_queries,
            cost_used,
            cost_remaining: (self.policy.max_session_cost - cost_used).max(Decimal::ZERO),
            max_session_cost: self.policy.max_session_cost,
            max_query_cost: self.policy.max_query_cost,
        }
    }
}

fn non_negative(session_id: &SessionId, field: &'static str, cost: Decimal) -> Decimal {
    if cost.is_sign_negative() && !cost.is_zero() {
        warn!(
            event_name = "budget.cost.negative",
            session_id = %session_id,
            field,
            cost = %cost,
            "negative cost clamped to zero"
        );
        return Decimal::ZERO;
    }
    cost
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{BudgetDecision, BudgetLimit, BudgetManager, BudgetPolicy};
    use crate::domain::session::SessionId;

    fn policy(max_queries: u32, max_session_cost: i64, max_query_cost: i64) -> BudgetPolicy {
        BudgetPolicy {
            max_queries,
            max_session_cost: Decimal::new(max_session_cost, 0),
            max_query_cost: Decimal::new(max_query_cost, 0),
        }
    }

    fn denied_limit(decision: BudgetDecision) -> Option<BudgetLimit> {
        match decision {
            BudgetDecision::Deny { limit, .. } => Some(limit),
            BudgetDecision::Allow(_) => None,
        }
    }

    #[test]
    fn queries_used_tracks_recorded_executions_until_limit() {
        let manager = BudgetManager::new(policy(3, 100, 100));
        let session = SessionId::new("s1");

        for _ in 0..3 {
            let grant = manager.authorize(&session, Decimal::ONE).into_result().expect("allowed");
            manager.record(grant, Decimal::ONE);
        }

        let status = manager.status(&session);
        assert_eq!(status.queries_used, 3);
        assert_eq!(status.queries_remaining, 0);
        assert_eq!(denied_limit(manager.authorize(&session, Decimal::ONE)), Some(BudgetLimit::MaxQueries));
    }

    #[test]
    fn first_failing_rule_wins() {
        let manager = BudgetManager::new(policy(0, 10, 5));
        let session = SessionId::new("s1");

        // Every rule fails here; the query count is checked first.
        assert_eq!(
            denied_limit(manager.authorize(&session, Decimal::new(50, 0))),
            Some(BudgetLimit::MaxQueries)
        );

        let manager = BudgetManager::new(policy(10, 10, 5));
        assert_eq!(
            denied_limit(manager.authorize(&session, Decimal::new(50, 0))),
            Some(BudgetLimit::MaxSessionCost)
        );
        assert_eq!(
            denied_limit(manager.authorize(&session, Decimal::new(6, 0))),
            Some(BudgetLimit::MaxQueryCost)
        );
    }

    #[test]
    fn session_cost_is_cumulative() {
        let manager = BudgetManager::new(policy(10, 10, 10));
        let session = SessionId::new("s1");

        let grant = manager.authorize(&session, Decimal::new(6, 0)).into_result().expect("allowed");
        manager.record(grant, Decimal::new(6, 0));

        let decision = manager.authorize(&session, Decimal::new(5, 0));
        assert_eq!(denied_limit(decision), Some(BudgetLimit::MaxSessionCost));

        let status = manager.status(&session);
        assert_eq!(status.cost_used, Decimal::new(6, 0));
        assert_eq!(status.cost_remaining, Decimal::new(4, 0));
    }

    #[test]
    fn outstanding_grants_count_against_limits() {
        let manager = BudgetManager::new(policy(1, 100, 100));
        let session = SessionId::new("s1");

        let first = manager.authorize(&session, Decimal::ZERO);
        assert!(first.is_allowed());
        assert_eq!(denied_limit(manager.authorize(&session, Decimal::ZERO)), Some(BudgetLimit::MaxQueries));

        drop(first);
        assert!(manager.authorize(&session, Decimal::ZERO).is_allowed());
        assert_eq!(manager.status(&session).queries_used, 0);
    }

    #[test]
    fn sessions_are_isolated_and_resettable() {
        let manager = BudgetManager::new(policy(1, 100, 100));
        let first = SessionId::new("s1");
        let second = SessionId::new("s2");

        let grant = manager.authorize(&first, Decimal::ONE).into_result().expect("allowed");
        manager.record(grant, Decimal::ONE);

        assert!(manager.authorize(&second, Decimal::ONE).is_allowed());
        assert!(!manager.authorize(&first, Decimal::ONE).is_allowed());

        assert!(manager.reset(&first));
        assert!(!manager.reset(&SessionId::new("never-seen")));
        assert_eq!(manager.status(&first).queries_used, 0);
        assert!(manager.authorize(&first, Decimal::ONE).is_allowed());
    }

    #[test]
    fn negative_costs_never_widen_the_session_budget() {
        let manager = BudgetManager::new(policy(10, 100, 100));
        let session = SessionId::new("s1");
        let refund = Decimal::new(-50, 0);

        let grant = manager.authorize(&session, refund).into_result().expect("allowed");
        assert_eq!(grant.estimated_cost(), Decimal::ZERO);
        let status = manager.record(grant, refund);

        assert_eq!(status.cost_used, Decimal::ZERO);
        assert_eq!(status.cost_remaining, Decimal::new(100, 0));
        assert_eq!(
            denied_limit(manager.authorize(&session, Decimal::new(101, 0))),
            Some(BudgetLimit::MaxSessionCost)
        );
    }

    #[test]
    fn status_for_unknown_session_reports_full_budget() {
        let manager = BudgetManager::new(BudgetPolicy::default());
        let status = manager.status(&SessionId::new("fresh"));

        assert_eq!(status.queries_used, 0);
        assert_eq!(status.queries_remaining, 5);
        assert_eq!(status.cost_remaining, Decimal::new(100, 0));
    }

    #[test]
    fn denial_reason_is_human_readable() {
        let manager = BudgetManager::new(policy(0, 100, 100));
        match manager.authorize(&SessionId::new("s1"), Decimal::ZERO) {
            BudgetDecision::Deny { reason, .. } => assert!(reason.contains("0 of 0 allowed queries")),
            BudgetDecision::Allow(_) => panic!("expected denial"),
        }
    }
}

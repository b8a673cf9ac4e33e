//! Cost and retry budgets.
//!
//! Both counters are derived from the run history at reconstruction time;
//! the tracker only adds the in-flight reservations of the current wave on
//! top. Reservations let parallel nodes share one ceiling: a node may start
//! only if the recorded cost plus everything already reserved plus its own
//! estimate stays within the budget.

use tracing::debug;

use crate::{CogWorksError, CostBudget, NodeId, RunState, TokenCost};

/// Cost set aside for one node until its actual cost is known.
#[derive(Debug, PartialEq)]
#[must_use = "a reservation must be settled with record_actual"]
pub struct Reservation {
    node: NodeId,
    estimated: TokenCost,
}

impl Reservation {
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

/// Enforces the cost ceiling and the rework retry limit for one run.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    limit: CostBudget,
    max_retries: u32,
    accumulated: TokenCost,
    reserved: TokenCost,
    retries: u32,
}

impl BudgetTracker {
    /// Starts from the counters recorded in `state`.
    pub fn from_state(state: &RunState, limit: CostBudget, max_retries: u32) -> Self {
        Self {
            limit,
            max_retries,
            accumulated: state.accumulated_cost(),
            reserved: TokenCost::zero(),
            retries: state.retries(),
        }
    }

    /// Reserves `estimated` for `node` if the ceiling allows it.
    ///
    /// # Errors
    ///
    /// [`CogWorksError::BudgetExceeded`] when the reservation would go past
    /// the ceiling.
    pub fn check_and_reserve(
        &mut self,
        node: &NodeId,
        estimated: TokenCost,
    ) -> Result<Reservation, CogWorksError> {
        let committed = self.accumulated + self.reserved;
        if self.limit.is_exceeded_by(committed) || self.limit.would_exceed(committed, estimated) {
            return Err(CogWorksError::BudgetExceeded {
                accumulated: committed,
                limit: self.limit,
            });
        }
        self.reserved += estimated;
        debug!(node = %node, estimated = %estimated, reserved = %self.reserved, "Reserved budget");
        Ok(Reservation {
            node: node.clone(),
            estimated,
        })
    }

    /// Replaces a reservation with the cost actually incurred.
    pub fn record_actual(&mut self, reservation: Reservation, actual: TokenCost) {
        self.reserved = self.reserved.saturating_sub(reservation.estimated);
        self.accumulated += actual;
    }

    /// Records cost that had no reservation (e.g. predicate evaluation).
    pub fn record_unreserved(&mut self, actual: TokenCost) {
        self.accumulated += actual;
    }

    /// Whether one more rework traversal into `node` is allowed.
    ///
    /// # Errors
    ///
    /// [`CogWorksError::RetryLimitExceeded`] when the run already used every
    /// permitted retry.
    pub fn check_retry(&self, node: &NodeId) -> Result<(), CogWorksError> {
        if self.retries >= self.max_retries {
            debug!(node = %node, retries = self.retries, "Retry limit reached");
            return Err(CogWorksError::RetryLimitExceeded {
                retries: self.retries,
                limit: self.max_retries,
            });
        }
        Ok(())
    }

    /// Counts a rework traversal.
    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// Whether the recorded cost has reached the ceiling.
    pub fn is_exhausted(&self) -> bool {
        self.limit.is_exceeded_by(self.accumulated)
    }

    pub fn accumulated(&self) -> TokenCost {
        self.accumulated
    }

    pub fn limit(&self) -> CostBudget {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_work_item;

    fn tracker(limit: f64, max_retries: u32) -> BudgetTracker {
        BudgetTracker::from_state(
            &RunState::empty(sample_work_item(1)),
            CostBudget::new(limit).unwrap(),
            max_retries,
        )
    }

    fn cost(v: f64) -> TokenCost {
        TokenCost::new(v).unwrap()
    }

    fn node() -> NodeId {
        NodeId::new("n").unwrap()
    }

    #[test]
    fn reservations_share_the_ceiling() {
        let mut budget = tracker(1.0, 3);
        let first = budget.check_and_reserve(&node(), cost(0.6)).unwrap();
        assert!(matches!(
            budget.check_and_reserve(&node(), cost(0.6)),
            Err(CogWorksError::BudgetExceeded { .. })
        ));

        budget.record_actual(first, cost(0.2));
        let second = budget.check_and_reserve(&node(), cost(0.6)).unwrap();
        budget.record_actual(second, cost(0.1));
        assert!((budget.accumulated().as_f64() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn exhausted_budget_refuses_even_free_nodes() {
        let mut budget = tracker(0.5, 3);
        let r = budget.check_and_reserve(&node(), cost(0.1)).unwrap();
        budget.record_actual(r, cost(0.7));
        assert!(budget.is_exhausted());
        assert!(budget.check_and_reserve(&node(), TokenCost::zero()).is_err());
    }

    #[test]
    fn retries_are_bounded() {
        let mut budget = tracker(10.0, 2);
        assert!(budget.check_retry(&node()).is_ok());
        budget.record_retry();
        budget.record_retry();
        assert!(matches!(
            budget.check_retry(&node()),
            Err(CogWorksError::RetryLimitExceeded { retries: 2, limit: 2 })
        ));
    }
}

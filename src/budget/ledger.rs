use std::collections::HashMap;

use log::debug;
use serde::Serialize;

use crate::util::shared_types::{EpochIndex, Site};

/// Hard cap on the epsilon a single conversion may spend.
pub const MAX_CONVERSION_EPSILON: f64 = 14.0;

/// Slack granted on top of the configured budget when a cell is first
/// used, absorbing the first query's ceil-rounding. Part of the contract.
const INITIAL_SLACK_MICRO_EPSILONS: u64 = 1000;

const MICRO_EPSILONS_PER_EPSILON: f64 = 1_000_000.0;

/// Remaining privacy budget for one (site, epoch) cell, in micro-epsilons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetEntry {
    pub remaining_micro_epsilons: u64,
}

/// Outcome of a deduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    /// The cell covered the loss and was decremented.
    Continue,
    /// The loss was unpayable; the cell is now zero.
    OutOfBudget,
}

/// Privacy loss parameters of one conversion query against one epoch.
#[derive(Debug, Clone)]
pub struct ConversionLoss {
    pub epsilon: f64,
    pub value: u64,
    pub max_value: u64,
    /// Observed histogram L1-norm. When absent the worst case `2·value`
    /// is charged, as required before the histogram is known.
    pub l1_norm: Option<u64>,
}

impl ConversionLoss {
    fn sensitivity(&self) -> f64 {
        match self.l1_norm {
            Some(norm) => norm as f64,
            None => 2.0 * self.value as f64,
        }
    }
}

/// Per-(site, epoch) epsilon accounting.
///
/// Cells are created lazily at `configured_budget + 1000` micro-epsilons
/// and only ever decrease, except through `clearState`. A failed deduction
/// burns the rest of the cell so callers cannot probe the remainder.
#[derive(Debug)]
pub struct PrivacyBudgetLedger {
    budget_micro_epsilons: u64,
    entries: HashMap<(Site, EpochIndex), BudgetEntry>,
}

impl PrivacyBudgetLedger {
    pub fn new(budget_micro_epsilons: u64) -> Self {
        Self {
            budget_micro_epsilons,
            entries: HashMap::new(),
        }
    }

    fn entry_mut(&mut self, site: &Site, epoch: EpochIndex) -> &mut BudgetEntry {
        let capacity = self.budget_micro_epsilons + INITIAL_SLACK_MICRO_EPSILONS;
        self.entries
            .entry((site.clone(), epoch))
            .or_insert(BudgetEntry {
                remaining_micro_epsilons: capacity,
            })
    }

    /// Tries to pay for `loss` from the (site, epoch) cell.
    pub fn try_deduct(
        &mut self,
        site: &Site,
        epoch: EpochIndex,
        loss: &ConversionLoss,
    ) -> LedgerStatus {
        let sensitivity = loss.sensitivity();
        let noise_scale = 2.0 * loss.max_value as f64 / loss.epsilon;
        let spent_epsilon = sensitivity / noise_scale;

        let entry = self.entry_mut(site, epoch);
        if !(0.0..=MAX_CONVERSION_EPSILON).contains(&spent_epsilon) {
            entry.remaining_micro_epsilons = 0;
            return LedgerStatus::OutOfBudget;
        }

        let cost = (spent_epsilon * MICRO_EPSILONS_PER_EPSILON).ceil() as u64;
        if cost > entry.remaining_micro_epsilons {
            debug!(
                "Budget cell ({site}, {epoch}) exhausted: cost {cost} > \
                 remaining {}",
                entry.remaining_micro_epsilons
            );
            entry.remaining_micro_epsilons = 0;
            return LedgerStatus::OutOfBudget;
        }

        entry.remaining_micro_epsilons -= cost;
        debug!(
            "Deducted {cost} micro-epsilons from ({site}, {epoch}), \
             {} remaining",
            entry.remaining_micro_epsilons
        );
        LedgerStatus::Continue
    }

    /// Zeroes the (site, epoch) cell, creating it if absent. Used by
    /// partial `clearState`.
    pub fn zero_entry(&mut self, site: &Site, epoch: EpochIndex) {
        self.entry_mut(site, epoch).remaining_micro_epsilons = 0;
    }

    /// Drops every cell belonging to `site`.
    pub fn forget_site(&mut self, site: &Site) {
        self.entries.retain(|(entry_site, _), _| entry_site != site);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &HashMap<(Site, EpochIndex), BudgetEntry> {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> Site {
        "shop.example".to_string()
    }

    fn loss(epsilon: f64, l1_norm: Option<u64>) -> ConversionLoss {
        ConversionLoss {
            epsilon,
            value: 100,
            max_value: 100,
            l1_norm,
        }
    }

    #[test]
    fn test_first_use_gets_configured_budget_plus_slack() {
        let mut ledger = PrivacyBudgetLedger::new(1_000_000);

        // L1 = value and epsilon = 1 spend exactly half an epsilon.
        let status = ledger.try_deduct(&site(), 0, &loss(1.0, Some(100)));
        assert_eq!(status, LedgerStatus::Continue);
        assert_eq!(
            ledger.entries()[&(site(), 0)].remaining_micro_epsilons,
            501_000
        );
    }

    #[test]
    fn test_worst_case_sensitivity_doubles_the_charge() {
        let mut ledger = PrivacyBudgetLedger::new(2_000_000);

        let status = ledger.try_deduct(&site(), 0, &loss(1.0, None));
        assert_eq!(status, LedgerStatus::Continue);
        assert_eq!(
            ledger.entries()[&(site(), 0)].remaining_micro_epsilons,
            1_001_000
        );
    }

    #[test]
    fn test_unpayable_deduction_zeroizes_the_cell() {
        let mut ledger = PrivacyBudgetLedger::new(500);

        let status = ledger.try_deduct(&site(), 0, &loss(2.0, Some(100)));
        assert_eq!(status, LedgerStatus::OutOfBudget);
        assert_eq!(
            ledger.entries()[&(site(), 0)].remaining_micro_epsilons,
            0
        );

        // Even a free-looking follow-up stays rejected once the cell is
        // empty, unless it costs nothing.
        let status = ledger.try_deduct(&site(), 0, &loss(2.0, Some(100)));
        assert_eq!(status, LedgerStatus::OutOfBudget);
    }

    #[test]
    fn test_epsilon_cap_rejects_oversized_queries() {
        let mut ledger = PrivacyBudgetLedger::new(u64::MAX / 2);

        let oversized = ConversionLoss {
            epsilon: 30.0,
            value: 100,
            max_value: 100,
            l1_norm: None,
        };
        // 2·value / (2·max_value / 30) = 30 > MAX_CONVERSION_EPSILON.
        let status = ledger.try_deduct(&site(), 0, &oversized);
        assert_eq!(status, LedgerStatus::OutOfBudget);
        assert_eq!(
            ledger.entries()[&(site(), 0)].remaining_micro_epsilons,
            0
        );
    }

    #[test]
    fn test_cells_are_independent_per_site_and_epoch() {
        let mut ledger = PrivacyBudgetLedger::new(1_000_000);
        let other = "blog.example".to_string();

        ledger.zero_entry(&site(), 0);
        assert_eq!(
            ledger.try_deduct(&site(), 1, &loss(1.0, Some(100))),
            LedgerStatus::Continue
        );
        assert_eq!(
            ledger.try_deduct(&other, 0, &loss(1.0, Some(100))),
            LedgerStatus::Continue
        );
    }

    #[test]
    fn test_forget_site_drops_only_that_site() {
        let mut ledger = PrivacyBudgetLedger::new(1_000_000);
        let other = "blog.example".to_string();
        ledger.zero_entry(&site(), 0);
        ledger.zero_entry(&other, 0);

        ledger.forget_site(&site());
        assert!(!ledger.entries().contains_key(&(site(), 0)));
        assert!(ledger.entries().contains_key(&(other.clone(), 0)));
    }
}

use std::time::Duration;

use serde::Serialize;

use crate::util::shared_types::MILLIS_PER_DAY;

pub const DEFAULT_MATCH_VALUE: u64 = 0;
pub const DEFAULT_LIFETIME_DAYS: u64 = 30;
pub const DEFAULT_PRIORITY: i32 = 0;
pub const DEFAULT_EPSILON: f64 = 1.0;
pub const DEFAULT_VALUE: u64 = 1;
pub const DEFAULT_MAX_VALUE: u64 = 1;

/// Engine configuration, fixed at construction.
#[derive(Debug, Clone, Serialize)]
pub struct BackendConfig {
    /// Cap on `conversion_sites` entries per saved impression.
    pub max_conversion_sites_per_impression: usize,

    /// Cap on `conversion_callers` entries per saved impression.
    pub max_conversion_callers_per_impression: usize,

    /// Cap on the length of a conversion's credit vector.
    pub max_credit_size: usize,

    /// Upper bound for requested lookbacks and impression lifetimes.
    pub max_lookback_days: u64,

    /// Upper bound for histogram sizes and impression indices.
    pub max_histogram_size: u64,

    /// Per-(site, epoch) privacy budget, in micro-epsilons.
    pub privacy_budget_micro_epsilons: u64,

    /// Length of one privacy epoch.
    pub privacy_budget_epoch: Duration,

    /// Test/debug toggle: also return the plaintext histogram from
    /// `measure_conversion`.
    pub include_unencrypted_histogram: bool,
}

impl BackendConfig {
    pub fn max_lookback_millis(&self) -> i64 {
        self.max_lookback_days as i64 * MILLIS_PER_DAY
    }

    pub fn epoch_period_millis(&self) -> i64 {
        self.privacy_budget_epoch.as_millis() as i64
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_conversion_sites_per_impression: 100,
            max_conversion_callers_per_impression: 100,
            max_credit_size: 100,
            max_lookback_days: 30,
            max_histogram_size: 2048,
            privacy_budget_micro_epsilons: 1_000_000,
            privacy_budget_epoch: Duration::from_secs(7 * 24 * 60 * 60),
            include_unencrypted_histogram: false,
        }
    }
}

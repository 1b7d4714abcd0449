//! Sample mock values and collaborators to reduce boilerplate in tests.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use crate::{
    backend::{
        config::BackendConfig,
        service::AttributionBackend,
        traits::{
            Clock, PlainEncryptor, RandomSource, RegistrableSiteCanonicalizer,
        },
    },
    impressions::impression::ImpressionOptions,
    queries::conversion::{AggregationService, ConversionOptions},
    util::shared_types::Timestamp,
};

/// Controllable clock. Clones share the same instant, so tests can keep a
/// handle and advance time while the backend owns its copy.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Rc<Cell<Timestamp>>,
}

impl MockClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Rc::new(Cell::new(now)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.set(now);
    }

    pub fn advance(&self, millis: i64) {
        self.now.set(self.now.get() + millis);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Timestamp {
        self.now.get()
    }
}

/// Scripted random source: returns the queued values in order, then the
/// fallback. Clones share the queue and the draw counter.
#[derive(Debug, Clone)]
pub struct MockRng {
    values: Rc<RefCell<VecDeque<f64>>>,
    fallback: f64,
    draws: Rc<Cell<usize>>,
}

impl MockRng {
    pub fn new(values: Vec<f64>) -> Self {
        Self::with_fallback(values, 0.0)
    }

    pub fn with_fallback(values: Vec<f64>, fallback: f64) -> Self {
        Self {
            values: Rc::new(RefCell::new(values.into())),
            fallback,
            draws: Rc::new(Cell::new(0)),
        }
    }

    pub fn push(&self, value: f64) {
        self.values.borrow_mut().push_back(value);
    }

    /// Number of values handed out so far.
    pub fn draws(&self) -> usize {
        self.draws.get()
    }
}

impl RandomSource for MockRng {
    fn random(&mut self) -> f64 {
        self.draws.set(self.draws.get() + 1);
        self.values.borrow_mut().pop_front().unwrap_or(self.fallback)
    }
}

/// Backend wired with mock collaborators.
pub type MockBackend = AttributionBackend<
    MockClock,
    MockRng,
    PlainEncryptor,
    RegistrableSiteCanonicalizer,
>;

impl BackendConfig {
    /// Sample configuration for testing: weekly epochs and plaintext
    /// histograms in the result.
    pub fn mock() -> Self {
        Self {
            max_conversion_sites_per_impression: 10,
            max_conversion_callers_per_impression: 10,
            max_credit_size: 8,
            max_lookback_days: 30,
            max_histogram_size: 64,
            privacy_budget_micro_epsilons: 1_000_000,
            privacy_budget_epoch: Duration::from_secs(7 * 24 * 60 * 60),
            include_unencrypted_histogram: true,
        }
    }
}

impl ImpressionOptions {
    /// Sample impression options for testing.
    pub fn mock() -> Self {
        Self {
            histogram_index: 0,
            ..Default::default()
        }
    }
}

impl ConversionOptions {
    /// Sample conversion options for testing.
    pub fn mock() -> Self {
        Self {
            aggregation_service: "https://aggregator.example/".to_string(),
            histogram_size: 5,
            epsilon: Some(1.0),
            value: Some(100),
            max_value: Some(100),
            ..Default::default()
        }
    }
}

/// Sample aggregation service map for testing. Keys are in normal form.
pub fn mock_aggregation_services() -> HashMap<String, AggregationService> {
    HashMap::from([(
        "https://aggregator.example/".to_string(),
        AggregationService {
            protocol: "dap-12-histogram".to_string(),
        },
    )])
}

/// Backend with mock collaborators at `t = 0`, plus handles to its clock
/// and rng. The rng falls back to 0.0, pinning epoch origins to the first
/// instant a site is seen.
pub fn mock_backend() -> (MockBackend, MockClock, MockRng) {
    let clock = MockClock::new(0);
    let rng = MockRng::new(vec![]);
    let backend = AttributionBackend::new(
        BackendConfig::mock(),
        mock_aggregation_services(),
        clock.clone(),
        rng.clone(),
        PlainEncryptor,
        RegistrableSiteCanonicalizer,
    )
    .expect("mock backend construction");
    (backend, clock, rng)
}

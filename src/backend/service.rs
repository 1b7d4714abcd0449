use std::collections::HashMap;

use log::{debug, info};
use url::Url;

use crate::{
    backend::{
        config::{
            BackendConfig, DEFAULT_LIFETIME_DAYS, DEFAULT_MATCH_VALUE,
            DEFAULT_PRIORITY,
        },
        traits::{
            canonicalize_site, Clock, Encryptor, RandomSource,
            SiteCanonicalizer,
        },
    },
    budget::ledger::{
        BudgetEntry, ConversionLoss, LedgerStatus, PrivacyBudgetLedger,
    },
    epochs::oracle::EpochOracle,
    error::AttributionError,
    impressions::{
        impression::{Impression, ImpressionOptions},
        store::ImpressionStore,
    },
    queries::{
        allocator::{
            fairly_allocate_credit, fill_histogram, rank_impressions,
        },
        conversion::{
            AggregationService, ConversionOptions, ConversionReport,
            ConversionRequest,
        },
        matcher::RelevantImpressionSelector,
    },
    util::shared_types::{EpochIndex, Site, Timestamp, MILLIS_PER_DAY},
};

/// The attribution measurement engine.
///
/// Single-threaded and synchronous: every entry point takes `&mut self`
/// and runs to completion, so invariants hold between calls and the host
/// is responsible for serializing access per profile.
pub struct AttributionBackend<C, R, E, S> {
    config: BackendConfig,
    aggregation_services: HashMap<String, AggregationService>,

    clock: C,
    rng: R,
    encryptor: E,
    canonicalizer: S,

    store: ImpressionStore,
    oracle: EpochOracle,
    ledger: PrivacyBudgetLedger,

    enabled: bool,
    last_browsing_history_clear: Option<Timestamp>,
}

impl<C, R, E, S> AttributionBackend<C, R, E, S>
where
    C: Clock,
    R: RandomSource,
    E: Encryptor,
    S: SiteCanonicalizer,
{
    /// Builds the engine. Every aggregation service key must already be a
    /// normalized URL; anything else is a construction-time error.
    pub fn new(
        config: BackendConfig,
        aggregation_services: HashMap<String, AggregationService>,
        clock: C,
        rng: R,
        encryptor: E,
        canonicalizer: S,
    ) -> Result<Self, AttributionError> {
        for key in aggregation_services.keys() {
            let url = Url::parse(key).map_err(|e| {
                AttributionError::InvalidSyntax(format!(
                    "aggregation service key {key:?}: {e}"
                ))
            })?;
            if url.as_str() != key {
                return Err(AttributionError::InvalidSyntax(format!(
                    "aggregation service key {key:?} is not in normal form \
                     (expected {:?})",
                    url.as_str()
                )));
            }
        }

        let oracle = EpochOracle::new(config.epoch_period_millis());
        let ledger =
            PrivacyBudgetLedger::new(config.privacy_budget_micro_epsilons);
        Ok(Self {
            config,
            aggregation_services,
            clock,
            rng,
            encryptor,
            canonicalizer,
            store: ImpressionStore::new(),
            oracle,
            ledger,
            enabled: true,
            last_browsing_history_clear: None,
        })
    }

    /// Records an impression shown on `impression_site`. When measurement
    /// is disabled the inputs are still validated but nothing is stored.
    pub fn save_impression(
        &mut self,
        impression_site: &str,
        intermediary_site: Option<&str>,
        options: ImpressionOptions,
    ) -> Result<(), AttributionError> {
        let impression_site =
            canonicalize_site(&self.canonicalizer, impression_site)?;
        let intermediary_site = intermediary_site
            .map(|site| canonicalize_site(&self.canonicalizer, site))
            .transpose()?;

        if options.histogram_index >= self.config.max_histogram_size {
            return Err(AttributionError::OutOfRange(format!(
                "histogram_index {} not below {}",
                options.histogram_index, self.config.max_histogram_size
            )));
        }
        if options.conversion_sites.len()
            > self.config.max_conversion_sites_per_impression
        {
            return Err(AttributionError::OutOfRange(format!(
                "{} conversion sites exceed the cap of {}",
                options.conversion_sites.len(),
                self.config.max_conversion_sites_per_impression
            )));
        }
        if options.conversion_callers.len()
            > self.config.max_conversion_callers_per_impression
        {
            return Err(AttributionError::OutOfRange(format!(
                "{} conversion callers exceed the cap of {}",
                options.conversion_callers.len(),
                self.config.max_conversion_callers_per_impression
            )));
        }

        let conversion_sites = options
            .conversion_sites
            .iter()
            .map(|site| canonicalize_site(&self.canonicalizer, site))
            .collect::<Result<_, _>>()?;
        let conversion_callers = options
            .conversion_callers
            .iter()
            .map(|site| canonicalize_site(&self.canonicalizer, site))
            .collect::<Result<_, _>>()?;

        let lifetime_days =
            options.lifetime_days.unwrap_or(DEFAULT_LIFETIME_DAYS);
        if lifetime_days == 0 {
            return Err(AttributionError::OutOfRange(
                "lifetime_days must be positive".to_string(),
            ));
        }
        let lifetime = lifetime_days.min(self.config.max_lookback_days) as i64
            * MILLIS_PER_DAY;

        if !self.enabled {
            debug!("Measurement disabled, dropping impression");
            return Ok(());
        }

        let impression = Impression {
            id: 0, // assigned by the store
            impression_site,
            intermediary_site,
            conversion_sites,
            conversion_callers,
            match_value: options.match_value.unwrap_or(DEFAULT_MATCH_VALUE),
            timestamp: self.clock.now(),
            lifetime,
            histogram_index: options.histogram_index,
            priority: options.priority.unwrap_or(DEFAULT_PRIORITY),
        };
        debug!("Saving impression {impression:?}");
        self.store.append(impression);
        Ok(())
    }

    /// Attributes a conversion on `top_level_site` and returns the sealed
    /// histogram report. Budget exhaustion never fails the call; it
    /// degrades the histogram to zeros.
    pub fn measure_conversion(
        &mut self,
        top_level_site: &str,
        intermediary_site: Option<&str>,
        options: ConversionOptions,
    ) -> Result<ConversionReport, AttributionError> {
        let request = ConversionRequest::new(
            options,
            &self.config,
            &self.aggregation_services,
            &self.canonicalizer,
        )?;
        let top_level_site =
            canonicalize_site(&self.canonicalizer, top_level_site)?;
        let conversion_caller = match intermediary_site {
            Some(site) => canonicalize_site(&self.canonicalizer, site)?,
            None => top_level_site.clone(),
        };

        if !self.enabled {
            debug!("Measurement disabled, returning null histogram");
            return self.seal_report(vec![0; request.histogram_size]);
        }

        let now = self.clock.now();
        debug!(
            "Measuring conversion on {top_level_site} (caller \
             {conversion_caller}) at {now}: {request:?}"
        );

        let current_epoch =
            self.oracle
                .epoch_index(&top_level_site, now, &mut self.rng)?;
        let earliest_epoch = self.oracle.epoch_index(
            &top_level_site,
            now - request.lookback,
            &mut self.rng,
        )?;

        // Filter first, then bucket survivors by the epoch their timestamp
        // falls in under the converting site's origin.
        let matched: Vec<Impression> = {
            let selector = RelevantImpressionSelector {
                now,
                top_level_site: &top_level_site,
                conversion_caller: &conversion_caller,
                request: &request,
            };
            self.store
                .iter()
                .filter(|impression| {
                    selector.is_relevant_impression(impression)
                })
                .cloned()
                .collect()
        };
        let mut matched_by_epoch: HashMap<EpochIndex, Vec<Impression>> =
            HashMap::new();
        for impression in matched {
            let epoch = self.oracle.epoch_index(
                &top_level_site,
                impression.timestamp,
                &mut self.rng,
            )?;
            matched_by_epoch.entry(epoch).or_default().push(impression);
        }

        let single_epoch = current_epoch == earliest_epoch;
        let mut pool: Vec<Impression> = Vec::new();
        if single_epoch {
            // The deduction happens after the histogram is known, with its
            // observed L1-norm as sensitivity.
            pool = matched_by_epoch.remove(&current_epoch).unwrap_or_default();
        } else {
            // Each epoch pays the worst case up front; the final histogram
            // is not known while gathering.
            let start_epoch = self.oracle.start_epoch(
                &top_level_site,
                now,
                self.config.max_lookback_millis(),
                self.last_browsing_history_clear,
                &mut self.rng,
            )?;
            for epoch in start_epoch..=current_epoch {
                let Some(matches) = matched_by_epoch.remove(&epoch) else {
                    continue;
                };
                let loss = ConversionLoss {
                    epsilon: request.epsilon,
                    value: request.value,
                    max_value: request.max_value,
                    l1_norm: None,
                };
                match self.ledger.try_deduct(&top_level_site, epoch, &loss) {
                    LedgerStatus::Continue => pool.extend(matches),
                    LedgerStatus::OutOfBudget => {
                        debug!("Dropping epoch {epoch}: out of budget");
                    }
                }
            }
        }

        if pool.is_empty() {
            debug!("No matching impressions survived");
            return self.seal_report(vec![0; request.histogram_size]);
        }

        let ranked = rank_impressions(pool, request.credit.len());
        let allocated = fairly_allocate_credit(
            &request.credit[..ranked.len()],
            request.value,
            &mut self.rng,
        )?;
        let histogram = fill_histogram(
            &ranked,
            &allocated,
            request.histogram_size,
            request.value,
        )?;

        if single_epoch {
            let loss = ConversionLoss {
                epsilon: request.epsilon,
                value: request.value,
                max_value: request.max_value,
                l1_norm: Some(histogram.iter().sum()),
            };
            if self.ledger.try_deduct(&top_level_site, current_epoch, &loss)
                == LedgerStatus::OutOfBudget
            {
                debug!("Out of budget in epoch {current_epoch}");
                return self.seal_report(vec![0; request.histogram_size]);
            }
        }

        self.seal_report(histogram)
    }

    /// Removes impressions attributable to `site`, as on navigation away
    /// from it. See `ImpressionStore::clear_site` for the removal clauses.
    pub fn clear_impressions_for_site(
        &mut self,
        site: &str,
    ) -> Result<(), AttributionError> {
        let site = canonicalize_site(&self.canonicalizer, site)?;
        debug!("Clearing impressions for site {site}");
        self.store.clear_site(&site);
        Ok(())
    }

    /// Clears browsing state.
    ///
    /// Without `forget_visits`, zeroes the budget of every attributable
    /// epoch of the given sites (which must be non-empty), leaving
    /// impressions and epoch origins alone. With `forget_visits`, drops
    /// impressions, budget, and epoch origins - for the given sites, or
    /// wholesale when `sites` is empty - and starts the post-clear
    /// quarantine.
    pub fn clear_state(
        &mut self,
        sites: &[String],
        forget_visits: bool,
    ) -> Result<(), AttributionError> {
        if !forget_visits && sites.is_empty() {
            return Err(AttributionError::OutOfRange(
                "clearState without forget_visits needs at least one site"
                    .to_string(),
            ));
        }
        let sites = sites
            .iter()
            .map(|site| canonicalize_site(&self.canonicalizer, site))
            .collect::<Result<Vec<Site>, _>>()?;
        let now = self.clock.now();

        if !forget_visits {
            for site in &sites {
                let current = self.oracle.epoch_index(site, now, &mut self.rng)?;
                let start = self.oracle.start_epoch(
                    site,
                    now,
                    self.config.max_lookback_millis(),
                    self.last_browsing_history_clear,
                    &mut self.rng,
                )?;
                for epoch in start..=current {
                    self.ledger.zero_entry(site, epoch);
                }
            }
            info!("Zeroed privacy budget for {} sites", sites.len());
            return Ok(());
        }

        if sites.is_empty() {
            self.store.clear();
            self.ledger.clear();
            self.oracle.clear();
            info!("Forgot all attribution state");
        } else {
            self.store
                .retain(|impression| !sites.contains(&impression.impression_site));
            for site in &sites {
                self.ledger.forget_site(site);
                self.oracle.forget_site(site);
            }
            info!("Forgot attribution state for {} sites", sites.len());
        }
        self.last_browsing_history_clear = Some(now);
        Ok(())
    }

    /// Drops impressions whose lifetime has elapsed.
    pub fn clear_expired_impressions(&mut self) {
        let now = self.clock.now();
        self.store.clear_expired(now);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        info!("Attribution measurement enabled: {enabled}");
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn impressions(&self) -> &[Impression] {
        self.store.as_slice()
    }

    pub fn privacy_budget_entries(
        &self,
    ) -> &HashMap<(Site, EpochIndex), BudgetEntry> {
        self.ledger.entries()
    }

    pub fn epoch_starts(&self) -> &HashMap<Site, Timestamp> {
        self.oracle.epoch_starts()
    }

    pub fn last_browsing_history_clear(&self) -> Option<Timestamp> {
        self.last_browsing_history_clear
    }

    pub fn aggregation_services(
        &self,
    ) -> &HashMap<String, AggregationService> {
        &self.aggregation_services
    }

    fn seal_report(
        &self,
        histogram: Vec<u64>,
    ) -> Result<ConversionReport, AttributionError> {
        let report = self.encryptor.seal(&histogram).map_err(|e| {
            AttributionError::InvalidState(format!("encryptor failed: {e}"))
        })?;
        let unencrypted_histogram =
            self.config.include_unencrypted_histogram.then_some(histogram);
        Ok(ConversionReport {
            report,
            unencrypted_histogram,
        })
    }
}

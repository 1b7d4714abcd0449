use std::collections::{HashMap, HashSet};

use serde::Serialize;
use url::Url;

use crate::{
    backend::{
        config::{
            BackendConfig, DEFAULT_EPSILON, DEFAULT_MAX_VALUE, DEFAULT_VALUE,
        },
        traits::{canonicalize_site, SiteCanonicalizer},
    },
    budget::ledger::MAX_CONVERSION_EPSILON,
    error::AttributionError,
    util::shared_types::{Site, MILLIS_PER_DAY},
};

/// Descriptor for a configured aggregation service, keyed by its
/// normalized URL in the backend's service map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationService {
    /// Protocol the service speaks, e.g. `dap-12-histogram`.
    pub protocol: String,
}

/// Result of `measureConversion`: the sealed report, plus the plaintext
/// histogram when the engine was built with
/// `include_unencrypted_histogram`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub report: Vec<u8>,
    pub unencrypted_histogram: Option<Vec<u64>>,
}

/// Raw options for `measureConversion`, as handed over by the embedder's
/// header parser. Validated into a [`ConversionRequest`] before use.
#[derive(Debug, Clone, Default)]
pub struct ConversionOptions {
    pub aggregation_service: String,
    pub histogram_size: u64,
    pub epsilon: Option<f64>,
    pub lookback_days: Option<u64>,
    pub credit: Option<Vec<f64>>,
    pub value: Option<u64>,
    pub max_value: Option<u64>,
    pub match_values: Vec<u64>,
    pub impression_sites: Vec<String>,
    pub impression_callers: Vec<String>,
}

/// A validated conversion query: defaults applied, sites canonicalized,
/// lookback capped, aggregation service resolved.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub aggregation_service: String,
    pub histogram_size: usize,
    pub epsilon: f64,
    pub lookback: i64,
    pub credit: Vec<f64>,
    pub value: u64,
    pub max_value: u64,
    pub match_values: HashSet<u64>,
    pub impression_sites: HashSet<Site>,
    pub impression_callers: HashSet<Site>,
}

impl ConversionRequest {
    pub fn new<S: SiteCanonicalizer>(
        options: ConversionOptions,
        config: &BackendConfig,
        services: &HashMap<String, AggregationService>,
        sites: &S,
    ) -> Result<Self, AttributionError> {
        if options.histogram_size < 1
            || options.histogram_size > config.max_histogram_size
        {
            return Err(AttributionError::OutOfRange(format!(
                "histogram_size {} not in [1, {}]",
                options.histogram_size, config.max_histogram_size
            )));
        }

        let epsilon = options.epsilon.unwrap_or(DEFAULT_EPSILON);
        if !(epsilon > 0.0 && epsilon <= MAX_CONVERSION_EPSILON) {
            return Err(AttributionError::OutOfRange(format!(
                "epsilon {epsilon} not in (0, {MAX_CONVERSION_EPSILON}]"
            )));
        }

        let lookback_days =
            options.lookback_days.unwrap_or(config.max_lookback_days);
        if lookback_days == 0 {
            return Err(AttributionError::OutOfRange(
                "lookback_days must be positive".to_string(),
            ));
        }
        let lookback_days = lookback_days.min(config.max_lookback_days);

        let credit = options.credit.unwrap_or_else(|| vec![1.0]);
        if credit.is_empty() || credit.len() > config.max_credit_size {
            return Err(AttributionError::OutOfRange(format!(
                "credit length {} not in [1, {}]",
                credit.len(),
                config.max_credit_size
            )));
        }
        if credit.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return Err(AttributionError::OutOfRange(
                "credit entries must be positive and finite".to_string(),
            ));
        }

        let value = options.value.unwrap_or(DEFAULT_VALUE);
        let max_value = options.max_value.unwrap_or(DEFAULT_MAX_VALUE);
        if value == 0 || max_value == 0 || value > max_value {
            return Err(AttributionError::OutOfRange(format!(
                "need 0 < value <= max_value, got value {value}, \
                 max_value {max_value}"
            )));
        }

        let impression_sites = options
            .impression_sites
            .iter()
            .map(|s| canonicalize_site(sites, s))
            .collect::<Result<HashSet<_>, _>>()?;
        let impression_callers = options
            .impression_callers
            .iter()
            .map(|s| canonicalize_site(sites, s))
            .collect::<Result<HashSet<_>, _>>()?;

        let aggregation_service =
            resolve_aggregation_service(&options.aggregation_service, services)?;

        Ok(Self {
            aggregation_service,
            histogram_size: options.histogram_size as usize,
            epsilon,
            lookback: lookback_days as i64 * MILLIS_PER_DAY,
            credit,
            value,
            max_value,
            match_values: options.match_values.into_iter().collect(),
            impression_sites,
            impression_callers,
        })
    }
}

/// Checks that the requested aggregation service URL parses, is already in
/// normal form, and is configured.
fn resolve_aggregation_service(
    requested: &str,
    services: &HashMap<String, AggregationService>,
) -> Result<String, AttributionError> {
    let url = Url::parse(requested).map_err(|e| {
        AttributionError::InvalidSyntax(format!(
            "aggregation service {requested:?}: {e}"
        ))
    })?;
    if url.as_str() != requested {
        return Err(AttributionError::InvalidSyntax(format!(
            "aggregation service {requested:?} is not in normal form \
             (expected {:?})",
            url.as_str()
        )));
    }
    if !services.contains_key(requested) {
        return Err(AttributionError::UnknownReference(requested.to_string()));
    }
    Ok(requested.to_string())
}

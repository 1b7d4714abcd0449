use std::collections::HashSet;

use serde::Serialize;

use crate::util::shared_types::{Site, Timestamp};

/// A stored impression: the record that an ad was shown on
/// `impression_site`, possibly on behalf of an intermediary.
///
/// Immutable after creation, except that `clearImpressionsForSite` may
/// narrow the two site sets in place (see `ImpressionStore::clear_site`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Impression {
    /// Store-assigned monotonic identifier. Two impressions never share one.
    pub id: u64,

    /// Site the ad was shown on.
    pub impression_site: Site,

    /// Site that registered the impression on behalf of `impression_site`,
    /// if any.
    pub intermediary_site: Option<Site>,

    /// Sites allowed to convert against this impression. Empty means any.
    pub conversion_sites: HashSet<Site>,

    /// Callers allowed to measure conversions against this impression.
    /// Empty means any.
    pub conversion_callers: HashSet<Site>,

    /// Caller-chosen tag matched against a conversion's `match_values`.
    pub match_value: u64,

    /// Instant the impression was saved.
    pub timestamp: Timestamp,

    /// How long the impression stays eligible for matching, in
    /// milliseconds. Capped at the configured maximum lookback at save
    /// time.
    pub lifetime: i64,

    /// Histogram slot credited on attribution.
    pub histogram_index: u64,

    /// Ranking priority; higher wins over recency.
    pub priority: i32,
}

impl Impression {
    /// The site acting for this impression: the intermediary when present,
    /// the impression site otherwise.
    pub fn impression_caller(&self) -> &Site {
        self.intermediary_site.as_ref().unwrap_or(&self.impression_site)
    }

    pub fn expires_at(&self) -> Timestamp {
        self.timestamp + self.lifetime
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at()
    }
}

/// Raw options for `saveImpression`, as handed over by the embedder's
/// header parser. Site strings are canonicalized and defaults applied
/// during validation.
#[derive(Debug, Clone, Default)]
pub struct ImpressionOptions {
    pub histogram_index: u64,
    pub match_value: Option<u64>,
    pub conversion_sites: Vec<String>,
    pub conversion_callers: Vec<String>,
    pub lifetime_days: Option<u64>,
    pub priority: Option<i32>,
}

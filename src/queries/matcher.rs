use crate::{
    impressions::impression::Impression,
    queries::conversion::ConversionRequest,
    util::shared_types::{Site, Timestamp},
};

/// Decides which stored impressions are relevant for one conversion
/// query. Epoch membership (the impression's epoch under the converting
/// site's origin) is checked by the caller, which buckets survivors by
/// epoch.
#[derive(Debug)]
pub struct RelevantImpressionSelector<'a> {
    pub now: Timestamp,
    pub top_level_site: &'a Site,
    /// The site receiving the report: the intermediary when present, the
    /// top-level site otherwise.
    pub conversion_caller: &'a Site,
    pub request: &'a ConversionRequest,
}

impl RelevantImpressionSelector<'_> {
    /// All conditions must hold; empty filter sets are unconstrained.
    pub fn is_relevant_impression(&self, impression: &Impression) -> bool {
        // Condition 1: still alive.
        let alive = !impression.is_expired(self.now);

        // Condition 2: inside the requested lookback window.
        let in_window =
            self.now <= impression.timestamp + self.request.lookback;

        // Condition 3: the impression allows this conversion site.
        let site_allowed = impression.conversion_sites.is_empty()
            || impression.conversion_sites.contains(self.top_level_site);

        // Condition 4: the impression allows this conversion caller.
        let caller_allowed = impression.conversion_callers.is_empty()
            || impression.conversion_callers.contains(self.conversion_caller);

        // Conditions 5-7: the query's own filters.
        let value_match = self.request.match_values.is_empty()
            || self.request.match_values.contains(&impression.match_value);
        let source_match = self.request.impression_sites.is_empty()
            || self
                .request
                .impression_sites
                .contains(&impression.impression_site);
        let source_caller_match = self.request.impression_callers.is_empty()
            || self
                .request
                .impression_callers
                .contains(impression.impression_caller());

        alive
            && in_window
            && site_allowed
            && caller_allowed
            && value_match
            && source_match
            && source_caller_match
    }
}

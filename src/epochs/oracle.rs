use std::collections::HashMap;

use log::debug;

use crate::{
    backend::traits::{draw_unit, RandomSource},
    error::AttributionError,
    util::shared_types::{EpochIndex, Site, Timestamp},
};

/// Maps (site, instant) pairs to privacy epoch indices.
///
/// Each site gets its own epoch origin, drawn uniformly from the epoch
/// period preceding the site's first use so that rollovers are not
/// globally observable. Once sampled, an origin is stable until the site's
/// state is forgotten.
#[derive(Debug)]
pub struct EpochOracle {
    period: i64,
    epoch_starts: HashMap<Site, Timestamp>,
}

impl EpochOracle {
    pub fn new(period_ms: i64) -> Self {
        debug_assert!(period_ms > 0);
        Self {
            period: period_ms,
            epoch_starts: HashMap::new(),
        }
    }

    /// Epoch index of instant `at` under `site`'s origin, sampling the
    /// origin on first use. Instants before the origin map to negative
    /// indices.
    pub fn epoch_index<R: RandomSource>(
        &mut self,
        site: &Site,
        at: Timestamp,
        rng: &mut R,
    ) -> Result<EpochIndex, AttributionError> {
        let start = match self.epoch_starts.get(site) {
            Some(start) => *start,
            None => {
                let offset = draw_unit(rng)? * self.period as f64;
                let start = at - offset as i64;
                debug!("Sampled epoch origin {start} for site {site}");
                self.epoch_starts.insert(site.clone(), start);
                start
            }
        };
        Ok((at - start).div_euclid(self.period))
    }

    /// First epoch a conversion on `site` may attribute from: the epoch of
    /// `now − max_lookback`, pushed forward past the two-epoch quarantine
    /// that follows a browsing-history clear.
    pub fn start_epoch<R: RandomSource>(
        &mut self,
        site: &Site,
        now: Timestamp,
        max_lookback: i64,
        last_browsing_history_clear: Option<Timestamp>,
        rng: &mut R,
    ) -> Result<EpochIndex, AttributionError> {
        let earliest = self.epoch_index(site, now - max_lookback, rng)?;
        match last_browsing_history_clear {
            None => Ok(earliest),
            Some(cleared_at) => {
                let clear_epoch = self.epoch_index(site, cleared_at, rng)?;
                Ok(earliest.max(clear_epoch + 2))
            }
        }
    }

    pub fn epoch_starts(&self) -> &HashMap<Site, Timestamp> {
        &self.epoch_starts
    }

    /// Forgets `site`'s origin; the next use resamples it.
    pub fn forget_site(&mut self, site: &Site) {
        self.epoch_starts.remove(site);
    }

    pub fn clear(&mut self) {
        self.epoch_starts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::tests::MockRng;

    const PERIOD: i64 = 1_000;

    #[test]
    fn test_origin_sampled_once_and_stable() {
        let mut oracle = EpochOracle::new(PERIOD);
        let mut rng = MockRng::new(vec![0.5, 0.9]);
        let site = "a.example".to_string();

        assert_eq!(oracle.epoch_index(&site, 10_000, &mut rng).unwrap(), 0);
        assert_eq!(oracle.epoch_starts()[&site], 9_500);

        // Later instants reuse the same origin; the second rng value is
        // never consumed.
        assert_eq!(oracle.epoch_index(&site, 10_499, &mut rng).unwrap(), 0);
        assert_eq!(oracle.epoch_index(&site, 10_500, &mut rng).unwrap(), 1);
        assert_eq!(oracle.epoch_starts()[&site], 9_500);
    }

    #[test]
    fn test_pre_origin_instants_map_to_negative_epochs() {
        let mut oracle = EpochOracle::new(PERIOD);
        let mut rng = MockRng::new(vec![0.0]);
        let site = "a.example".to_string();

        assert_eq!(oracle.epoch_index(&site, 10_000, &mut rng).unwrap(), 0);
        assert_eq!(oracle.epoch_index(&site, 9_999, &mut rng).unwrap(), -1);
        assert_eq!(oracle.epoch_index(&site, 8_000, &mut rng).unwrap(), -2);
    }

    #[test]
    fn test_start_epoch_without_clear_is_lookback_epoch() {
        let mut oracle = EpochOracle::new(PERIOD);
        let mut rng = MockRng::new(vec![0.0]);
        let site = "a.example".to_string();

        let start = oracle
            .start_epoch(&site, 10_000, 3 * PERIOD, None, &mut rng)
            .unwrap();
        assert_eq!(start, -3);
    }

    #[test]
    fn test_start_epoch_applies_two_epoch_quarantine() {
        let mut oracle = EpochOracle::new(PERIOD);
        let mut rng = MockRng::new(vec![0.0]);
        let site = "a.example".to_string();

        // Origin gets sampled at the first instant seen, here the lookback
        // bound 7_000. The clear at 10_000 lands in epoch 3, so the
        // quarantine pushes the start to 5, past the lookback epoch 0.
        let start = oracle
            .start_epoch(&site, 10_000, 3 * PERIOD, Some(10_000), &mut rng)
            .unwrap();
        assert_eq!(start, 5);
    }

    #[test]
    fn test_forget_site_resamples_origin() {
        let mut oracle = EpochOracle::new(PERIOD);
        let mut rng = MockRng::new(vec![0.0, 0.5]);
        let site = "a.example".to_string();

        oracle.epoch_index(&site, 10_000, &mut rng).unwrap();
        assert_eq!(oracle.epoch_starts()[&site], 10_000);

        oracle.forget_site(&site);
        oracle.epoch_index(&site, 10_000, &mut rng).unwrap();
        assert_eq!(oracle.epoch_starts()[&site], 9_500);
    }
}

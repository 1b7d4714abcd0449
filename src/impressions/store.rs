use log::debug;

use crate::{
    impressions::impression::Impression,
    util::shared_types::{Site, Timestamp},
};

/// Append-only in-memory impression log.
///
/// Iteration order is arrival order; matching relies on it being stable.
/// Removal happens only through the filtered-erase operations below.
#[derive(Debug, Default)]
pub struct ImpressionStore {
    impressions: Vec<Impression>,
    next_id: u64,
}

impl ImpressionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an impression, assigning it a fresh identifier. No
    /// deduplication: saving the same content twice stores two impressions.
    pub fn append(&mut self, mut impression: Impression) {
        impression.id = self.next_id;
        self.next_id += 1;
        self.impressions.push(impression);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Impression> {
        self.impressions.iter()
    }

    pub fn as_slice(&self) -> &[Impression] {
        &self.impressions
    }

    pub fn len(&self) -> usize {
        self.impressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.impressions.is_empty()
    }

    /// Filtered erase, keeping impressions for which `keep` returns true.
    pub fn retain(&mut self, keep: impl FnMut(&Impression) -> bool) {
        self.impressions.retain(keep);
    }

    /// Drops impressions whose lifetime has elapsed.
    pub fn clear_expired(&mut self, now: Timestamp) {
        let before = self.impressions.len();
        self.impressions.retain(|impression| !impression.is_expired(now));
        let dropped = before - self.impressions.len();
        if dropped > 0 {
            debug!("Cleared {dropped} expired impressions");
        }
    }

    /// Removes everything attributable to `site`, as on a cross-site
    /// navigation away from it. An impression is dropped when:
    /// - it was shown on `site` with no intermediary, or
    /// - `site` was the intermediary, or
    /// - `site` was the only remaining allowed conversion site or caller.
    ///
    /// Deleting `site` from a still-non-empty set narrows the stored
    /// impression in place instead of dropping it.
    pub fn clear_site(&mut self, site: &Site) {
        self.impressions.retain_mut(|impression| {
            if impression.intermediary_site.is_none()
                && impression.impression_site == *site
            {
                return false;
            }
            if impression.intermediary_site.as_ref() == Some(site) {
                return false;
            }
            if impression.conversion_sites.contains(site) {
                if impression.conversion_sites.len() == 1 {
                    return false;
                }
                impression.conversion_sites.remove(site);
            }
            if impression.conversion_callers.contains(site) {
                if impression.conversion_callers.len() == 1 {
                    return false;
                }
                impression.conversion_callers.remove(site);
            }
            true
        });
    }

    pub fn clear(&mut self) {
        self.impressions.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn impression(site: &str) -> Impression {
        Impression {
            id: 0,
            impression_site: site.to_string(),
            intermediary_site: None,
            conversion_sites: HashSet::new(),
            conversion_callers: HashSet::new(),
            match_value: 0,
            timestamp: 0,
            lifetime: 1_000,
            histogram_index: 0,
            priority: 0,
        }
    }

    #[test]
    fn test_append_assigns_distinct_ids() {
        let mut store = ImpressionStore::new();
        store.append(impression("a.example"));
        store.append(impression("a.example"));

        let ids: Vec<u64> = store.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_clear_site_drops_direct_impression() {
        let mut store = ImpressionStore::new();
        store.append(impression("a.example"));
        store.append(impression("b.example"));

        store.clear_site(&"a.example".to_string());
        assert_eq!(store.len(), 1);
        assert_eq!(store.iter().next().unwrap().impression_site, "b.example");
    }

    #[test]
    fn test_clear_site_keeps_intermediated_impression() {
        // An impression shown on a.example through an intermediary is not
        // attributable to a.example alone.
        let mut store = ImpressionStore::new();
        let mut with_intermediary = impression("a.example");
        with_intermediary.intermediary_site = Some("adtech.example".to_string());
        store.append(with_intermediary);

        store.clear_site(&"a.example".to_string());
        assert_eq!(store.len(), 1);

        store.clear_site(&"adtech.example".to_string());
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_site_narrows_conversion_sites_in_place() {
        let mut store = ImpressionStore::new();
        let mut constrained = impression("blog.example");
        constrained.conversion_sites =
            ["shop.example".to_string(), "store.example".to_string()].into();
        store.append(constrained);

        store.clear_site(&"shop.example".to_string());
        assert_eq!(store.len(), 1);
        let remaining = &store.iter().next().unwrap().conversion_sites;
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains("store.example"));

        // Removing the last allowed site drops the impression.
        store.clear_site(&"store.example".to_string());
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_expired_is_idempotent() {
        let mut store = ImpressionStore::new();
        store.append(impression("a.example")); // expires at 1_000
        let mut fresh = impression("b.example");
        fresh.lifetime = 5_000;
        store.append(fresh);

        store.clear_expired(2_000);
        assert_eq!(store.len(), 1);
        store.clear_expired(2_000);
        assert_eq!(store.len(), 1);
    }
}

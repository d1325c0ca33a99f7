//! User filter contract and search-strategy selection.
//!
//! A filter admits or rejects points by external id and declares an
//! estimated valid ratio. The ratio drives strategy only: a highly
//! selective filter routes the query to a brute-force scan, a moderately
//! selective one inflates the graph search's frontier. Correctness never
//! depends on the estimate.

use crate::config;

/// Predicate over external ids, with a selectivity hint.
pub trait Filter: Send + Sync {
    /// Whether the point with this external id may appear in results.
    fn check_valid(&self, external_id: i64) -> bool;

    /// Estimated fraction of points admitted, in \[0, 1\].
    fn valid_ratio(&self) -> f32 {
        1.0
    }
}

impl<F> Filter for F
where
    F: Fn(i64) -> bool + Send + Sync,
{
    fn check_valid(&self, external_id: i64) -> bool {
        self(external_id)
    }
}

/// Internal-id view of a user filter.
pub(crate) struct FilterAdaptor<'a> {
    filter: &'a dyn Filter,
    external_ids: &'a [i64],
}

impl<'a> FilterAdaptor<'a> {
    pub(crate) fn new(filter: &'a dyn Filter, external_ids: &'a [i64]) -> Self {
        Self {
            filter,
            external_ids,
        }
    }

    #[inline]
    pub(crate) fn admits(&self, internal: u32) -> bool {
        self.filter.check_valid(self.external_ids[internal as usize])
    }
}

/// How a (possibly filtered) query will be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchStrategy {
    /// Beam search over the graph with the given effective frontier size.
    Graph { ef_effective: usize },
    /// Linear scan of all ids through the filter.
    BruteForce,
}

/// Pick the execution strategy for a filtered search.
///
/// Very selective filters (or frontiers that would have to cover most of the
/// index to surface enough admitted points) fall back to brute force;
/// otherwise the frontier is inflated by the inverse of the valid ratio,
/// floored so the inflation stays bounded.
pub(crate) fn select_strategy(valid_ratio: f32, ef: usize, n: usize) -> SearchStrategy {
    if valid_ratio < config::BRUTE_FORCE_VALID_RATIO {
        return SearchStrategy::BruteForce;
    }
    if ef as f32 / valid_ratio > n as f32 {
        return SearchStrategy::BruteForce;
    }
    let ef_effective = (ef as f32 / valid_ratio.max(config::VALID_RATIO_FLOOR)).ceil() as usize;
    SearchStrategy::Graph { ef_effective }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OddFilter;
    impl Filter for OddFilter {
        fn check_valid(&self, external_id: i64) -> bool {
            external_id % 2 != 0
        }
        fn valid_ratio(&self) -> f32 {
            0.5
        }
    }

    #[test]
    fn test_adaptor_maps_internal_to_external() {
        let externals = vec![10, 11, 12, 13];
        let f = OddFilter;
        let adaptor = FilterAdaptor::new(&f, &externals);
        assert!(!adaptor.admits(0));
        assert!(adaptor.admits(1));
        assert!(adaptor.admits(3));
    }

    #[test]
    fn test_closure_filter() {
        let f = |id: i64| id > 5;
        assert!(Filter::check_valid(&f, 6));
        assert!(!Filter::check_valid(&f, 5));
        assert_eq!(Filter::valid_ratio(&f), 1.0);
    }

    #[test]
    fn test_tiny_ratio_goes_brute_force() {
        assert_eq!(select_strategy(0.001, 100, 100_000), SearchStrategy::BruteForce);
    }

    #[test]
    fn test_frontier_covering_index_goes_brute_force() {
        // ef / ratio = 100 / 0.1 = 1000 > 500
        assert_eq!(select_strategy(0.1, 100, 500), SearchStrategy::BruteForce);
    }

    #[test]
    fn test_moderate_ratio_inflates_ef() {
        match select_strategy(0.5, 100, 100_000) {
            SearchStrategy::Graph { ef_effective } => assert_eq!(ef_effective, 200),
            s => panic!("unexpected strategy {s:?}"),
        }
        // ratio below the floor is clamped for inflation purposes
        match select_strategy(0.06, 100, 1_000_000) {
            SearchStrategy::Graph { ef_effective } => assert_eq!(ef_effective, 1000),
            s => panic!("unexpected strategy {s:?}"),
        }
    }
}

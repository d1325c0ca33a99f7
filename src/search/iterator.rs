//! Persistent per-query state for paged filtered search.
//!
//! An [`IteratorContext`] is created empty by the caller, handed to every
//! page of the same query, and dropped when the caller stops paging.
//! Between pages it carries: a bounded max-heap of discarded candidates
//! (results evicted from the top-k heap plus the unexpanded frontier), a
//! bitmap of ids already returned, a per-id visit counter (diagnostic), and
//! a distance cache so reseeded candidates are never recomputed.
//!
//! The context is bound to the query vector it first ran with; reusing it
//! with a different query or a mutated index is rejected instead of
//! silently returning garbage. It is not thread-safe; concurrent calls
//! sharing one context are a caller bug the borrow checker already rules
//! out in safe code. If a search using the context returns an error, the
//! context's state is unspecified and it must be dropped.

use crate::config;
use crate::error::{Error, Result};
use crate::search::frontier::Neighbor;
use std::collections::HashMap;

/// Caller-owned state carried across result pages of one query.
#[derive(Debug)]
pub struct IteratorContext {
    discard: Vec<Neighbor>,
    returned: Vec<bool>,
    visit_counts: Vec<u32>,
    inner_distance: HashMap<u32, f32>,
    first_used: bool,
    discard_capacity: usize,
    fingerprint: u64,
}

impl IteratorContext {
    /// An empty, unbound context. The first search that receives it sizes
    /// and binds it.
    pub fn new() -> Self {
        Self {
            discard: Vec::new(),
            returned: Vec::new(),
            visit_counts: Vec::new(),
            inner_distance: HashMap::new(),
            first_used: true,
            discard_capacity: 0,
            fingerprint: 0,
        }
    }

    /// Size the context for an index of `n` points searched with the given
    /// effective `ef`, and bind it to the query fingerprint.
    pub(crate) fn init(&mut self, n: usize, ef: usize, fingerprint: u64) -> Result<()> {
        if ef == 0 {
            return Err(Error::InvalidArgument(
                "iterator context requires ef_search > 0".into(),
            ));
        }
        self.returned
            .try_reserve(n)
            .map_err(|e| Error::alloc("iterator bitmap", e))?;
        self.visit_counts
            .try_reserve(n)
            .map_err(|e| Error::alloc("iterator visit counts", e))?;
        self.returned.resize(n, false);
        self.visit_counts.resize(n, 0);
        self.discard_capacity = config::DISCARD_CAPACITY_FACTOR * ef;
        self.fingerprint = fingerprint;
        Ok(())
    }

    #[inline]
    pub(crate) fn is_first_used(&self) -> bool {
        self.first_used
    }

    #[inline]
    pub(crate) fn set_first_used_off(&mut self) {
        self.first_used = false;
    }

    /// Reject reuse across different queries.
    pub(crate) fn check_binding(&self, fingerprint: u64) -> Result<()> {
        if self.fingerprint != fingerprint {
            return Err(Error::InvalidArgument(
                "iterator context was created for a different query".into(),
            ));
        }
        Ok(())
    }

    /// Push into the discard heap; when full, the farthest entry loses.
    pub(crate) fn add_discard(&mut self, distance: f32, id: u32) {
        let entry = Neighbor::new(distance, id);
        if self.discard.len() >= self.discard_capacity {
            // sift only if the newcomer beats the current worst
            if let Some(pos) = self.worst_pos() {
                if self.discard[pos] > entry {
                    self.discard.swap_remove(pos);
                    self.discard.push(entry);
                    self.inner_distance.insert(id, distance);
                }
            }
            return;
        }
        self.discard.push(entry);
        self.inner_distance.insert(id, distance);
    }

    fn worst_pos(&self) -> Option<usize> {
        self.discard
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(i, _)| i)
    }

    /// Drain the discard heap in ascending (distance, id) order.
    pub(crate) fn take_discard_sorted(&mut self) -> Vec<Neighbor> {
        let mut entries = std::mem::take(&mut self.discard);
        entries.sort_unstable();
        entries
    }

    #[inline]
    pub(crate) fn discard_len(&self) -> usize {
        self.discard.len()
    }

    /// Mark an id as emitted to the caller. Monotonic.
    pub(crate) fn mark_returned(&mut self, id: u32) {
        let idx = id as usize;
        if idx >= self.returned.len() {
            self.returned.resize(idx + 1, false);
        }
        self.returned[idx] = true;
    }

    #[inline]
    pub(crate) fn is_returned(&self, id: u32) -> bool {
        self.returned.get(id as usize).copied().unwrap_or(false)
    }

    /// Diagnostic: count a distance evaluation against this id.
    #[inline]
    pub(crate) fn record_visit(&mut self, id: u32) {
        if let Some(c) = self.visit_counts.get_mut(id as usize) {
            *c += 1;
        }
    }

    /// Diagnostic view of per-id distance evaluations.
    pub fn visit_counts(&self) -> &[u32] {
        &self.visit_counts
    }

    #[inline]
    pub(crate) fn cached_distance(&self, id: u32) -> Option<f32> {
        self.inner_distance.get(&id).copied()
    }
}

impl Default for IteratorContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(n: usize, ef: usize) -> IteratorContext {
        let mut c = IteratorContext::new();
        c.init(n, ef, 42).unwrap();
        c
    }

    #[test]
    fn test_init_and_binding() {
        let c = ctx(10, 4);
        assert!(c.is_first_used());
        assert!(c.check_binding(42).is_ok());
        assert!(matches!(
            c.check_binding(43),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_discard_bounded_drops_farthest() {
        let mut c = ctx(100, 2); // capacity 4
        for (d, id) in [(5.0, 1), (3.0, 2), (8.0, 3), (1.0, 4)] {
            c.add_discard(d, id);
        }
        assert_eq!(c.discard_len(), 4);
        // full: a closer entry replaces the farthest (8.0)
        c.add_discard(2.0, 5);
        assert_eq!(c.discard_len(), 4);
        let sorted = c.take_discard_sorted();
        let ids: Vec<u32> = sorted.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![4, 5, 2, 1]);
        // full: a farther entry is dropped on the floor
        let mut c = ctx(100, 1);
        c.add_discard(1.0, 1);
        c.add_discard(2.0, 2);
        c.add_discard(9.0, 3);
        let ids: Vec<u32> = c.take_discard_sorted().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_returned_bitmap_is_monotonic() {
        let mut c = ctx(4, 2);
        assert!(!c.is_returned(3));
        c.mark_returned(3);
        assert!(c.is_returned(3));
        // out-of-range ids grow the bitmap instead of panicking
        c.mark_returned(9);
        assert!(c.is_returned(9));
        assert!(!c.is_returned(8));
    }

    #[test]
    fn test_distance_cache() {
        let mut c = ctx(10, 2);
        c.add_discard(0.25, 7);
        assert_eq!(c.cached_distance(7), Some(0.25));
        assert_eq!(c.cached_distance(8), None);
    }

    #[test]
    fn test_visit_counts() {
        let mut c = ctx(3, 2);
        c.record_visit(1);
        c.record_visit(1);
        c.record_visit(2);
        assert_eq!(c.visit_counts(), &[0, 2, 1]);
    }

    #[test]
    fn test_zero_ef_rejected() {
        let mut c = IteratorContext::new();
        assert!(matches!(
            c.init(10, 0, 1),
            Err(Error::InvalidArgument(_))
        ));
    }
}

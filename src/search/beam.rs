//! Greedy descent and layer-0 best-first search.
//!
//! Phase A walks the upper layers greedily, hopping to whichever neighbor
//! improves the distance until none does. Phase B runs the ef-bounded
//! best-first search on one layer. Filtered nodes still expand: a node the
//! filter rejects is scheduled as a candidate but kept out of the results,
//! which is what makes filtered search correct on proximity graphs.
//!
//! When an [`IteratorContext`] is attached, evicted results and the
//! unexpanded frontier spill into its discard heap so the next page can
//! resume where this one stopped.

use crate::graph::{GraphStore, VisitedSet};
use crate::search::filter::FilterAdaptor;
use crate::search::frontier::{Neighbor, SearchFrontier};
use crate::search::iterator::IteratorContext;
use crate::store::FlatStorage;

/// Walk layers `top..=1` greedily from `entry`, returning the best node
/// found and its distance. The result seeds the layer-0 search.
pub(crate) fn greedy_descent(
    storage: &FlatStorage,
    graph: &GraphStore,
    query: &[f32],
    entry: u32,
    top: usize,
) -> Neighbor {
    let mut cur = entry;
    let mut cur_dist = storage.query_distance(query, entry);
    for layer in (1..=top).rev() {
        loop {
            let mut improved = false;
            for &nb in graph.neighbors(cur, layer) {
                if nb == cur {
                    continue;
                }
                let d = storage.query_distance(query, nb);
                if d < cur_dist {
                    cur_dist = d;
                    cur = nb;
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }
    }
    Neighbor::new(cur_dist, cur)
}

/// Best-first search on one layer with an `ef`-bounded result set.
///
/// `seeds` carry precomputed distances; ids already marked in `visited` or
/// already returned by the context are dropped. Returns the kept results in
/// ascending (distance, id) order.
#[allow(clippy::too_many_arguments)]
pub(crate) fn search_layer(
    storage: &FlatStorage,
    graph: &GraphStore,
    query: &[f32],
    seeds: &[Neighbor],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    filter: Option<&FilterAdaptor<'_>>,
    mut ctx: Option<&mut IteratorContext>,
) -> Vec<Neighbor> {
    let mut frontier = SearchFrontier::new(ef);

    for &seed in seeds {
        if let Some(c) = ctx.as_deref() {
            if c.is_returned(seed.id) {
                continue;
            }
        }
        if !visited.test_and_set(seed.id) {
            continue;
        }
        frontier.push_candidate(seed.dist(), seed.id);
        if filter.map_or(true, |f| f.admits(seed.id)) {
            if let Some(evicted) = frontier.offer_result(seed.dist(), seed.id) {
                if let Some(c) = ctx.as_deref_mut() {
                    c.add_discard(evicted.dist(), evicted.id);
                }
            }
        }
    }

    while let Some(candidate) = frontier.pop_candidate() {
        if frontier.should_stop(candidate.dist()) {
            if let Some(c) = ctx.as_deref_mut() {
                c.add_discard(candidate.dist(), candidate.id);
            }
            break;
        }

        for &nb in graph.neighbors(candidate.id, layer) {
            if nb == candidate.id {
                continue;
            }
            if let Some(c) = ctx.as_deref() {
                if c.is_returned(nb) {
                    continue;
                }
            }
            if !visited.test_and_set(nb) {
                continue;
            }

            let d = match ctx.as_deref() {
                Some(c) => c.cached_distance(nb),
                None => None,
            }
            .unwrap_or_else(|| storage.query_distance(query, nb));
            if let Some(c) = ctx.as_deref_mut() {
                c.record_visit(nb);
            }

            if frontier.would_enter(d) {
                frontier.push_candidate(d, nb);
                if filter.map_or(true, |f| f.admits(nb)) {
                    if let Some(evicted) = frontier.offer_result(d, nb) {
                        if let Some(c) = ctx.as_deref_mut() {
                            c.add_discard(evicted.dist(), evicted.id);
                        }
                    }
                }
            } else if let Some(c) = ctx.as_deref_mut() {
                // visited but never scheduled: only the discard heap can
                // bring it back on a later page
                c.add_discard(d, nb);
            }
        }
    }

    if let Some(c) = ctx.as_deref_mut() {
        let rest: Vec<Neighbor> = frontier.drain_candidates().collect();
        for n in rest {
            c.add_discard(n.dist(), n.id);
        }
    }

    frontier.into_sorted_results()
}

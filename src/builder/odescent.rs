//! Parallel neighbor-descent graph construction.
//!
//! ODescent starts from a random graph and refines it over a fixed number
//! of rounds: sample edges, try all sampled pairs against both endpoints'
//! current worst neighbor, compact, then repair nodes that lost all their
//! in-edges. An optional final pass applies the alpha-RNG prune and adds
//! reverse edges.
//!
//! Work fans out to an injected thread pool in blocks of `block_size`
//! consecutive nodes, so the task queue never holds more than
//! `ceil(n / block_size)` entries. Per-node mutexes guard adjacency
//! mutation; each lock is held only across a single append or compact.
//! Given one worker thread the build is fully seed-deterministic; with more
//! threads the pruning pass becomes scheduling-sensitive.

use crate::config;
use crate::error::{Error, Result};
use crate::store::FlatStorage;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::HashSet;
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicI64, Ordering};

/// Tuning knobs for one ODescent build.
#[derive(Debug, Clone)]
pub struct OdescentOptions {
    /// Per-node out-degree bound of the finished graph.
    pub max_degree: usize,
    /// Alpha-RNG pruning slack, `>= 1.0`. Larger keeps more long edges.
    pub alpha: f32,
    /// Number of neighbor-descent rounds.
    pub turns: usize,
    /// Probability that an edge is sampled into a round, in (0, 1].
    pub sample_rate: f32,
    /// In-degree floor enforced by the repair step.
    pub min_in_degree: usize,
    /// Nodes per fan-out block.
    pub block_size: usize,
    /// Whether to run the alpha prune and reverse-edge passes.
    pub pruning: bool,
    /// PRNG seed for the initial graph and edge sampling.
    pub seed: u64,
}

impl Default for OdescentOptions {
    fn default() -> Self {
        Self {
            max_degree: config::DEFAULT_MAX_DEGREE,
            alpha: config::DEFAULT_ALPHA,
            turns: config::DEFAULT_ODESCENT_TURNS,
            sample_rate: config::DEFAULT_SAMPLE_RATE,
            min_in_degree: config::DEFAULT_MIN_IN_DEGREE,
            block_size: config::DEFAULT_BLOCK_SIZE,
            pruning: true,
            seed: config::DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkNode {
    id: u32,
    distance: f32,
    old: bool,
}

/// One node's scratch adjacency plus its cached worst-neighbor distance.
#[derive(Debug, Default)]
struct LinkList {
    neighbors: Vec<LinkNode>,
    greatest_distance: f32,
}

impl LinkList {
    /// Sort by (distance, id), drop duplicate ids keeping the closest copy,
    /// cap at `max_degree`, refresh the cached worst distance.
    fn compact(&mut self, max_degree: usize) {
        self.neighbors.sort_unstable_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut seen = HashSet::with_capacity(self.neighbors.len());
        self.neighbors.retain(|n| seen.insert(n.id));
        self.neighbors.truncate(max_degree);
        if let Some(last) = self.neighbors.last() {
            self.greatest_distance = last.distance;
        }
    }
}

/// Parallel graph builder over a flattened vector store.
pub struct Odescent<'a> {
    opts: OdescentOptions,
    storage: &'a FlatStorage,
    pool: &'a ThreadPool,
    graph: Vec<Mutex<LinkList>>,
    built: bool,
}

impl<'a> Odescent<'a> {
    pub fn new(storage: &'a FlatStorage, pool: &'a ThreadPool, opts: OdescentOptions) -> Self {
        Self {
            opts,
            storage,
            pool,
            graph: Vec::new(),
            built: false,
        }
    }

    /// Run the full construction. Callable once per builder.
    pub fn build(&mut self) -> Result<()> {
        if self.built {
            return Err(Error::BuildInProgress("graph already built".into()));
        }
        self.validate_options()?;
        self.built = true;

        let n = self.storage.len();
        self.graph = (0..n).map(|_| Mutex::new(LinkList::default())).collect();
        if n <= 1 {
            return Ok(());
        }
        let min_in_degree = self.opts.min_in_degree.min(n - 1);

        tracing::debug!(
            n,
            max_degree = self.opts.max_degree,
            turns = self.opts.turns,
            "odescent build start"
        );

        let old_sets: Vec<Mutex<HashSet<u32>>> = (0..n).map(|_| Mutex::new(HashSet::new())).collect();
        let new_sets: Vec<Mutex<HashSet<u32>>> = (0..n).map(|_| Mutex::new(HashSet::new())).collect();

        self.init_graph(n);
        for turn in 0..self.opts.turns {
            self.sample_candidates(n, turn as u64, &old_sets, &new_sets);
            self.update_neighbors(n, &old_sets, &new_sets);
            self.repair_in_degree(n, min_in_degree);
        }
        if self.opts.pruning {
            self.prune_graph(n, min_in_degree);
            self.add_reverse_edges(n);
            // the reverse-edge truncation can strip a node's last in-edge,
            // so the floor is re-established once more
            self.repair_in_degree(n, min_in_degree);
        }

        tracing::debug!(n, "odescent build done");
        Ok(())
    }

    fn validate_options(&self) -> Result<()> {
        if self.opts.max_degree == 0 {
            return Err(Error::InvalidArgument("max_degree must be > 0".into()));
        }
        if self.opts.alpha < 1.0 {
            return Err(Error::InvalidArgument(format!(
                "alpha({}) must be >= 1.0",
                self.opts.alpha
            )));
        }
        if !(self.opts.sample_rate > 0.0 && self.opts.sample_rate <= 1.0) {
            return Err(Error::InvalidArgument(format!(
                "sample_rate({}) must be in (0, 1]",
                self.opts.sample_rate
            )));
        }
        if self.opts.turns == 0 {
            return Err(Error::InvalidArgument("turns must be > 0".into()));
        }
        if self.opts.block_size == 0 {
            return Err(Error::InvalidArgument("block_size must be > 0".into()));
        }
        Ok(())
    }

    /// Fan `task(start, end)` out over `[0, n)` in `block_size` blocks and
    /// join before returning.
    fn parallel_blocks<F>(&self, n: usize, task: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        let block = self.opts.block_size;
        let ranges: Vec<(usize, usize)> = (0..n)
            .step_by(block)
            .map(|s| (s, (s + block).min(n)))
            .collect();
        self.pool.install(|| {
            ranges.into_par_iter().for_each(|(s, e)| task(s, e));
        });
    }

    /// Random starting graph: `min(max_degree, n - 1)` distinct neighbors
    /// per node. Small inputs get the deterministic cyclic fill, larger ones
    /// draw from a seeded PRNG with rejection.
    fn init_graph(&self, n: usize) {
        let seed = self.opts.seed;
        let max_degree = self.opts.max_degree;
        self.parallel_blocks(n, |start, end| {
            let mut rng = StdRng::seed_from_u64(seed ^ (start as u64));
            for i in start..end {
                let max_neighbors = max_degree.min(n - 1);
                let mut picked: HashSet<u32> = HashSet::with_capacity(max_neighbors + 1);
                picked.insert(i as u32);
                let mut list = LinkList {
                    neighbors: Vec::with_capacity(max_degree),
                    greatest_distance: 0.0,
                };
                for j in 0..max_neighbors {
                    let id = if n - 1 <= max_degree {
                        ((i + j + 1) % n) as u32
                    } else {
                        loop {
                            let candidate = rng.gen_range(0..n as u32);
                            if picked.insert(candidate) {
                                break candidate;
                            }
                        }
                    };
                    let dist = self.storage.pair_distance(i as u32, id);
                    list.greatest_distance = list.greatest_distance.max(dist);
                    list.neighbors.push(LinkNode {
                        id,
                        distance: dist,
                        old: false,
                    });
                }
                *self.graph[i].lock() = list;
            }
        });
    }

    /// Sample edges into this round's old/new candidate sets. A sampled
    /// fresh edge lands in the new sets of both endpoints and is marked old;
    /// a sampled old edge lands in the old sets of both endpoints.
    fn sample_candidates(
        &self,
        n: usize,
        turn: u64,
        old_sets: &[Mutex<HashSet<u32>>],
        new_sets: &[Mutex<HashSet<u32>>],
    ) {
        let seed = self.opts.seed;
        let sample_rate = self.opts.sample_rate;
        self.parallel_blocks(n, |start, end| {
            let mut rng =
                StdRng::seed_from_u64(seed ^ (start as u64) ^ turn.wrapping_mul(0x9e37_79b9));
            for i in start..end {
                let mut links = self.graph[i].lock();
                for node in links.neighbors.iter_mut() {
                    if rng.gen::<f32>() >= sample_rate {
                        continue;
                    }
                    if node.old {
                        old_sets[i].lock().insert(node.id);
                        old_sets[node.id as usize].lock().insert(i as u32);
                    } else {
                        new_sets[i].lock().insert(node.id);
                        new_sets[node.id as usize].lock().insert(i as u32);
                        node.old = true;
                    }
                }
            }
        });
    }

    /// Try every sampled new-new and new-old pair; an edge closer than an
    /// endpoint's current worst neighbor is appended under that endpoint's
    /// lock. Ends with a compact pass over every node.
    fn update_neighbors(
        &self,
        n: usize,
        old_sets: &[Mutex<HashSet<u32>>],
        new_sets: &[Mutex<HashSet<u32>>],
    ) {
        self.parallel_blocks(n, |start, end| {
            for i in start..end {
                let new_ids: Vec<u32> = new_sets[i].lock().iter().copied().collect();
                let old_ids: Vec<u32> = old_sets[i].lock().iter().copied().collect();

                let mut tried: Vec<u32> = Vec::with_capacity(new_ids.len());
                for &node_id in &new_ids {
                    for &other_id in &tried {
                        self.try_edge(node_id, other_id);
                    }
                    tried.push(node_id);

                    for &old_id in &old_ids {
                        if node_id == old_id {
                            continue;
                        }
                        self.try_edge(node_id, old_id);
                    }
                }

                new_sets[i].lock().clear();
                old_sets[i].lock().clear();
            }
        });

        let max_degree = self.opts.max_degree;
        self.parallel_blocks(n, |start, end| {
            for i in start..end {
                self.graph[i].lock().compact(max_degree);
            }
        });
    }

    /// Offer the edge (a, b) to both endpoints. Locks are taken one at a
    /// time, never nested.
    fn try_edge(&self, a: u32, b: u32) {
        let dist = self.storage.pair_distance(a, b);
        {
            let mut links = self.graph[a as usize].lock();
            if dist < links.greatest_distance {
                links.neighbors.push(LinkNode {
                    id: b,
                    distance: dist,
                    old: false,
                });
            }
        }
        {
            let mut links = self.graph[b as usize].lock();
            if dist < links.greatest_distance {
                links.neighbors.push(LinkNode {
                    id: a,
                    distance: dist,
                    old: false,
                });
            }
        }
    }

    /// Give every node with in-degree below the floor an in-edge by
    /// rewriting a surplus slot in one of its out-neighbors. Serial; the
    /// donor bookkeeping is order-sensitive.
    fn repair_in_degree(&self, n: usize, min_in_degree: usize) {
        let mut in_count = vec![0i64; n];
        for i in 0..n {
            for node in &self.graph[i].lock().neighbors {
                in_count[node.id as usize] += 1;
            }
        }

        let slot = self.opts.max_degree.min(n - 1);
        let mut replace_pos = vec![slot as i64 - 1; n];
        for i in 0..n {
            let link: Vec<LinkNode> = self.graph[i].lock().neighbors.clone();
            let mut loc = 0usize;
            while in_count[i] < min_in_degree as i64 && loc < link.len() {
                let donor = link[loc].id as usize;
                let mut donor_links = self.graph[donor].lock();
                let has_edge = donor_links.neighbors.iter().any(|nd| nd.id == i as u32);
                if replace_pos[donor] > 0 && !has_edge {
                    let pos = replace_pos[donor] as usize;
                    if pos < donor_links.neighbors.len() {
                        let victim = donor_links.neighbors[pos].id as usize;
                        if in_count[victim] > min_in_degree as i64 {
                            in_count[victim] -= 1;
                            donor_links.neighbors[pos].id = i as u32;
                            donor_links.neighbors[pos].distance = link[loc].distance;
                            in_count[i] += 1;
                        }
                    }
                    replace_pos[donor] -= 1;
                }
                drop(donor_links);
                loc += 1;
            }
        }
    }

    /// Alpha-RNG prune: walk neighbors in ascending distance and keep `n`
    /// only when no already-kept closer neighbor `c` satisfies
    /// `alpha * dist(n, c) < dist(n, origin)`. Nodes sitting at the
    /// in-degree floor are exempt so pruning cannot orphan them.
    fn prune_graph(&self, n: usize, min_in_degree: usize) {
        let in_count: Vec<AtomicI64> = (0..n).map(|_| AtomicI64::new(0)).collect();
        for i in 0..n {
            for node in &self.graph[i].lock().neighbors {
                in_count[node.id as usize].fetch_add(1, Ordering::Relaxed);
            }
        }

        let alpha = self.opts.alpha;
        let max_degree = self.opts.max_degree;
        self.parallel_blocks(n, |start, end| {
            for loc in start..end {
                let mut links = self.graph[loc].lock();
                links.compact(usize::MAX);
                let mut kept: Vec<LinkNode> = Vec::with_capacity(max_degree);
                for idx in 0..links.neighbors.len() {
                    let candidate = links.neighbors[idx];
                    let mut keep = true;
                    if in_count[candidate.id as usize].load(Ordering::Relaxed)
                        > min_in_degree as i64
                    {
                        for c in &kept {
                            if self.storage.pair_distance(candidate.id, c.id) * alpha
                                < candidate.distance
                            {
                                keep = false;
                                in_count[candidate.id as usize].fetch_sub(1, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                    if keep {
                        kept.push(candidate);
                    }
                }
                kept.truncate(max_degree);
                links.neighbors = kept;
                if let Some(last) = links.neighbors.last() {
                    links.greatest_distance = last.distance;
                }
            }
        });
    }

    /// Mirror every retained edge, then re-compact.
    fn add_reverse_edges(&self, n: usize) {
        let mut reverse: Vec<Vec<LinkNode>> = vec![Vec::new(); n];
        for i in 0..n {
            for node in &self.graph[i].lock().neighbors {
                reverse[node.id as usize].push(LinkNode {
                    id: i as u32,
                    distance: node.distance,
                    old: node.old,
                });
            }
        }

        let max_degree = self.opts.max_degree;
        self.parallel_blocks(n, |start, end| {
            for i in start..end {
                let mut links = self.graph[i].lock();
                links.neighbors.extend_from_slice(&reverse[i]);
                links.compact(max_degree);
            }
        });
    }

    /// Extract the finished adjacency, one id list per node.
    pub fn into_adjacency(self) -> Vec<Vec<u32>> {
        self.graph
            .into_iter()
            .map(|m| m.into_inner().neighbors.iter().map(|n| n.id).collect())
            .collect()
    }

    /// Write the graph file framing: a 24-byte header (total size, observed
    /// max degree, entry point, frozen count) followed by one length-prefixed
    /// u32 id list per node. The size and degree fields are written twice,
    /// first as placeholders, then patched once the lists are out.
    pub fn save_graph<W: Write + Seek>(&self, out: &mut W) -> Result<()> {
        let start = out
            .stream_position()
            .map_err(|e| Error::InternalError(format!("graph sink: {e}")))?;
        let mut index_size: u64 = 24;
        let mut max_degree_observed: u32 = 0;
        let entry_point: u32 = 0;
        let num_frozen: u64 = 0;

        let write = |out: &mut W, bytes: &[u8]| {
            out.write_all(bytes)
                .map_err(|e| Error::InternalError(format!("graph sink: {e}")))
        };

        write(out, &index_size.to_le_bytes())?;
        write(out, &max_degree_observed.to_le_bytes())?;
        write(out, &entry_point.to_le_bytes())?;
        write(out, &num_frozen.to_le_bytes())?;

        for links in &self.graph {
            let links = links.lock();
            let k = links.neighbors.len() as u32;
            write(out, &k.to_le_bytes())?;
            for node in &links.neighbors {
                write(out, &node.id.to_le_bytes())?;
            }
            max_degree_observed = max_degree_observed.max(k);
            index_size += u64::from(k + 1) * 4;
        }

        out.seek(SeekFrom::Start(start))
            .map_err(|e| Error::InternalError(format!("graph sink: {e}")))?;
        write(out, &index_size.to_le_bytes())?;
        write(out, &max_degree_observed.to_le_bytes())?;
        out.seek(SeekFrom::Start(start + index_size))
            .map_err(|e| Error::InternalError(format!("graph sink: {e}")))?;
        Ok(())
    }

    /// Out-degree of every node, for diagnostics and tests.
    pub fn degrees(&self) -> Vec<usize> {
        self.graph.iter().map(|m| m.lock().neighbors.len()).collect()
    }
}

//! Index facade: build, add, search, and persistence orchestration.
//!
//! The built state (vector store plus graph) sits behind one `RwLock`:
//! searches share the read side and are wait-free with respect to each
//! other, inserts serialize on the write side. A search observes exactly
//! the vectors whose insertion completed before it took the lock. Builds
//! additionally hold an atomic flag so a second concurrent build fails
//! fast instead of queueing. The thread pool used by the bulk builder is
//! injected; queries never touch it.

use crate::builder::{Odescent, OdescentOptions};
use crate::config;
use crate::distance::DistanceKind;
use crate::error::{Error, Result};
use crate::graph::{GraphStore, VisitedPool};
use crate::io::MemoryBlockIo;
use crate::search::beam::{greedy_descent, search_layer};
use crate::search::filter::{select_strategy, FilterAdaptor, SearchStrategy};
use crate::search::frontier::Neighbor;
use crate::search::{Filter, IteratorContext, SearchResult};
use crate::store::{CodecKind, FlatStorage};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Magic bytes opening a serialized index.
const INDEX_MAGIC: &[u8; 4] = b"PXI1";

/// Element type of the vectors handed to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Int8,
}

/// Graph construction parameters, the `hnsw`/`index_param` document of the
/// build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphOptions {
    pub max_degree: usize,
    pub ef_construction: usize,
    #[serde(default = "GraphOptions::default_codec")]
    pub base_quantization_type: CodecKind,
    /// Alpha-RNG pruning slack used at build and insert time.
    #[serde(default = "GraphOptions::default_alpha")]
    pub alpha: f32,
}

impl GraphOptions {
    fn default_codec() -> CodecKind {
        CodecKind::Fp32
    }

    fn default_alpha() -> f32 {
        config::DEFAULT_ALPHA
    }
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            max_degree: config::DEFAULT_MAX_DEGREE,
            ef_construction: config::DEFAULT_EF_CONSTRUCTION,
            base_quantization_type: CodecKind::Fp32,
            alpha: config::DEFAULT_ALPHA,
        }
    }
}

/// Build-time configuration of an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptions {
    pub dtype: DataType,
    #[serde(rename = "metric_type")]
    pub metric: DistanceKind,
    pub dim: usize,
    #[serde(alias = "index_param")]
    pub hnsw: GraphOptions,
    #[serde(default = "IndexOptions::default_seed")]
    pub seed: u64,
}

impl IndexOptions {
    /// Float32 options with default graph parameters.
    pub fn new(metric: DistanceKind, dim: usize) -> Self {
        Self {
            dtype: DataType::Float32,
            metric,
            dim,
            hnsw: GraphOptions::default(),
            seed: config::DEFAULT_SEED,
        }
    }

    fn default_seed() -> u64 {
        config::DEFAULT_SEED
    }

    fn validate(&self) -> Result<()> {
        if self.dtype == DataType::Int8 {
            return Err(Error::Unsupported(
                "int8 vectors are not supported by this build".into(),
            ));
        }
        if self.dim == 0 || self.dim > config::MAX_DIMENSION {
            return Err(Error::InvalidArgument(format!(
                "dim({}) must be in [1, {}]",
                self.dim,
                config::MAX_DIMENSION
            )));
        }
        if self.hnsw.max_degree < config::MIN_MAX_DEGREE
            || self.hnsw.max_degree > config::MAX_MAX_DEGREE
        {
            return Err(Error::InvalidArgument(format!(
                "max_degree({}) must be in [{}, {}]",
                self.hnsw.max_degree,
                config::MIN_MAX_DEGREE,
                config::MAX_MAX_DEGREE
            )));
        }
        if self.hnsw.ef_construction < self.hnsw.max_degree {
            return Err(Error::InvalidArgument(format!(
                "ef_construction({}) must be >= max_degree({})",
                self.hnsw.ef_construction, self.hnsw.max_degree
            )));
        }
        if self.hnsw.alpha < 1.0 {
            return Err(Error::InvalidArgument(format!(
                "alpha({}) must be >= 1.0",
                self.hnsw.alpha
            )));
        }
        Ok(())
    }
}

/// Per-query parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(alias = "ef")]
    pub ef_search: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            ef_search: config::DEFAULT_EF_SEARCH,
        }
    }
}

/// Snapshot of the facade's strategy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub graph_searches: u64,
    pub bruteforce_searches: u64,
}

fn default_level_rng() -> StdRng {
    StdRng::seed_from_u64(config::DEFAULT_SEED)
}

/// Built state: the vector store, the graph over it, and the level sampler
/// for incremental inserts.
#[derive(Serialize, Deserialize)]
struct IndexInner {
    storage: FlatStorage,
    graph: GraphStore,
    #[serde(skip, default = "default_level_rng")]
    level_rng: StdRng,
}

/// Approximate nearest-neighbor index over a hierarchical proximity graph.
pub struct Index {
    options: IndexOptions,
    inner: RwLock<Option<IndexInner>>,
    visited: VisitedPool,
    pool: Arc<rayon::ThreadPool>,
    building: AtomicBool,
    graph_searches: AtomicU64,
    bruteforce_searches: AtomicU64,
}

/// Clears the build flag on scope exit, error paths included.
struct BuildGuard<'a>(&'a AtomicBool);

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Index {
    /// Create an unbuilt index with its own thread pool.
    pub fn new(options: IndexOptions) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .build()
            .map_err(|e| Error::InternalError(format!("thread pool: {e}")))?;
        Self::with_thread_pool(options, Arc::new(pool))
    }

    /// Create an unbuilt index that fans build work out to `pool`.
    pub fn with_thread_pool(options: IndexOptions, pool: Arc<rayon::ThreadPool>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            inner: RwLock::new(None),
            visited: VisitedPool::new(),
            pool,
            building: AtomicBool::new(false),
            graph_searches: AtomicU64::new(0),
            bruteforce_searches: AtomicU64::new(0),
        })
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Number of vectors currently searchable.
    pub fn num_elements(&self) -> usize {
        self.inner.read().as_ref().map_or(0, |i| i.storage.len())
    }

    /// Live footprint of the store and graph in bytes.
    pub fn memory_usage(&self) -> usize {
        self.inner
            .read()
            .as_ref()
            .map_or(0, |i| i.storage.memory_usage() + i.graph.memory_usage())
    }

    pub fn stats(&self) -> SearchStats {
        SearchStats {
            graph_searches: self.graph_searches.load(Ordering::Relaxed),
            bruteforce_searches: self.bruteforce_searches.load(Ordering::Relaxed),
        }
    }

    /// Bulk-build the index from `ids` and row-major `vectors`.
    ///
    /// The base layer comes from the parallel ODescent builder; nodes whose
    /// sampled level exceeds zero are then linked into the upper layers by
    /// beam-search insertion. Fails if a build already ran or is running;
    /// a failed build leaves the index unbuilt.
    pub fn build(&self, ids: &[i64], vectors: &[f32]) -> Result<()> {
        if self.building.swap(true, Ordering::AcqRel) {
            return Err(Error::BuildInProgress("another build is running".into()));
        }
        let _guard = BuildGuard(&self.building);
        if self.inner.read().is_some() {
            return Err(Error::BuildInProgress("index is already built".into()));
        }

        let dim = self.options.dim;
        if ids.len() * dim != vectors.len() {
            return Err(Error::InvalidArgument(format!(
                "{} ids with dim {} need {} floats, got {}",
                ids.len(),
                dim,
                ids.len() * dim,
                vectors.len()
            )));
        }

        let n = ids.len();
        let mut storage = FlatStorage::new(
            self.options.metric,
            dim,
            self.options.hnsw.base_quantization_type,
        );
        storage.reserve(n)?;
        for (row, &id) in ids.iter().enumerate() {
            storage.insert(id, &vectors[row * dim..(row + 1) * dim])?;
        }

        let max_degree = self.options.hnsw.max_degree;
        let mut graph = GraphStore::new(max_degree);
        let mut level_rng = StdRng::seed_from_u64(self.options.seed);
        for _ in 0..n {
            let cap = if graph.is_empty() {
                0
            } else {
                (graph.max_layer() + 1).min(config::MAX_LAYERS - 1)
            };
            let level = sample_level(&mut level_rng, max_degree).min(cap);
            graph.new_node(level);
        }

        if n > 0 {
            // base layer: ODescent over the full store at the layer-0 cap
            let odescent_opts = OdescentOptions {
                max_degree: 2 * max_degree,
                alpha: self.options.hnsw.alpha,
                seed: self.options.seed,
                ..OdescentOptions::default()
            };
            let mut builder = Odescent::new(&storage, &self.pool, odescent_opts);
            builder.build()?;
            graph.install_base_layer(builder.into_adjacency())?;

            self.link_upper_layers(&storage, &mut graph)?;
        }

        tracing::info!(
            n,
            dim,
            max_degree,
            max_layer = graph.max_layer(),
            "index built"
        );
        *self.inner.write() = Some(IndexInner {
            storage,
            graph,
            level_rng,
        });
        Ok(())
    }

    /// Link every node with level >= 1 into the upper layers, one layer at
    /// a time, by sequential beam-search insertion among that layer's
    /// members.
    fn link_upper_layers(&self, storage: &FlatStorage, graph: &mut GraphStore) -> Result<()> {
        let n = storage.len();
        let ef = self.options.hnsw.ef_construction;
        let alpha = self.options.hnsw.alpha;
        let mut query = vec![0.0f32; storage.dim()];

        for layer in 1..=graph.max_layer() {
            let members: Vec<u32> = (0..n as u32).filter(|&id| graph.level(id) >= layer).collect();
            if members.len() <= 1 {
                continue;
            }
            for &member in members.iter().skip(1) {
                storage.decode_into(member, &mut query);
                let mut visited = self.visited.acquire(n);
                visited.test_and_set(member);
                let seed = Neighbor::new(storage.query_distance(&query, members[0]), members[0]);
                let found = search_layer(
                    storage,
                    graph,
                    &query,
                    &[seed],
                    ef,
                    layer,
                    &mut visited,
                    None,
                    None,
                );
                self.visited.release(visited);

                let cap = graph.cap(layer);
                let selected = select_neighbors(storage, &found, cap, alpha);
                graph.replace_adjacency(member, layer, selected.iter().map(|s| s.id).collect());
                for s in &selected {
                    graph.push_neighbor(s.id, layer, member);
                    if graph.neighbors(s.id, layer).len() > cap {
                        shrink_adjacency(storage, graph, s.id, layer, alpha);
                    }
                }
            }
        }
        Ok(())
    }

    /// Insert one vector. Serialized with other writers; concurrent
    /// searches keep running and pick the point up once the insert returns.
    pub fn add(&self, external_id: i64, vector: &[f32]) -> Result<u32> {
        if vector.len() != self.options.dim {
            return Err(Error::DimensionNotEqual {
                expected: self.options.dim,
                actual: vector.len(),
            });
        }
        let mut guard = self.inner.write();
        let inner = guard.get_or_insert_with(|| IndexInner {
            storage: FlatStorage::new(
                self.options.metric,
                self.options.dim,
                self.options.hnsw.base_quantization_type,
            ),
            graph: GraphStore::new(self.options.hnsw.max_degree),
            level_rng: StdRng::seed_from_u64(self.options.seed),
        });

        let prepared = inner.storage.prepare_query(vector)?.into_owned();
        let prev_n = inner.storage.len();
        let prev_entry = inner.graph.entry_point();
        let prev_top = inner.graph.max_layer();

        let internal = inner.storage.insert(external_id, vector)?;
        let cap = if prev_n == 0 {
            0
        } else {
            (prev_top + 1).min(config::MAX_LAYERS - 1)
        };
        let level = sample_level(&mut inner.level_rng, self.options.hnsw.max_degree).min(cap);
        inner.graph.new_node(level);

        let entry = match prev_entry {
            Some(e) => e,
            None => return Ok(internal),
        };

        let alpha = self.options.hnsw.alpha;
        let ef = self.options.hnsw.ef_construction;
        let storage = &inner.storage;
        let graph = &mut inner.graph;

        // descend above the node's level, then link downward
        let mut seed = if prev_top > level {
            greedy_descent_above(storage, graph, &prepared, entry, prev_top, level)
        } else {
            Neighbor::new(storage.query_distance(&prepared, entry), entry)
        };

        for layer in (0..=level.min(prev_top)).rev() {
            let mut visited = self.visited.acquire(storage.len());
            visited.test_and_set(internal);
            let found = search_layer(
                storage,
                graph,
                &prepared,
                &[seed],
                ef,
                layer,
                &mut visited,
                None,
                None,
            );
            self.visited.release(visited);

            let cap = graph.cap(layer);
            let selected = select_neighbors(storage, &found, cap, alpha);
            graph.replace_adjacency(internal, layer, selected.iter().map(|s| s.id).collect());
            for s in &selected {
                graph.push_neighbor(s.id, layer, internal);
                if graph.neighbors(s.id, layer).len() > cap {
                    shrink_adjacency(storage, graph, s.id, layer, alpha);
                }
            }
            if let Some(&best) = found.first() {
                seed = best;
            }
        }
        Ok(internal)
    }

    /// One-shot k-nearest-neighbor search.
    pub fn knn_search(
        &self,
        query: &[f32],
        k: usize,
        options: &SearchOptions,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<SearchResult>> {
        self.knn_search_impl(query, k, options, filter, None)
    }

    /// Paged k-nearest-neighbor search. Successive calls with the same
    /// context return disjoint, globally ordered pages under the same
    /// filter; the context must not be reused across queries.
    pub fn knn_search_iter(
        &self,
        query: &[f32],
        k: usize,
        options: &SearchOptions,
        filter: Option<&dyn Filter>,
        ctx: &mut IteratorContext,
    ) -> Result<Vec<SearchResult>> {
        self.knn_search_impl(query, k, options, filter, Some(ctx))
    }

    fn knn_search_impl(
        &self,
        query: &[f32],
        k: usize,
        options: &SearchOptions,
        filter: Option<&dyn Filter>,
        mut ctx: Option<&mut IteratorContext>,
    ) -> Result<Vec<SearchResult>> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(Error::NotBuilt)?;
        if k == 0 {
            return Err(Error::InvalidArgument("k must be > 0".into()));
        }
        if options.ef_search == 0 {
            return Err(Error::InvalidArgument("ef_search must be > 0".into()));
        }
        let prepared = inner.storage.prepare_query(query)?;
        let fp = query_fingerprint(&prepared);
        let n = inner.storage.len();
        let ef = options.ef_search.max(k);

        if n == 0 {
            if let Some(c) = ctx.as_deref_mut() {
                if c.is_first_used() {
                    c.init(0, ef, fp)?;
                    c.set_first_used_off();
                } else {
                    c.check_binding(fp)?;
                }
            }
            return Ok(Vec::new());
        }

        let strategy = match filter {
            Some(f) => select_strategy(f.valid_ratio().clamp(0.0, 1.0), ef, n),
            None => SearchStrategy::Graph { ef_effective: ef },
        };

        match strategy {
            SearchStrategy::BruteForce => {
                self.bruteforce_searches.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(n, k, "filtered search fell back to brute force");
                self.brute_force(inner, &prepared, k, ef, fp, filter, ctx)
            }
            SearchStrategy::Graph { ef_effective } => {
                self.graph_searches.fetch_add(1, Ordering::Relaxed);
                self.graph_search(inner, &prepared, k, ef_effective, fp, filter, ctx)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn graph_search(
        &self,
        inner: &IndexInner,
        query: &[f32],
        k: usize,
        ef: usize,
        fingerprint: u64,
        filter: Option<&dyn Filter>,
        mut ctx: Option<&mut IteratorContext>,
    ) -> Result<Vec<SearchResult>> {
        let storage = &inner.storage;
        let graph = &inner.graph;
        let n = storage.len();
        let adaptor = filter.map(|f| FilterAdaptor::new(f, storage.external_ids()));

        let results: Vec<Neighbor> = match ctx.as_deref_mut() {
            None => {
                let entry = graph
                    .entry_point()
                    .ok_or_else(|| Error::InternalError("built graph has no entry point".into()))?;
                let seed = greedy_descent(storage, graph, query, entry, graph.max_layer());
                let mut visited = self.visited.acquire(n);
                let out = search_layer(
                    storage,
                    graph,
                    query,
                    &[seed],
                    ef,
                    0,
                    &mut visited,
                    adaptor.as_ref(),
                    None,
                );
                self.visited.release(visited);
                out
            }
            Some(c) => {
                let seeds: Vec<Neighbor> = if c.is_first_used() {
                    c.init(n, ef, fingerprint)?;
                    let entry = graph.entry_point().ok_or_else(|| {
                        Error::InternalError("built graph has no entry point".into())
                    })?;
                    vec![greedy_descent(storage, graph, query, entry, graph.max_layer())]
                } else {
                    c.check_binding(fingerprint)?;
                    let drained = c.take_discard_sorted();
                    drained
                        .into_iter()
                        .filter(|nb| !c.is_returned(nb.id))
                        .collect()
                };
                let mut visited = self.visited.acquire(n);
                let out = search_layer(
                    storage,
                    graph,
                    query,
                    &seeds,
                    ef,
                    0,
                    &mut visited,
                    adaptor.as_ref(),
                    Some(&mut *c),
                );
                self.visited.release(visited);
                c.set_first_used_off();
                out
            }
        };

        let page: Vec<SearchResult> = results
            .iter()
            .take(k)
            .map(|nb| SearchResult {
                id: storage.external_id(nb.id),
                distance: nb.dist(),
            })
            .collect();

        if let Some(c) = ctx.as_deref_mut() {
            for nb in results.iter().take(k) {
                c.mark_returned(nb.id);
            }
            // results beyond the page seed the next one
            for nb in results.iter().skip(k) {
                c.add_discard(nb.dist(), nb.id);
            }
        }
        Ok(page)
    }

    #[allow(clippy::too_many_arguments)]
    fn brute_force(
        &self,
        inner: &IndexInner,
        query: &[f32],
        k: usize,
        ef: usize,
        fingerprint: u64,
        filter: Option<&dyn Filter>,
        mut ctx: Option<&mut IteratorContext>,
    ) -> Result<Vec<SearchResult>> {
        let storage = &inner.storage;
        let n = storage.len() as u32;
        let adaptor = filter.map(|f| FilterAdaptor::new(f, storage.external_ids()));

        if let Some(c) = ctx.as_deref_mut() {
            if c.is_first_used() {
                c.init(n as usize, ef, fingerprint)?;
                c.set_first_used_off();
            } else {
                c.check_binding(fingerprint)?;
            }
        }

        let mut best: Vec<Neighbor> = Vec::with_capacity(k + 1);
        for id in 0..n {
            if let Some(c) = ctx.as_deref() {
                if c.is_returned(id) {
                    continue;
                }
            }
            if let Some(a) = adaptor.as_ref() {
                if !a.admits(id) {
                    continue;
                }
            }
            let d = storage.query_distance(query, id);
            let entry = Neighbor::new(d, id);
            let pos = best.partition_point(|b| *b < entry);
            if pos < k {
                best.insert(pos, entry);
                best.truncate(k);
            }
        }

        if let Some(c) = ctx.as_deref_mut() {
            for nb in &best {
                c.mark_returned(nb.id);
            }
        }
        Ok(best
            .into_iter()
            .map(|nb| SearchResult {
                id: storage.external_id(nb.id),
                distance: nb.dist(),
            })
            .collect())
    }

    /// All admitted points within `radius` of the query, closest first,
    /// capped at `ef_search` on the graph path.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        options: &SearchOptions,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<SearchResult>> {
        if !(radius >= 0.0) {
            return Err(Error::InvalidArgument(format!(
                "radius({radius}) must be >= 0"
            )));
        }
        if options.ef_search == 0 {
            return Err(Error::InvalidArgument("ef_search must be > 0".into()));
        }
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(Error::NotBuilt)?;
        let prepared = inner.storage.prepare_query(query)?;
        let n = inner.storage.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let ef = options.ef_search;

        let strategy = match filter {
            Some(f) => select_strategy(f.valid_ratio().clamp(0.0, 1.0), ef, n),
            None => SearchStrategy::Graph { ef_effective: ef },
        };
        let mut results = match strategy {
            SearchStrategy::BruteForce => {
                self.bruteforce_searches.fetch_add(1, Ordering::Relaxed);
                let adaptor = filter.map(|f| FilterAdaptor::new(f, inner.storage.external_ids()));
                let mut out = Vec::new();
                for id in 0..n as u32 {
                    if let Some(a) = adaptor.as_ref() {
                        if !a.admits(id) {
                            continue;
                        }
                    }
                    let d = inner.storage.query_distance(&prepared, id);
                    if d <= radius {
                        out.push(Neighbor::new(d, id));
                    }
                }
                out.sort_unstable();
                out
            }
            SearchStrategy::Graph { ef_effective } => {
                self.graph_searches.fetch_add(1, Ordering::Relaxed);
                let adaptor = filter.map(|f| FilterAdaptor::new(f, inner.storage.external_ids()));
                let graph = &inner.graph;
                let entry = graph
                    .entry_point()
                    .ok_or_else(|| Error::InternalError("built graph has no entry point".into()))?;
                let seed = greedy_descent(&inner.storage, graph, &prepared, entry, graph.max_layer());
                let mut visited = self.visited.acquire(n);
                let mut out = search_layer(
                    &inner.storage,
                    graph,
                    &prepared,
                    &[seed],
                    ef_effective,
                    0,
                    &mut visited,
                    adaptor.as_ref(),
                    None,
                );
                self.visited.release(visited);
                out.retain(|nb| nb.dist() <= radius);
                out
            }
        };
        results.truncate(ef);
        Ok(results
            .into_iter()
            .map(|nb| SearchResult {
                id: inner.storage.external_id(nb.id),
                distance: nb.dist(),
            })
            .collect())
    }

    /// Write the index to `sink`: magic, payload length, the bincode
    /// payload in memory-block framing, and a CRC32 footer.
    pub fn serialize<W: Write>(&self, sink: &mut W) -> Result<()> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(Error::NotBuilt)?;

        let payload = bincode::serialize(&(&self.options, inner))
            .map_err(|e| Error::InternalError(format!("encode index: {e}")))?;
        let io_err = |e: std::io::Error| Error::InternalError(format!("index sink: {e}"));

        sink.write_all(INDEX_MAGIC).map_err(io_err)?;
        sink.write_all(&(payload.len() as u64).to_le_bytes())
            .map_err(io_err)?;
        let mut blocks = MemoryBlockIo::new(config::DEFAULT_IO_BLOCK_BYTES)?;
        blocks.write_at(0, &payload)?;
        blocks.dump(sink)?;
        sink.write_all(&crc32fast::hash(&payload).to_le_bytes())
            .map_err(io_err)?;
        tracing::info!(bytes = payload.len(), "index serialized");
        Ok(())
    }

    /// Rebuild an index from bytes produced by [`serialize`](Self::serialize).
    ///
    /// The payload is CRC-checked and the decoded structures are validated
    /// before the index is handed back; corruption reports `InvalidBinary`.
    pub fn deserialize<R: Read>(source: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        source
            .read_exact(&mut magic)
            .map_err(|e| Error::InvalidBinary(format!("missing magic: {e}")))?;
        if &magic != INDEX_MAGIC {
            return Err(Error::InvalidBinary("unrecognized index format".into()));
        }
        let mut len_bytes = [0u8; 8];
        source
            .read_exact(&mut len_bytes)
            .map_err(|e| Error::InvalidBinary(format!("missing payload length: {e}")))?;
        let payload_len = u64::from_le_bytes(len_bytes);

        let blocks = MemoryBlockIo::load(source)?;
        if payload_len > blocks.block_count() as u64 * blocks.block_size() {
            return Err(Error::InvalidBinary(
                "payload length exceeds block store".into(),
            ));
        }
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(payload_len as usize)
            .map_err(|e| Error::alloc("index payload", e))?;
        payload.resize(payload_len as usize, 0);
        blocks.read_at(0, &mut payload)?;

        let mut crc_bytes = [0u8; 4];
        source
            .read_exact(&mut crc_bytes)
            .map_err(|e| Error::InvalidBinary(format!("missing checksum: {e}")))?;
        if crc32fast::hash(&payload) != u32::from_le_bytes(crc_bytes) {
            return Err(Error::InvalidBinary("checksum mismatch".into()));
        }

        let (options, mut inner): (IndexOptions, IndexInner) = bincode::deserialize(&payload)
            .map_err(|e| Error::InvalidBinary(format!("decode index: {e}")))?;
        options.validate().map_err(|e| match e {
            Error::InvalidArgument(m) | Error::Unsupported(m) => Error::InvalidBinary(m),
            other => other,
        })?;
        inner.storage.validate()?;
        inner.graph.validate()?;
        if inner.storage.len() != inner.graph.len() {
            return Err(Error::InvalidBinary(format!(
                "store holds {} vectors but graph has {} nodes",
                inner.storage.len(),
                inner.graph.len()
            )));
        }
        if inner.storage.dim() != options.dim {
            return Err(Error::InvalidBinary("stored dim disagrees with options".into()));
        }
        inner.level_rng = StdRng::seed_from_u64(options.seed);

        tracing::info!(n = inner.storage.len(), "index deserialized");
        let index = Self::new(options)?;
        *index.inner.write() = Some(inner);
        Ok(index)
    }
}

/// Geometric level sampling with parameter `1 / ln(max_degree)`.
fn sample_level(rng: &mut StdRng, max_degree: usize) -> usize {
    let ml = 1.0 / (max_degree as f64).ln();
    let r: f64 = rng.gen();
    let r = (1.0 - r).max(f64::MIN_POSITIVE);
    (-r.ln() * ml).floor() as usize
}

/// Hash the prepared query so an iterator context can be bound to it.
fn query_fingerprint(query: &[f32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for &x in query {
        x.to_bits().hash(&mut hasher);
    }
    query.len().hash(&mut hasher);
    hasher.finish()
}

/// Alpha-RNG selection over candidates already sorted ascending. Keeps a
/// candidate only when no closer kept neighbor dominates it; leftover slots
/// backfill with the closest unused candidates.
fn select_neighbors(
    storage: &FlatStorage,
    candidates: &[Neighbor],
    m: usize,
    alpha: f32,
) -> Vec<Neighbor> {
    let mut kept: Vec<Neighbor> = Vec::with_capacity(m);
    for &c in candidates {
        if kept.len() >= m {
            break;
        }
        let diverse = kept
            .iter()
            .all(|k| alpha * storage.pair_distance(c.id, k.id) >= c.dist());
        if diverse {
            kept.push(c);
        }
    }
    if kept.len() < m {
        for &c in candidates {
            if kept.len() >= m {
                break;
            }
            if !kept.iter().any(|k| k.id == c.id) {
                kept.push(c);
            }
        }
    }
    kept
}

/// Re-prune one node's over-full adjacency at `layer` back under the cap.
fn shrink_adjacency(
    storage: &FlatStorage,
    graph: &mut GraphStore,
    id: u32,
    layer: usize,
    alpha: f32,
) {
    let mut scored: Vec<Neighbor> = graph
        .neighbors(id, layer)
        .iter()
        .map(|&nb| Neighbor::new(storage.pair_distance(id, nb), nb))
        .collect();
    scored.sort_unstable();
    let selected = select_neighbors(storage, &scored, graph.cap(layer), alpha);
    graph.replace_adjacency(id, layer, selected.iter().map(|s| s.id).collect());
}

/// Greedy descent that stops above `down_to_exclusive` instead of layer 0.
fn greedy_descent_above(
    storage: &FlatStorage,
    graph: &GraphStore,
    query: &[f32],
    entry: u32,
    top: usize,
    down_to_exclusive: usize,
) -> Neighbor {
    let mut cur = entry;
    let mut cur_dist = storage.query_distance(query, entry);
    for layer in ((down_to_exclusive + 1)..=top).rev() {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validation() {
        let mut o = IndexOptions::new(DistanceKind::L2, 16);
        assert!(o.validate().is_ok());

        o.dim = 0;
        assert!(matches!(o.validate(), Err(Error::InvalidArgument(_))));
        o.dim = 16;

        o.hnsw.max_degree = 2;
        assert!(matches!(o.validate(), Err(Error::InvalidArgument(_))));
        o.hnsw.max_degree = 16;

        o.hnsw.ef_construction = 8;
        assert!(matches!(o.validate(), Err(Error::InvalidArgument(_))));
        o.hnsw.ef_construction = 100;

        o.dtype = DataType::Int8;
        assert!(matches!(o.validate(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_search_before_build_is_not_built() {
        let index = Index::new(IndexOptions::new(DistanceKind::L2, 4)).unwrap();
        let err = index
            .knn_search(&[0.0; 4], 1, &SearchOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, Error::NotBuilt));
        let mut sink = Vec::new();
        assert!(matches!(index.serialize(&mut sink), Err(Error::NotBuilt)));
    }

    #[test]
    fn test_empty_build_searches_empty() {
        let index = Index::new(IndexOptions::new(DistanceKind::L2, 4)).unwrap();
        index.build(&[], &[]).unwrap();
        let hits = index
            .knn_search(&[0.0; 4], 3, &SearchOptions::default(), None)
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.num_elements(), 0);
    }

    #[test]
    fn test_k_zero_and_ef_zero_rejected() {
        let index = Index::new(IndexOptions::new(DistanceKind::L2, 2)).unwrap();
        index.build(&[1, 2], &[0.0, 0.0, 1.0, 1.0]).unwrap();
        assert!(matches!(
            index.knn_search(&[0.0, 0.0], 0, &SearchOptions::default(), None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            index.knn_search(&[0.0, 0.0], 1, &SearchOptions { ef_search: 0 }, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_build_twice_rejected() {
        let index = Index::new(IndexOptions::new(DistanceKind::L2, 2)).unwrap();
        index.build(&[1], &[0.5, 0.5]).unwrap();
        assert!(matches!(
            index.build(&[2], &[0.1, 0.1]),
            Err(Error::BuildInProgress(_))
        ));
    }

    #[test]
    fn test_mismatched_build_slices() {
        let index = Index::new(IndexOptions::new(DistanceKind::L2, 3)).unwrap();
        assert!(matches!(
            index.build(&[1, 2], &[0.0; 3]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_add_then_search() {
        let index = Index::new(IndexOptions::new(DistanceKind::L2, 2)).unwrap();
        for i in 0..50i64 {
            index.add(i, &[i as f32, 0.0]).unwrap();
        }
        let hits = index
            .knn_search(&[20.2, 0.0], 3, &SearchOptions::default(), None)
            .unwrap();
        assert_eq!(hits[0].id, 20);
        assert_eq!(hits.len(), 3);
        assert!(hits[0].distance <= hits[1].distance);
        assert_eq!(index.num_elements(), 50);
        assert!(index.memory_usage() > 0);
    }

    #[test]
    fn test_ef_smaller_than_k_is_clamped() {
        let index = Index::new(IndexOptions::new(DistanceKind::L2, 2)).unwrap();
        for i in 0..30i64 {
            index.add(i, &[i as f32, 0.0]).unwrap();
        }
        let hits = index
            .knn_search(&[0.0, 0.0], 10, &SearchOptions { ef_search: 2 }, None)
            .unwrap();
        assert_eq!(hits.len(), 10);
    }

    #[test]
    fn test_level_sampling_is_bounded() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10_000 {
            let l = sample_level(&mut rng, 16);
            assert!(l < 64, "implausible level {l}");
        }
    }
}

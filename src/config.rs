//! Global configuration constants for proxima.
//!
//! All tuning parameters and input validation limits are defined here.
//! Runtime parameters are carried by [`IndexOptions`](crate::index::IndexOptions)
//! and [`SearchOptions`](crate::index::SearchOptions).

/// Default per-layer cap on a node's out-adjacency.
///
/// Layer 0 uses twice this value. Higher values improve recall but increase
/// memory and build time. Typical range: 8–64.
pub const DEFAULT_MAX_DEGREE: usize = 16;

/// Smallest accepted `max_degree`.
pub const MIN_MAX_DEGREE: usize = 4;

/// Largest accepted `max_degree`.
pub const MAX_MAX_DEGREE: usize = 64;

/// Default candidate frontier size during construction.
///
/// Must be at least `max_degree`; higher values produce a better graph but
/// slow down build.
pub const DEFAULT_EF_CONSTRUCTION: usize = 100;

/// Default candidate frontier size during search.
pub const DEFAULT_EF_SEARCH: usize = 50;

/// Maximum number of layers in the proximity graph.
pub const MAX_LAYERS: usize = 16;

/// Maximum allowed vector dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Filters whose declared valid ratio falls below this threshold are routed
/// to the brute-force scan instead of the graph search.
pub const BRUTE_FORCE_VALID_RATIO: f32 = 0.05;

/// Floor applied to the valid ratio when inflating `ef` for filtered graph
/// search, so a tiny ratio cannot blow the frontier up unboundedly.
pub const VALID_RATIO_FLOOR: f32 = 0.1;

/// The iterator context's discard heap holds at most this many times the
/// effective `ef_search` entries; beyond that the farthest entry is dropped.
pub const DISCARD_CAPACITY_FACTOR: usize = 2;

/// Number of neighbor-descent rounds the ODescent builder runs by default.
pub const DEFAULT_ODESCENT_TURNS: usize = 10;

/// Default edge sample rate per ODescent round.
pub const DEFAULT_SAMPLE_RATE: f32 = 0.3;

/// Default alpha for the builder's RNG pruning pass.
pub const DEFAULT_ALPHA: f32 = 1.2;

/// Every node keeps at least this many in-edges after repair.
pub const DEFAULT_MIN_IN_DEGREE: usize = 1;

/// Work-block granularity for the builder's fan-out; bounds the task queue
/// at `ceil(n / block_size)` entries.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default seed for reproducible builds.
pub const DEFAULT_SEED: u64 = 0x6f64_6573_6365_6e74;

/// Smallest block the memory-block I/O layer will allocate (4 KiB).
pub const MIN_IO_BLOCK_BYTES: u64 = 4096;

/// Default block size for memory-block I/O framing (1 MiB).
pub const DEFAULT_IO_BLOCK_BYTES: u64 = 1 << 20;

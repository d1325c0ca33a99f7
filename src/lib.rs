//! # proxima
//!
//! Embeddable in-memory approximate nearest-neighbor engine built on a
//! hierarchical proximity graph, with an iterative (stateful, resumable)
//! filtered-search protocol and the parallel ODescent graph builder.
//!
//! The core pieces:
//!
//! - [`Index`]: build / add / search / persistence facade.
//! - [`Filter`]: user predicate over external ids with a selectivity hint;
//!   drives the brute-force-vs-graph strategy choice.
//! - [`IteratorContext`]: caller-owned state that lets successive searches
//!   return disjoint, globally ordered result pages for one query.
//! - [`builder::Odescent`]: standalone parallel graph construction with
//!   in-degree repair and alpha pruning.
//!
//! ```
//! use proxima::{DistanceKind, Index, IndexOptions, SearchOptions};
//!
//! let index = Index::new(IndexOptions::new(DistanceKind::L2, 4))?;
//! index.build(&[1, 2, 3], &[
//!     0.0, 0.0, 0.0, 0.0,
//!     1.0, 0.0, 0.0, 0.0,
//!     0.0, 1.0, 1.0, 0.0,
//! ])?;
//! let hits = index.knn_search(&[0.9, 0.0, 0.0, 0.0], 2, &SearchOptions::default(), None)?;
//! assert_eq!(hits[0].id, 2);
//! # Ok::<(), proxima::Error>(())
//! ```
//!
//! This crate has no async runtime and installs no logging subscriber; it
//! emits `tracing` events and leaves the subscriber to the host.

/// Graph construction: the ODescent parallel builder.
pub mod builder;
/// Vector codecs and distance kernels (scalar and SIMD).
pub mod codec;
/// Tuning constants and validation limits.
pub mod config;
/// Distance metric conventions.
pub mod distance;
/// Structured error kinds.
pub mod error;
/// Graph storage and traversal support.
pub mod graph;
/// Index facade.
pub mod index;
/// Memory-block serialization framing.
pub mod io;
/// Search primitives: beam search, frontiers, filters, paged search.
pub mod search;
/// Flattened vector storage and the distance oracle.
pub mod store;

pub use distance::DistanceKind;
pub use error::{Error, Result};
pub use index::{DataType, Index, IndexOptions, SearchOptions, SearchStats};
pub use search::{Filter, IteratorContext, SearchResult};
pub use store::CodecKind;

//! Proximity graph storage and traversal support.

pub mod store;
pub mod visited;

pub use store::GraphStore;
pub use visited::{VisitedPool, VisitedSet};

//! Graph construction.

pub mod odescent;

pub use odescent::{Odescent, OdescentOptions};

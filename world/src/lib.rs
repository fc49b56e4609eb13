//! The primordia grid environment.
//!
//! Dense n-dimensional storage of packed molecules plus the sparse indices
//! the sampler and the organisms rely on: the occupancy set, the per-owner
//! cell sets and the dirty bitset consumed by the chunk encoder. All three
//! are maintained in lock-step with every mutation; a mutation never returns
//! with a partially updated index.

mod world;

pub use world::{LabelIndexHook, World};

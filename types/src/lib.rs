//! Provides the essential types for primordia.
//!
//! Everything that crosses a crate or queue boundary lives here: the packed
//! molecule representation, grid space math, the sampled-tick wire records
//! and the self-describing envelope they travel in.

mod bitset;
mod chunk;
mod envelope;
mod message;
mod molecule;
pub mod service;
mod space;
mod state;

pub use bitset::{bitset_bytes, bitset_indices, ChangeTracker};
pub use chunk::{ChangedCell, SampleKind, TickData, TickDataChunk, TickSample};
pub use envelope::{Envelope, WireMessage};
pub use message::{BatchInfo, ProgramArtifact, SimulationMetadata, StoragePath};
pub use molecule::{Molecule, MoleculeType, MARKER_MAX, VALUE_MAX, VALUE_MIN};
pub use space::{lex_cmp, Shape, Topology};
pub use state::{LastExecution, OrganismState, PluginState, ProcFrame, RegValue};

/// Simulation tick number.
pub type Tick = u64;
/// Organism identifier, doubles as the cell owner id; 0 means unowned.
pub type OwnerId = u32;

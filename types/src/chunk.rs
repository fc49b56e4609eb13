//! Sampled-tick records and the self-contained chunk.

use crate::state::{OrganismState, PluginState};
use serde::{Deserialize, Serialize};

/// One cell of the grid on the wire: flat index plus both planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedCell {
    /// Flat grid index
    pub index: u32,
    /// Packed molecule
    pub molecule: u32,
    /// Owner id, 0 when unowned
    pub owner: u32,
}

/// Full state of one sampled tick; the opening record of every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickData {
    /// Tick this state belongs to
    pub tick_number: u64,
    /// Every occupied cell, sorted by flat index
    pub cells: Vec<ChangedCell>,
    /// All living organisms
    pub organisms: Vec<OrganismState>,
    /// One record per unique plugin instance
    pub plugins: Vec<PluginState>,
    /// Serialized random provider state
    pub rng_state: Vec<u8>,
}

/// Discriminates the per-sample record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleKind {
    /// Full environment state
    Snapshot,
    /// Cell changes since the last snapshot
    AccumulatedDelta,
    /// Cell changes since the previous sample
    IncrementalDelta,
}

/// One sampled tick inside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSample {
    /// Record kind
    pub kind: SampleKind,
    /// Tick this sample belongs to
    pub tick_number: u64,
    /// Bitset of the changed flat indices
    pub changed_indices: Vec<u8>,
    /// Changed cells, sorted by flat index
    pub changed_cells: Vec<ChangedCell>,
    /// All living organisms
    pub organisms: Vec<OrganismState>,
    /// One record per unique plugin instance
    pub plugins: Vec<PluginState>,
    /// Serialized random provider state
    pub rng_state: Vec<u8>,
}

/// A self-contained batch of sampled ticks.
///
/// Replaying `samples` in order, starting from the opening snapshot,
/// reconstructs every sampled tick the chunk covers without data from any
/// other chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickDataChunk {
    /// Simulation run this chunk belongs to
    pub run_id: String,
    /// Cell count of the world, fixed per run
    pub total_cells: u32,
    /// First sampled tick covered
    pub first_tick: u64,
    /// Last sampled tick covered
    pub last_tick: u64,
    /// Number of samples
    pub tick_count: u32,
    /// The opening snapshot
    pub snapshot: TickData,
    /// The sample sequence; position 0 is the snapshot record
    pub samples: Vec<TickSample>,
}

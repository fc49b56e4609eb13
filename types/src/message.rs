//! Per-run and per-batch control messages.

use serde::{Deserialize, Serialize};

/// Storage addressing string, run-id-prefixed, e.g. `<run_id>/batch-0-800`.
pub type StoragePath = String;

/// An opaque compiled program artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramArtifact {
    /// Program identifier referenced by organisms
    pub program_id: String,
    /// Compiler output, opaque to the pipeline
    pub artifact: Vec<u8>,
}

/// Emitted exactly once per run, before the first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationMetadata {
    /// Run identifier
    pub simulation_run_id: String,
    /// Wall time the run started, unix millis
    pub start_time_ms: u64,
    /// Seed of the deterministic random provider
    pub initial_seed: i64,
    /// Program artifacts loaded into the run
    pub programs: Vec<ProgramArtifact>,
    /// The resolved configuration, serialized to JSON
    pub resolved_config_json: String,
}

/// Published after a batch of chunks has been written to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// Run identifier
    pub simulation_run_id: String,
    /// Where the batch file landed
    pub storage_path: StoragePath,
    /// First tick covered by the batch
    pub tick_start: u64,
    /// Last tick covered by the batch
    pub tick_end: u64,
    /// Wall time of the write, unix millis
    pub written_at_ms: u64,
}

use primordia_error::{Error, ErrorKind};
use primordia_types::{
    bitset_bytes, ChangedCell, OrganismState, PluginState, SampleKind, Tick, TickData,
    TickDataChunk, TickSample,
};
use std::collections::BTreeMap;

/// Pacing intervals, all measured in samples.
#[derive(Debug, Clone, Copy)]
pub struct EncoderParams {
    /// Snapshot every `snapshot_interval` samples
    pub snapshot_interval: u32,
    /// Accumulated delta every `accumulated_delta_interval` samples
    pub accumulated_delta_interval: u32,
    /// Samples per chunk
    pub chunk_interval: u32,
}

impl EncoderParams {
    fn validate(&self) -> Result<(), Error> {
        let EncoderParams {
            snapshot_interval: s,
            accumulated_delta_interval: a,
            chunk_interval: c,
        } = *self;
        if a < 1 {
            return Err(ErrorKind::ConfigInvalid.other("accumulated delta interval must be >= 1"));
        }
        if s < 1 || s % a != 0 {
            return Err(ErrorKind::ConfigInvalid.other(format!(
                "snapshot interval {} is not a positive multiple of accumulated delta interval {}",
                s, a
            )));
        }
        if c < 1 || c % s != 0 {
            return Err(ErrorKind::ConfigInvalid.other(format!(
                "chunk interval {} is not a positive multiple of snapshot interval {}",
                c, s
            )));
        }
        Ok(())
    }
}

/// One sampled tick handed to the encoder.
///
/// `changed_cells` are the cells dirtied since the previous sample, sorted
/// by flat index; the caller resets its tracker when it extracts them.
pub struct SampleInput {
    /// Tick being sampled
    pub tick: Tick,
    /// Cells dirtied since the previous sample, sorted by index
    pub changed_cells: Vec<ChangedCell>,
    /// All living organisms
    pub organisms: Vec<OrganismState>,
    /// One record per unique plugin instance
    pub plugins: Vec<PluginState>,
    /// Serialized random provider state
    pub rng_state: Vec<u8>,
}

/// The pacing state machine.
///
/// Holds at most one chunk in flight. `capture` returns the finished chunk
/// when the sample completing it is appended; a partially filled chunk is
/// simply dropped with the encoder on shutdown.
pub struct ChunkEncoder {
    run_id: String,
    total_cells: u32,
    params: EncoderParams,
    /// union of changes since the last snapshot, keyed by flat index
    accumulated: BTreeMap<u32, ChangedCell>,
    snapshot: Option<TickData>,
    samples: Vec<TickSample>,
}

impl ChunkEncoder {
    /// Creates an encoder for a fresh run.
    pub fn new(run_id: String, total_cells: u32, params: EncoderParams) -> Result<ChunkEncoder, Error> {
        params.validate()?;
        Ok(ChunkEncoder {
            run_id,
            total_cells,
            params,
            accumulated: BTreeMap::new(),
            snapshot: None,
            samples: Vec::with_capacity(params.chunk_interval as usize),
        })
    }

    /// Creates an encoder primed with a resume snapshot: the state is as if
    /// that snapshot had just been captured, so subsequent captures continue
    /// the original chunk as deltas.
    pub fn with_resume(
        run_id: String,
        total_cells: u32,
        params: EncoderParams,
        resume: TickData,
    ) -> Result<ChunkEncoder, Error> {
        let mut encoder = ChunkEncoder::new(run_id, total_cells, params)?;
        encoder.samples.push(snapshot_sample(&resume));
        encoder.snapshot = Some(resume);
        Ok(encoder)
    }

    /// Samples per chunk.
    pub fn samples_per_chunk(&self) -> u32 {
        self.params.chunk_interval
    }

    /// Number of samples buffered for the chunk in flight.
    pub fn pending_samples(&self) -> usize {
        self.samples.len()
    }

    /// Appends one sampled tick.
    ///
    /// `full_state` is only invoked when the pacing calls for a snapshot; it
    /// must return every occupied cell sorted by flat index. Returns the
    /// finished chunk when this sample completes it.
    pub fn capture<F>(&mut self, input: SampleInput, full_state: F) -> Option<TickDataChunk>
    where
        F: FnOnce() -> Vec<ChangedCell>,
    {
        let position = self.samples.len() as u32;
        let SampleInput {
            tick,
            changed_cells,
            organisms,
            plugins,
            rng_state,
        } = input;

        if position % self.params.snapshot_interval == 0 {
            let data = TickData {
                tick_number: tick,
                cells: full_state(),
                organisms,
                plugins,
                rng_state,
            };
            self.accumulated.clear();
            self.samples.push(snapshot_sample(&data));
            if position == 0 {
                self.snapshot = Some(data);
            }
        } else {
            for cell in &changed_cells {
                self.accumulated.insert(cell.index, *cell);
            }
            let (kind, cells) = if position % self.params.accumulated_delta_interval == 0 {
                (
                    SampleKind::AccumulatedDelta,
                    self.accumulated.values().copied().collect::<Vec<_>>(),
                )
            } else {
                (SampleKind::IncrementalDelta, changed_cells)
            };
            let indices: Vec<u32> = cells.iter().map(|cell| cell.index).collect();
            self.samples.push(TickSample {
                kind,
                tick_number: tick,
                changed_indices: bitset_bytes(&indices),
                changed_cells: cells,
                organisms,
                plugins,
                rng_state,
            });
        }

        if self.samples.len() as u32 == self.params.chunk_interval {
            return Some(self.finish_chunk());
        }
        None
    }

    fn finish_chunk(&mut self) -> TickDataChunk {
        let samples = std::mem::replace(
            &mut self.samples,
            Vec::with_capacity(self.params.chunk_interval as usize),
        );
        let snapshot = self.snapshot.take().expect("chunk always opens with a snapshot");
        self.accumulated.clear();
        TickDataChunk {
            run_id: self.run_id.clone(),
            total_cells: self.total_cells,
            first_tick: samples.first().expect("chunk is non-empty").tick_number,
            last_tick: samples.last().expect("chunk is non-empty").tick_number,
            tick_count: samples.len() as u32,
            snapshot,
            samples,
        }
    }
}

fn snapshot_sample(data: &TickData) -> TickSample {
    let indices: Vec<u32> = data.cells.iter().map(|cell| cell.index).collect();
    TickSample {
        kind: SampleKind::Snapshot,
        tick_number: data.tick_number,
        changed_indices: bitset_bytes(&indices),
        changed_cells: data.cells.clone(),
        organisms: data.organisms.clone(),
        plugins: data.plugins.clone(),
        rng_state: data.rng_state.clone(),
    }
}

//! Chunk replay.
//!
//! Reconstructs every sampled tick of a chunk from the data inside the
//! chunk alone: the opening snapshot, accumulated deltas re-based on it and
//! incremental deltas applied on the running state. Downstream analysers
//! and the self-containment checks both go through here.

use primordia_error::{Error, ErrorKind};
use primordia_types::{ChangedCell, SampleKind, TickDataChunk, TickSample};
use std::collections::BTreeMap;

/// One reconstructed tick handed to the replay consumer.
pub struct ReplayedTick<'a> {
    /// Tick number of the sample
    pub tick_number: u64,
    /// Full cell state at this tick, keyed by flat index
    pub cells: &'a BTreeMap<u32, ChangedCell>,
    /// The underlying sample record
    pub sample: &'a TickSample,
}

/// Replays `chunk` in order, invoking `consumer` once per sample with the
/// fully reconstructed cell state.
///
/// Fails when the chunk does not open with a snapshot or when a sample's
/// index bitset disagrees with its cell list, both of which mean the chunk
/// was corrupted in flight.
pub fn replay<F>(chunk: &TickDataChunk, mut consumer: F) -> Result<(), Error>
where
    F: FnMut(ReplayedTick<'_>),
{
    let first = chunk
        .samples
        .first()
        .ok_or_else(|| ErrorKind::DeserializationFailed.other("chunk has no samples"))?;
    if first.kind != SampleKind::Snapshot {
        return Err(ErrorKind::DeserializationFailed.other("chunk does not open with a snapshot"));
    }

    let mut snapshot_state: BTreeMap<u32, ChangedCell> = BTreeMap::new();
    let mut current: BTreeMap<u32, ChangedCell> = BTreeMap::new();

    for sample in &chunk.samples {
        verify_bitset(sample)?;
        match sample.kind {
            SampleKind::Snapshot => {
                current = sample
                    .changed_cells
                    .iter()
                    .map(|cell| (cell.index, *cell))
                    .collect();
                snapshot_state = current.clone();
            }
            SampleKind::AccumulatedDelta => {
                current = snapshot_state.clone();
                for cell in &sample.changed_cells {
                    current.insert(cell.index, *cell);
                }
            }
            SampleKind::IncrementalDelta => {
                for cell in &sample.changed_cells {
                    current.insert(cell.index, *cell);
                }
            }
        }
        // cells cleared back to empty stay in the map as explicit zeroes;
        // they still describe the same grid
        consumer(ReplayedTick {
            tick_number: sample.tick_number,
            cells: &current,
            sample,
        });
    }
    Ok(())
}

fn verify_bitset(sample: &TickSample) -> Result<(), Error> {
    let from_bits = primordia_types::bitset_indices(&sample.changed_indices);
    let from_cells: Vec<u32> = sample.changed_cells.iter().map(|cell| cell.index).collect();
    if from_bits != from_cells {
        return Err(ErrorKind::DeserializationFailed.other(format!(
            "sample at tick {} has inconsistent change indices",
            sample.tick_number
        )));
    }
    Ok(())
}

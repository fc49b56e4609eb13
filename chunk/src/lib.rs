//! Delta-compression chunk encoder.
//!
//! Converts the stream of sampled ticks into self-contained chunks. Every
//! chunk opens with a full snapshot and continues with deltas, so a chunk
//! can be replayed on its own: apply the snapshot, then each sample in
//! order. Pacing is controlled by three intervals measured in samples:
//! snapshots every `S`, accumulated deltas every `A` in between, incremental
//! deltas for the rest, `C` samples per chunk.

mod encoder;
mod replay;

pub use encoder::{ChunkEncoder, EncoderParams, SampleInput};
pub use replay::{replay, ReplayedTick};

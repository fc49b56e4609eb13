//! Immutable batch files.
//!
//! Each committed batch lands in one file under `<root>/<run_id>/`, written
//! to a temporary name and renamed on finish so a crash never leaves a
//! half-written batch addressable. Chunks are concatenated in emit order as
//! snappy-compressed, length-prefixed envelope frames, and read back one at
//! a time.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use primordia_error::{Error, ErrorKind};
use primordia_logger::debug;
use primordia_types::{Envelope, StoragePath, TickDataChunk};
use snap::raw::{Decoder as SnappyDecoder, Encoder as SnappyEncoder};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Streaming writer for one batch file.
pub trait BatchWriter: Send {
    /// Appends one chunk frame.
    fn write_chunk(&mut self, chunk: &TickDataChunk) -> Result<(), Error>;

    /// Flushes, seals and addresses the file.
    fn finish(self: Box<Self>, last_tick: u64) -> Result<StoragePath, Error>;

    /// Drops the half-written file.
    fn abort(self: Box<Self>);
}

/// Batch file storage collaborator of the persistence service.
pub trait BatchStorage: Send + Sync {
    /// Opens a writer for a batch starting at `first_tick`.
    fn open_batch(&self, run_id: &str, first_tick: u64) -> Result<Box<dyn BatchWriter>, Error>;
}

/// Filesystem-backed batch storage.
pub struct FileBatchStorage {
    root: PathBuf,
}

impl FileBatchStorage {
    /// Creates storage rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> FileBatchStorage {
        FileBatchStorage { root: root.into() }
    }

    /// Streams the chunks of a previously written batch.
    pub fn read_chunks(&self, storage_path: &str) -> Result<ChunkFileIter, Error> {
        ChunkFileIter::open(self.root.join(storage_path))
    }

    /// Lists the sealed batches of a run, ordered by first tick. Unsealed
    /// temporaries are not addressable and never show up here.
    pub fn list_batches(&self, run_id: &str) -> Result<Vec<StoragePath>, Error> {
        let dir = self.root.join(run_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ErrorKind::ResourceUnavailable.because(e)),
        };
        let mut batches: Vec<(u64, String)> = Vec::new();
        for entry in entries {
            let name = entry.map_err(|e| ErrorKind::ResourceUnavailable.because(e))?.file_name();
            let name = name.to_string_lossy().into_owned();
            let first_tick = name
                .strip_prefix("batch-")
                .and_then(|rest| rest.split('-').next())
                .and_then(|first| first.parse::<u64>().ok());
            if let Some(first_tick) = first_tick {
                if !name.ends_with(".tmp") {
                    batches.push((first_tick, name));
                }
            }
        }
        batches.sort();
        Ok(batches
            .into_iter()
            .map(|(_, name)| format!("{}/{}", run_id, name))
            .collect())
    }
}

impl BatchStorage for FileBatchStorage {
    fn open_batch(&self, run_id: &str, first_tick: u64) -> Result<Box<dyn BatchWriter>, Error> {
        let dir = self.root.join(run_id);
        fs::create_dir_all(&dir).map_err(write_failed)?;
        let tmp_path = dir.join(format!("batch-{}.tmp", first_tick));
        let file = File::create(&tmp_path).map_err(write_failed)?;
        Ok(Box::new(FileBatchWriter {
            run_id: run_id.to_string(),
            first_tick,
            dir,
            tmp_path,
            writer: Some(BufWriter::new(file)),
        }))
    }
}

struct FileBatchWriter {
    run_id: String,
    first_tick: u64,
    dir: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl BatchWriter for FileBatchWriter {
    fn write_chunk(&mut self, chunk: &TickDataChunk) -> Result<(), Error> {
        let writer = self.writer.as_mut().expect("writer lives until finish or abort");
        let frame = Envelope::pack(chunk)?.encode()?;
        let compressed = SnappyEncoder::new()
            .compress_vec(&frame)
            .map_err(|e| ErrorKind::BatchWriteFailed.other(format!("compress: {}", e)))?;
        writer
            .write_u32::<LittleEndian>(compressed.len() as u32)
            .map_err(write_failed)?;
        writer.write_all(&compressed).map_err(write_failed)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>, last_tick: u64) -> Result<StoragePath, Error> {
        let writer = self.writer.take().expect("finish runs once");
        let file = writer
            .into_inner()
            .map_err(|e| ErrorKind::BatchWriteFailed.other(format!("flush: {}", e)))?;
        file.sync_all().map_err(write_failed)?;
        drop(file);

        let final_name = format!("batch-{}-{}", self.first_tick, last_tick);
        let final_path = self.dir.join(&final_name);
        fs::rename(&self.tmp_path, &final_path).map_err(write_failed)?;
        debug!("sealed batch file {}", final_path.display());
        Ok(format!("{}/{}", self.run_id, final_name))
    }

    fn abort(mut self: Box<Self>) {
        self.writer.take();
        let _ = fs::remove_file(&self.tmp_path);
    }
}

fn write_failed(e: std::io::Error) -> Error {
    ErrorKind::BatchWriteFailed.because(e)
}

/// Streaming reader over the chunks of one batch file, one chunk
/// materialised at a time.
pub struct ChunkFileIter {
    reader: BufReader<File>,
}

impl ChunkFileIter {
    fn open<P: AsRef<Path>>(path: P) -> Result<ChunkFileIter, Error> {
        let file = File::open(path.as_ref()).map_err(|e| {
            ErrorKind::ResourceUnavailable
                .other(format!("batch file {}: {}", path.as_ref().display(), e))
        })?;
        Ok(ChunkFileIter {
            reader: BufReader::new(file),
        })
    }
}

impl Iterator for ChunkFileIter {
    type Item = Result<TickDataChunk, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = match self.reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            // clean end of file
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(ErrorKind::DeserializationFailed.because(e))),
        };
        let mut compressed = vec![0u8; len as usize];
        if let Err(e) = self.reader.read_exact(&mut compressed) {
            return Some(Err(ErrorKind::DeserializationFailed.because(e)));
        }
        let frame = match SnappyDecoder::new().decompress_vec(&compressed) {
            Ok(frame) => frame,
            Err(e) => {
                return Some(Err(
                    ErrorKind::DeserializationFailed.other(format!("decompress: {}", e))
                ))
            }
        };
        Some(Envelope::decode(&frame).and_then(|envelope| envelope.unpack::<TickDataChunk>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primordia_types::TickData;

    fn chunk(first: u64, count: u32) -> TickDataChunk {
        let snapshot = TickData {
            tick_number: first,
            cells: Vec::new(),
            organisms: Vec::new(),
            plugins: Vec::new(),
            rng_state: vec![1, 2, 3],
        };
        TickDataChunk {
            run_id: "run-7".to_string(),
            total_cells: 16,
            first_tick: first,
            last_tick: first + u64::from(count) - 1,
            tick_count: count,
            snapshot,
            samples: Vec::new(),
        }
    }

    #[test]
    fn write_seal_and_stream_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileBatchStorage::new(dir.path());

        let mut writer = storage.open_batch("run-7", 0).unwrap();
        writer.write_chunk(&chunk(0, 8)).unwrap();
        writer.write_chunk(&chunk(8, 8)).unwrap();
        let path = writer.finish(15).unwrap();
        assert_eq!(path, "run-7/batch-0-15");

        let chunks: Vec<TickDataChunk> = storage
            .read_chunks(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].first_tick, 0);
        assert_eq!(chunks[1].first_tick, 8);
    }

    #[test]
    fn listing_orders_by_first_tick_and_skips_temporaries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileBatchStorage::new(dir.path());

        let mut writer = storage.open_batch("run-7", 80).unwrap();
        writer.write_chunk(&chunk(80, 8)).unwrap();
        writer.finish(87).unwrap();

        let mut writer = storage.open_batch("run-7", 0).unwrap();
        writer.write_chunk(&chunk(0, 8)).unwrap();
        writer.finish(7).unwrap();

        // an unsealed batch stays invisible
        let mut unsealed = storage.open_batch("run-7", 200).unwrap();
        unsealed.write_chunk(&chunk(200, 8)).unwrap();

        assert_eq!(
            storage.list_batches("run-7").unwrap(),
            vec!["run-7/batch-0-7".to_string(), "run-7/batch-80-87".to_string()]
        );
        assert!(storage.list_batches("run-unknown").unwrap().is_empty());
        unsealed.abort();
    }

    #[test]
    fn abort_leaves_no_addressable_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileBatchStorage::new(dir.path());
        let mut writer = storage.open_batch("run-7", 42).unwrap();
        writer.write_chunk(&chunk(42, 4)).unwrap();
        writer.abort();
        assert!(fs::read_dir(dir.path().join("run-7"))
            .unwrap()
            .next()
            .is_none());
    }

    #[test]
    fn truncated_file_surfaces_as_deserialization_failure() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileBatchStorage::new(dir.path());
        let mut writer = storage.open_batch("run-7", 0).unwrap();
        writer.write_chunk(&chunk(0, 8)).unwrap();
        let path = writer.finish(7).unwrap();

        let file_path = dir.path().join(&path);
        let bytes = fs::read(&file_path).unwrap();
        fs::write(&file_path, &bytes[..bytes.len() - 3]).unwrap();

        let results: Vec<_> = storage.read_chunks(&path).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].as_ref().unwrap_err().kind(),
            ErrorKind::DeserializationFailed
        );
    }
}

//! Segmented journal storage.
//!
//! Records are snappy-compressed and appended as length-prefixed frames to
//! rolling segment files, each named after the first sequence it holds
//! (`seg-<base>.jrn`). The backlog is bounded by the producers' BLOCK
//! policy, so per-record offsets live in memory and are rebuilt by scanning
//! the segments on open; there is no separate index to keep in sync. A torn
//! trailing frame left by a crash is truncated away during that scan — it
//! can only exist in the newest segment, anywhere else it means the chain
//! is corrupt. Pruning deletes whole segments that fell below the ack
//! cursor.

use lru::LruCache;
use primordia_logger::{debug, warn};
use snap::raw::{Decoder as SnappyDecoder, Encoder as SnappyEncoder};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bytes of the per-record frame header, a little-endian length prefix.
pub(crate) const FRAME_HEADER_LEN: u64 = 4;

const DEFAULT_SEGMENT_ROLL_BYTES: u64 = 64 * 1024 * 1024;
const READER_CACHE_SIZE: usize = 8;
const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".jrn";

/// In-memory map of one segment file: where each of its frames starts.
struct Segment {
    /// First sequence stored in this segment
    base: u64,
    /// Frame start offset per record, in sequence order
    starts: Vec<u64>,
    /// Bytes of whole frames in the file
    len: u64,
}

impl Segment {
    /// One past the last sequence stored here.
    fn end_seq(&self) -> u64 {
        self.base + self.starts.len() as u64
    }

    /// Frame byte range of `seq`, when this segment holds it.
    fn frame_bounds(&self, seq: u64) -> Option<(u64, u64)> {
        let idx = seq.checked_sub(self.base)? as usize;
        let start = *self.starts.get(idx)?;
        let end = self.starts.get(idx + 1).copied().unwrap_or(self.len);
        Some((start, end))
    }
}

/// The on-disk record log backing the journaled broker: dense sequence
/// numbers, append at the head, random reads for lazy batch iteration,
/// whole-segment pruning behind the ack cursor.
pub(crate) struct SegmentedJournal {
    dir: PathBuf,
    segments: BTreeMap<u64, Segment>,
    /// Segment still accepting appends; sealed segments are read only
    active_base: Option<u64>,
    /// Append handle of the active segment, opened on first write
    writer: Option<File>,
    /// Read-only handles; never the writer, so reads cannot move its cursor
    readers: LruCache<u64, File>,
    next_seq: u64,
    roll_bytes: u64,
}

impl SegmentedJournal {
    /// Opens (or creates) the journal rooted at `dir`.
    pub(crate) fn open(dir: PathBuf) -> Result<SegmentedJournal, IoError> {
        SegmentedJournal::open_with_roll(dir, DEFAULT_SEGMENT_ROLL_BYTES)
    }

    /// Opens with an explicit segment roll size.
    pub(crate) fn open_with_roll(
        dir: PathBuf,
        roll_bytes: u64,
    ) -> Result<SegmentedJournal, IoError> {
        fs::create_dir_all(&dir)?;
        let mut bases: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            if let Some(base) = parse_segment_name(&name.to_string_lossy()) {
                bases.push(base);
            }
        }
        bases.sort_unstable();

        // the oldest segment sets the starting sequence (everything before
        // it was pruned); from there the chain must be dense
        let mut segments = BTreeMap::new();
        let mut next_seq = bases.first().copied().unwrap_or(0);
        for (position, &base) in bases.iter().enumerate() {
            if base != next_seq {
                return Err(IoError::new(
                    IoErrorKind::InvalidData,
                    format!("journal segment chain gap before sequence {}", base),
                ));
            }
            let newest = position + 1 == bases.len();
            let segment = scan_segment(&segment_path_in(&dir, base), base, newest)?;
            next_seq = segment.end_seq();
            segments.insert(base, segment);
        }
        let active_base = segments.keys().next_back().copied();
        debug!(
            "journal opened with {} segments, next sequence {}",
            segments.len(),
            next_seq
        );

        Ok(SegmentedJournal {
            dir,
            segments,
            active_base,
            writer: None,
            readers: LruCache::new(READER_CACHE_SIZE),
            next_seq,
            roll_bytes,
        })
    }

    /// Total records ever appended; sequences below this may be pruned.
    #[inline]
    pub(crate) fn count(&self) -> u64 {
        self.next_seq
    }

    /// Appends one record, rolling to a fresh segment when the active one
    /// is full. Returns the assigned sequence and the stored frame size.
    pub(crate) fn append(&mut self, payload: &[u8]) -> Result<(u64, u64), IoError> {
        let compressed = SnappyEncoder::new()
            .compress_vec(payload)
            .map_err(|e| IoError::new(IoErrorKind::Other, format!("compress record: {}", e)))?;
        let frame_len = FRAME_HEADER_LEN + compressed.len() as u64;

        if let Some(base) = self.active_base {
            let segment = self.segments.get(&base).expect("active segment is tracked");
            // a single oversized frame still goes into an empty segment
            if !segment.starts.is_empty() && segment.len + frame_len > self.roll_bytes {
                self.seal_active()?;
            }
        }
        if self.active_base.is_none() {
            self.start_segment()?;
        }
        let base = self.active_base.expect("segment started above");
        if self.writer.is_none() {
            self.writer = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.segment_path(base))?,
            );
        }
        let writer = self.writer.as_mut().expect("writer opened above");
        writer.write_all(&(compressed.len() as u32).to_le_bytes())?;
        writer.write_all(&compressed)?;

        let segment = self.segments.get_mut(&base).expect("active segment is tracked");
        segment.starts.push(segment.len);
        segment.len += frame_len;

        let seq = self.next_seq;
        self.next_seq += 1;
        Ok((seq, frame_len))
    }

    /// Reads record `seq` back; `None` when it was never written or its
    /// segment has been pruned.
    pub(crate) fn read(&mut self, seq: u64) -> Result<Option<Vec<u8>>, IoError> {
        let (base, start, end) = match self.locate(seq) {
            Some(bounds) => bounds,
            None => return Ok(None),
        };
        if !self.readers.contains(&base) {
            let file = File::open(self.segment_path(base))?;
            self.readers.put(base, file);
        }
        let file = self.readers.get_mut(&base).expect("reader cached above");

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut header)?;
        let compressed_len = u64::from(u32::from_le_bytes(header));
        debug_assert_eq!(FRAME_HEADER_LEN + compressed_len, end - start);

        let mut compressed = vec![0u8; compressed_len as usize];
        file.read_exact(&mut compressed)?;
        SnappyDecoder::new()
            .decompress_vec(&compressed)
            .map(Some)
            .map_err(|e| {
                IoError::new(
                    IoErrorKind::InvalidData,
                    format!("decompress record {}: {}", seq, e),
                )
            })
    }

    /// Stored frame size of `seq`, when it is still on disk.
    pub(crate) fn stored_size(&self, seq: u64) -> Option<u64> {
        self.locate(seq).map(|(_, start, end)| end - start)
    }

    /// Deletes segments whose every record sits below `seq`. The active
    /// segment is never deleted.
    pub(crate) fn prune_below(&mut self, seq: u64) -> Result<(), IoError> {
        let doomed: Vec<u64> = self
            .segments
            .values()
            .filter(|segment| segment.end_seq() <= seq && Some(segment.base) != self.active_base)
            .map(|segment| segment.base)
            .collect();
        for base in doomed {
            self.segments.remove(&base);
            self.readers.pop(&base);
            let path = self.segment_path(base);
            fs::remove_file(&path)?;
            debug!("pruned journal segment {}", path.display());
        }
        Ok(())
    }

    fn locate(&self, seq: u64) -> Option<(u64, u64, u64)> {
        let (base, segment) = self.segments.range(..=seq).next_back()?;
        let (start, end) = segment.frame_bounds(seq)?;
        Some((*base, start, end))
    }

    fn seal_active(&mut self) -> Result<(), IoError> {
        if let Some(writer) = self.writer.take() {
            writer.sync_all()?;
        }
        self.active_base = None;
        Ok(())
    }

    fn start_segment(&mut self) -> Result<(), IoError> {
        let base = self.next_seq;
        self.writer = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.segment_path(base))?,
        );
        self.segments.insert(
            base,
            Segment {
                base,
                starts: Vec::new(),
                len: 0,
            },
        );
        self.active_base = Some(base);
        Ok(())
    }

    fn segment_path(&self, base: u64) -> PathBuf {
        segment_path_in(&self.dir, base)
    }
}

fn segment_path_in(dir: &Path, base: u64) -> PathBuf {
    dir.join(format!("{}{:020}{}", SEGMENT_PREFIX, base, SEGMENT_SUFFIX))
}

fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Walks the frames of one segment file, rebuilding its offset table.
///
/// A frame that runs past the end of the file is torn: truncated away in
/// the newest segment, fatal anywhere else.
fn scan_segment(path: &Path, base: u64, newest: bool) -> Result<Segment, IoError> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    let mut starts = Vec::new();
    let mut offset = 0u64;
    let torn_at = loop {
        if offset == file_len {
            break None;
        }
        if offset + FRAME_HEADER_LEN > file_len {
            break Some(offset);
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut header)?;
        let frame_len = FRAME_HEADER_LEN + u64::from(u32::from_le_bytes(header));
        if offset + frame_len > file_len {
            break Some(offset);
        }
        starts.push(offset);
        offset += frame_len;
    };
    if let Some(torn_at) = torn_at {
        if !newest {
            return Err(IoError::new(
                IoErrorKind::InvalidData,
                format!("torn frame at {} inside sealed segment {}", torn_at, base),
            ));
        }
        warn!("dropping torn frame at {} in journal segment {}", torn_at, base);
        OpenOptions::new().write(true).open(path)?.set_len(torn_at)?;
    }
    Ok(Segment {
        base,
        starts,
        len: offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(size: usize, byte: u8) -> Vec<u8> {
        vec![byte; size]
    }

    fn segment_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|entry| {
                parse_segment_name(&entry.as_ref().unwrap().file_name().to_string_lossy())
                    .is_some()
            })
            .count()
    }

    #[test]
    fn roundtrip_across_rolls() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal =
            SegmentedJournal::open_with_roll(dir.path().to_path_buf(), 64).unwrap();

        for i in 0..50u64 {
            let (seq, stored) = journal.append(&payload(24, (i % 251) as u8)).unwrap();
            assert_eq!(seq, i);
            assert!(stored > FRAME_HEADER_LEN);
        }
        assert_eq!(journal.count(), 50);
        assert!(segment_files(dir.path()) > 1);

        for i in 0..50u64 {
            let expect = payload(24, (i % 251) as u8);
            assert_eq!(journal.read(i).unwrap().unwrap(), expect);
        }
        assert!(journal.read(50).unwrap().is_none());
    }

    #[test]
    fn reopen_continues_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut journal = SegmentedJournal::open(dir.path().to_path_buf()).unwrap();
            for i in 0..5u64 {
                journal.append(&payload(8, i as u8)).unwrap();
            }
        }
        let mut journal = SegmentedJournal::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(journal.count(), 5);
        assert_eq!(journal.append(&payload(8, 5)).unwrap().0, 5);
        assert_eq!(journal.read(2).unwrap().unwrap(), payload(8, 2));
        assert_eq!(journal.read(5).unwrap().unwrap(), payload(8, 5));
        // still one segment, the reopened journal kept appending to it
        assert_eq!(segment_files(dir.path()), 1);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut journal = SegmentedJournal::open(dir.path().to_path_buf()).unwrap();
            for i in 0..3u64 {
                journal.append(&payload(8, i as u8)).unwrap();
            }
        }
        // a crash mid-write: a frame header promising more than the file has
        let path = segment_path_in(dir.path(), 0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[0xEE; 3]).unwrap();
        drop(file);

        let mut journal = SegmentedJournal::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(journal.count(), 3);
        assert_eq!(journal.read(2).unwrap().unwrap(), payload(8, 2));
        // the truncated journal accepts appends again
        assert_eq!(journal.append(&payload(8, 9)).unwrap().0, 3);
        assert_eq!(journal.read(3).unwrap().unwrap(), payload(8, 9));
    }

    #[test]
    fn torn_sealed_segment_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut journal =
                SegmentedJournal::open_with_roll(dir.path().to_path_buf(), 32).unwrap();
            for i in 0..12u64 {
                journal.append(&payload(16, i as u8)).unwrap();
            }
            assert!(segment_files(dir.path()) > 1);
        }
        let oldest = segment_path_in(dir.path(), 0);
        let len = fs::metadata(&oldest).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&oldest)
            .unwrap()
            .set_len(len - 2)
            .unwrap();

        let err = match SegmentedJournal::open(dir.path().to_path_buf()) {
            Err(err) => err,
            Ok(_) => panic!("expected corrupted segment to be rejected"),
        };
        assert_eq!(err.kind(), IoErrorKind::InvalidData);
    }

    #[test]
    fn chain_gap_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut middle = None;
        {
            let mut journal =
                SegmentedJournal::open_with_roll(dir.path().to_path_buf(), 32).unwrap();
            for i in 0..20u64 {
                let (seq, _) = journal.append(&payload(16, i as u8)).unwrap();
                if seq == 8 {
                    middle = journal.locate(8).map(|(base, _, _)| base);
                }
            }
        }
        // removing the oldest segments is pruning; a hole in the middle is not
        let middle = middle.expect("record 8 was written");
        assert!(middle > 0);
        fs::remove_file(segment_path_in(dir.path(), middle)).unwrap();
        assert!(SegmentedJournal::open(dir.path().to_path_buf()).is_err());
    }

    #[test]
    fn prune_drops_whole_acked_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal =
            SegmentedJournal::open_with_roll(dir.path().to_path_buf(), 32).unwrap();
        for i in 0..20u64 {
            journal.append(&payload(16, i as u8)).unwrap();
        }
        let before = segment_files(dir.path());
        assert!(before > 2);

        journal.prune_below(18).unwrap();
        assert!(segment_files(dir.path()) < before);
        // pruned records are gone, the rest stays readable
        assert!(journal.read(0).unwrap().is_none());
        assert!(journal.stored_size(0).is_none());
        assert_eq!(journal.read(19).unwrap().unwrap(), payload(16, 19));
        assert_eq!(journal.count(), 20);
    }
}

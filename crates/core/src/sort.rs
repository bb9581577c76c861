//! External merge sort for memory-bounded feature ordering.
//!
//! Tile generation needs every feature of a tile delivered together, in
//! sort-key order, from inputs that can be billions of records. This module
//! provides disk-backed sorting bounded by a configurable chunk budget:
//!
//! 1. Records accumulate in an in-memory chunk until the byte budget or the
//!    entry cap is exceeded.
//! 2. The chunk is sorted by 64-bit key (optionally across several threads)
//!    and written to a run file as `u64 LE key | varint length | value bytes`.
//! 3. When only one chunk ever existed it is retained in memory; otherwise
//!    iteration opens a k-way merge over all run files seeded through a
//!    min-heap, ties broken by run index.
//!
//! Run files live under a caller-supplied scratch directory, are owned
//! exclusively by the sorter, and are deleted when it is dropped. I/O errors
//! during spill or merge are fatal; a truncated run tail is detected when the
//! merge opens and rejects the whole run.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::feature::SortableFeature;
use crate::{CancelToken, Config, Error, Result};

/// Hard cap on entries per chunk regardless of the byte budget.
const MAX_CHUNK_ENTRIES: usize = 1 << 21;

/// Below this chunk size parallel sorting is not worth the thread overhead.
const PARALLEL_SORT_THRESHOLD: usize = 1 << 14;

/// Sorting backend behind a feature group.
pub trait FeatureSort: Send {
    /// Add an entry. May spill a full chunk to disk.
    fn add(&mut self, entry: SortableFeature) -> Result<()>;

    /// Finish ingestion and make the data iterable. Idempotent.
    fn sort(&mut self) -> Result<()>;

    /// Number of entries added so far.
    fn num_features_written(&self) -> u64;

    /// Total size of the current run files on disk.
    fn disk_usage_bytes(&self) -> u64;

    /// One-shot iterator over all entries in ascending key order.
    fn iter(&mut self) -> Result<Box<dyn Iterator<Item = Result<SortableFeature>> + Send>>;
}

/// Vec-backed sorter for unit tests and toy datasets.
#[derive(Debug, Default)]
pub struct InMemorySort {
    entries: Vec<SortableFeature>,
    num_written: u64,
    sorted: bool,
}

impl InMemorySort {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeatureSort for InMemorySort {
    fn add(&mut self, entry: SortableFeature) -> Result<()> {
        self.entries.push(entry);
        self.num_written += 1;
        Ok(())
    }

    fn sort(&mut self) -> Result<()> {
        if !self.sorted {
            self.entries.sort_unstable();
            self.sorted = true;
        }
        Ok(())
    }

    fn num_features_written(&self) -> u64 {
        self.num_written
    }

    fn disk_usage_bytes(&self) -> u64 {
        0
    }

    fn iter(&mut self) -> Result<Box<dyn Iterator<Item = Result<SortableFeature>> + Send>> {
        self.sort()?;
        Ok(Box::new(std::mem::take(&mut self.entries).into_iter().map(Ok)))
    }
}

/// A finished run file on disk.
#[derive(Debug)]
struct Run {
    path: PathBuf,
    bytes: u64,
}

/// Disk-backed sorter suitable for planet-scale inputs.
///
/// Single-threaded writes, single-threaded reads; only the in-memory chunk
/// sort fans out across `sort_parallelism` threads.
pub struct ExternalMergeSort {
    dir: PathBuf,
    chunk_budget_bytes: usize,
    parallelism: usize,
    cancel: Option<CancelToken>,
    current: Vec<SortableFeature>,
    current_bytes: usize,
    runs: Vec<Run>,
    retained: Option<Vec<SortableFeature>>,
    num_written: u64,
    sorted: bool,
}

impl ExternalMergeSort {
    /// Create a sorter spilling under `temp_dir`. Pre-existing run files in
    /// the directory are removed.
    pub fn new(temp_dir: &Path, config: &Config, cancel: Option<CancelToken>) -> Result<Self> {
        let dir = temp_dir.join("feature-sort");
        fs::create_dir_all(&dir)?;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "run") {
                fs::remove_file(path)?;
            }
        }
        Ok(Self {
            dir,
            chunk_budget_bytes: config.chunk_memory_budget_bytes,
            parallelism: config.sort_parallelism.max(1),
            cancel,
            current: Vec::new(),
            current_bytes: 0,
            runs: Vec::new(),
            retained: None,
            num_written: 0,
            sorted: false,
        })
    }

    fn spill(&mut self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        let mut chunk = std::mem::take(&mut self.current);
        self.current_bytes = 0;
        sort_chunk(&mut chunk, self.parallelism);

        let path = self.dir.join(format!("chunk_{:04}.run", self.runs.len()));
        let mut writer = BufWriter::new(File::create(&path)?);
        let mut bytes = 0u64;
        for entry in &chunk {
            bytes += write_record(&mut writer, entry)? as u64;
        }
        writer.flush()?;
        log::debug!(
            "spilled {} entries ({} bytes) to {}",
            chunk.len(),
            bytes,
            path.display()
        );
        self.runs.push(Run { path, bytes });
        Ok(())
    }
}

impl FeatureSort for ExternalMergeSort {
    fn add(&mut self, entry: SortableFeature) -> Result<()> {
        self.current_bytes += entry.estimated_bytes();
        self.current.push(entry);
        self.num_written += 1;
        if self.current_bytes >= self.chunk_budget_bytes || self.current.len() >= MAX_CHUNK_ENTRIES
        {
            self.spill()?;
        }
        Ok(())
    }

    fn sort(&mut self) -> Result<()> {
        if self.sorted {
            return Ok(());
        }
        if self.runs.is_empty() {
            // everything fit in one chunk: keep it in memory as the source
            let mut chunk = std::mem::take(&mut self.current);
            sort_chunk(&mut chunk, self.parallelism);
            self.retained = Some(chunk);
        } else if !self.current.is_empty() {
            self.spill()?;
        }
        self.sorted = true;
        Ok(())
    }

    fn num_features_written(&self) -> u64 {
        self.num_written
    }

    fn disk_usage_bytes(&self) -> u64 {
        self.runs.iter().map(|r| r.bytes).sum()
    }

    fn iter(&mut self) -> Result<Box<dyn Iterator<Item = Result<SortableFeature>> + Send>> {
        self.sort()?;
        if let Some(retained) = self.retained.take() {
            return Ok(Box::new(retained.into_iter().map(Ok)));
        }
        let merge = KWayMerge::open(&self.runs)?;
        Ok(Box::new(merge))
    }
}

impl Drop for ExternalMergeSort {
    fn drop(&mut self) {
        for run in &self.runs {
            let _ = fs::remove_file(&run.path);
        }
        let _ = fs::remove_dir(&self.dir);
    }
}

/// Sort one chunk, fanning out across threads when it is large enough.
fn sort_chunk(entries: &mut Vec<SortableFeature>, parallelism: usize) {
    if parallelism <= 1 || entries.len() < PARALLEL_SORT_THRESHOLD {
        entries.sort_unstable();
        return;
    }

    let slice_len = entries.len().div_ceil(parallelism);
    let mut parts: Vec<Vec<SortableFeature>> = Vec::with_capacity(parallelism);
    let mut rest = std::mem::take(entries);
    while rest.len() > slice_len {
        let tail = rest.split_off(rest.len() - slice_len);
        parts.push(tail);
    }
    parts.push(rest);

    std::thread::scope(|scope| {
        for part in parts.iter_mut() {
            scope.spawn(move || part.sort_unstable());
        }
    });

    // merge the sorted slices back into the chunk
    let mut iters: Vec<std::vec::IntoIter<SortableFeature>> =
        parts.into_iter().map(Vec::into_iter).collect();
    let mut heap: BinaryHeap<Reverse<(SortableFeature, usize)>> =
        BinaryHeap::with_capacity(iters.len());
    for (i, iter) in iters.iter_mut().enumerate() {
        if let Some(entry) = iter.next() {
            heap.push(Reverse((entry, i)));
        }
    }
    while let Some(Reverse((entry, i))) = heap.pop() {
        entries.push(entry);
        if let Some(next) = iters[i].next() {
            heap.push(Reverse((next, i)));
        }
    }
}

// ============================================================================
// Run file format: u64 LE key | varint length | value bytes
// ============================================================================

fn write_record(writer: &mut impl Write, entry: &SortableFeature) -> Result<usize> {
    writer.write_all(&entry.sort_key().to_le_bytes())?;
    let varint_len = write_varint(writer, entry.value().len() as u64)?;
    writer.write_all(entry.value())?;
    Ok(8 + varint_len + entry.value().len())
}

fn read_record(reader: &mut BufReader<File>) -> Result<Option<SortableFeature>> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None);
    }
    let mut key = [0u8; 8];
    reader
        .read_exact(&mut key)
        .map_err(|e| Error::CorruptRun(format!("truncated record key: {e}")))?;
    let len = read_varint(reader)? as usize;
    let mut value = vec![0u8; len];
    reader
        .read_exact(&mut value)
        .map_err(|e| Error::CorruptRun(format!("truncated record value: {e}")))?;
    Ok(Some(SortableFeature::new(u64::from_le_bytes(key), value)))
}

fn write_varint(writer: &mut impl Write, mut value: u64) -> Result<usize> {
    let mut written = 0;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        writer.write_all(&[byte])?;
        written += 1;
        if value == 0 {
            return Ok(written);
        }
    }
}

fn read_varint(reader: &mut impl Read) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader
            .read_exact(&mut byte)
            .map_err(|e| Error::CorruptRun(format!("truncated varint: {e}")))?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::CorruptRun("varint longer than 64 bits".to_string()));
        }
    }
}

// ============================================================================
// K-way merge
// ============================================================================

struct MergeEntry {
    key: u64,
    value: Vec<u8>,
    run: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.run == other.run
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // run index breaks ties so the merge is stable across runs
        self.key
            .cmp(&other.key)
            .then_with(|| self.run.cmp(&other.run))
    }
}

struct KWayMerge {
    readers: Vec<BufReader<File>>,
    heap: BinaryHeap<Reverse<MergeEntry>>,
}

impl KWayMerge {
    /// Open every run and seed the heap. A run that cannot deliver its first
    /// record rejects the whole merge up front.
    fn open(runs: &[Run]) -> Result<Self> {
        let mut readers = Vec::with_capacity(runs.len());
        let mut heap = BinaryHeap::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            let mut reader = BufReader::new(File::open(&run.path)?);
            if let Some(entry) = read_record(&mut reader)? {
                heap.push(Reverse(MergeEntry {
                    key: entry.sort_key(),
                    value: entry.value().to_vec(),
                    run: i,
                }));
            }
            readers.push(reader);
        }
        Ok(Self { readers, heap })
    }
}

impl Iterator for KWayMerge {
    type Item = Result<SortableFeature>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(entry) = self.heap.pop()?;
        match read_record(&mut self.readers[entry.run]) {
            Ok(Some(next)) => self.heap.push(Reverse(MergeEntry {
                key: next.sort_key(),
                value: next.value().to_vec(),
                run: entry.run,
            })),
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(SortableFeature::new(entry.key, entry.value)))
    }
}

//! Append-only duplicate detection for row keys.
//!
//! Keys are collected in an in-memory chunk. A full chunk is sorted and
//! spilled to a temp file, so memory stays bounded no matter how many rows a
//! sink holds. Duplicates inside the current chunk are reported right away;
//! duplicates across chunks are found by the final merge in
//! [`DuplicateChecker::check_for_duplicates`].
//!
//! Spilled chunks are closed once written. The merge opens at most
//! `merge_fan_in` of them at a time and folds larger sets level by level.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use ferry_core::emit;
use ferry_core::metrics::events::DuplicateChunkSpilled;

use crate::error::{ExchangeError, IoSnafu, Result};

/// Default number of chunks open at once during the merge.
pub const DEFAULT_MERGE_FAN_IN: usize = 64;

/// Collects row keys and reports the first key seen twice.
pub struct DuplicateChecker {
    chunk: HashSet<String>,
    chunk_size: usize,
    merge_fan_in: usize,
    spill_dir: PathBuf,
    spilled: Vec<TempPath>,
}

impl DuplicateChecker {
    pub fn new(chunk_size: usize, spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk: HashSet::new(),
            chunk_size: chunk_size.max(1),
            merge_fan_in: DEFAULT_MERGE_FAN_IN,
            spill_dir: spill_dir.into(),
            spilled: Vec::new(),
        }
    }

    /// Limit how many spilled chunks the merge reads at once.
    pub fn with_merge_fan_in(mut self, fan_in: usize) -> Self {
        self.merge_fan_in = fan_in.max(2);
        self
    }

    /// Add a key. Fails if the key is already in the in-memory chunk.
    pub fn add_key(&mut self, key: String) -> Result<()> {
        if self.chunk.contains(&key) {
            return Err(ExchangeError::DuplicateKey { key });
        }
        self.chunk.insert(key);
        if self.chunk.len() >= self.chunk_size {
            self.spill()?;
        }
        Ok(())
    }

    /// Number of chunks on disk.
    pub fn spilled_chunks(&self) -> usize {
        self.spilled.len()
    }

    /// Look for duplicates across every chunk seen so far.
    ///
    /// Spills the current chunk first, so this is meant to run once after the
    /// last key was added.
    pub fn check_for_duplicates(&mut self) -> Result<()> {
        if self.spilled.is_empty() {
            // a single chunk is duplicate-free by construction
            return Ok(());
        }
        if !self.chunk.is_empty() {
            self.spill()?;
        }

        let mut levels = 0;
        while self.spilled.len() > self.merge_fan_in {
            let level = std::mem::take(&mut self.spilled);
            for group in level.chunks(self.merge_fan_in) {
                let merged = self.merge_into_chunk(group)?;
                self.spilled.push(merged);
            }
            levels += 1;
        }

        let keys = merge_chunks(&self.spilled, |_| Ok(()))?;
        debug!(
            chunks = self.spilled.len(),
            levels,
            keys,
            "Merged row key chunks without duplicates"
        );
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        let mut keys: Vec<String> = self.chunk.drain().collect();
        keys.sort_unstable();

        let mut writer = ChunkWriter::create(&self.spill_dir)?;
        for key in &keys {
            writer.write_key(key)?;
        }
        self.spilled.push(writer.finish()?);
        emit!(DuplicateChunkSpilled {
            keys: keys.len() as u64,
        });
        Ok(())
    }

    /// Merge `group` into a single sorted chunk.
    fn merge_into_chunk(&self, group: &[TempPath]) -> Result<TempPath> {
        let mut writer = ChunkWriter::create(&self.spill_dir)?;
        merge_chunks(group, |key| writer.write_key(key))?;
        writer.finish()
    }
}

/// K-way merge of sorted chunks, calling `emit_key` for each key in order.
///
/// Returns the number of keys, or the first key found in two chunks.
fn merge_chunks(
    paths: &[TempPath],
    mut emit_key: impl FnMut(&str) -> Result<()>,
) -> Result<u64> {
    let mut chunks = Vec::with_capacity(paths.len());
    for path in paths {
        chunks.push(ChunkReader::open(path)?);
    }

    let mut heap = BinaryHeap::new();
    for (i, chunk) in chunks.iter_mut().enumerate() {
        if let Some(key) = chunk.next_key()? {
            heap.push(Reverse((key, i)));
        }
    }

    let mut previous: Option<String> = None;
    let mut count = 0;
    while let Some(Reverse((key, i))) = heap.pop() {
        if previous.as_ref() == Some(&key) {
            return Err(ExchangeError::DuplicateKey { key });
        }
        emit_key(&key)?;
        count += 1;
        if let Some(next) = chunks[i].next_key()? {
            heap.push(Reverse((next, i)));
        }
        previous = Some(key);
    }
    Ok(count)
}

/// Writes one sorted, length-prefixed chunk.
struct ChunkWriter {
    path: PathBuf,
    writer: BufWriter<NamedTempFile>,
}

impl ChunkWriter {
    fn create(dir: &Path) -> Result<Self> {
        let file = NamedTempFile::new_in(dir).context(IoSnafu { path: dir })?;
        Ok(Self {
            path: file.path().to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn write_key(&mut self, key: &str) -> Result<()> {
        self.writer
            .write_all(&(key.len() as u32).to_le_bytes())
            .and_then(|_| self.writer.write_all(key.as_bytes()))
            .context(IoSnafu { path: &self.path })
    }

    /// Flush and close the file, keeping it on disk until the path drops.
    fn finish(self) -> Result<TempPath> {
        let path = self.path;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context(IoSnafu { path })?;
        Ok(file.into_temp_path())
    }
}

/// Sequential reader over one sorted, length-prefixed chunk.
struct ChunkReader<'a> {
    path: &'a Path,
    reader: BufReader<File>,
}

impl<'a> ChunkReader<'a> {
    fn open(path: &'a Path) -> Result<Self> {
        let file = File::open(path).context(IoSnafu { path })?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
        })
    }

    fn next_key(&mut self) -> Result<Option<String>> {
        let path = self.path;
        let mut len = [0u8; 4];
        match self.reader.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context(IoSnafu { path }),
        }

        let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
        self.reader
            .read_exact(&mut bytes)
            .context(IoSnafu { path })?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| ExchangeError::MalformedFile {
                path: path.to_path_buf(),
                offset: 0,
                message: format!("spilled row key is not UTF-8: {e}"),
            })
    }
}

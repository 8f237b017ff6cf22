//! Persistent mapping from replicate index to the physical location of the
//! batch that contains it.
//!
//! The index is sharded into fixed-size chunk files named
//! `index.NNNNNNNNN`, each holding a dense array of 24-byte slots. Slot
//! `i % entries_per_chunk` of chunk `i / entries_per_chunk` records
//! `{term, segment sequence number, offset in segment}` for op index `i`;
//! an all-zero slot means the op was never indexed (segment sequence
//! numbers start at 1). Chunks below the durability floor are deleted by
//! GC.
//!
//! An entry may be overwritten in place: when a new leader replaces
//! uncommitted ops, the same indexes are re-added pointing at the new
//! batches, and the latest write wins.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::env::FsEnv;
use crate::error::LogError;
use crate::types::OpId;

const SLOT_SIZE: u64 = 24;
const INDEX_CHUNK_PREFIX: &str = "index.";

/// One resolved index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogIndexEntry {
    pub op_id: OpId,
    pub segment_sequence_number: u64,
    pub offset_in_segment: u64,
}

struct IndexInner {
    /// Open chunk files keyed by chunk id.
    chunks: HashMap<u64, Arc<File>>,
}

/// The on-disk replicate index. Concurrent readers share the chunk map;
/// the appender is the only writer of slots.
pub struct LogIndex {
    env: Arc<dyn FsEnv>,
    dir: PathBuf,
    entries_per_chunk: u64,
    inner: RwLock<IndexInner>,
}

impl LogIndex {
    pub fn open(
        env: Arc<dyn FsEnv>,
        dir: PathBuf,
        entries_per_chunk: u64,
    ) -> Result<Self, LogError> {
        Ok(Self {
            env,
            dir,
            entries_per_chunk,
            inner: RwLock::new(IndexInner {
                chunks: HashMap::new(),
            }),
        })
    }

    fn chunk_id(&self, index: u64) -> u64 {
        index / self.entries_per_chunk
    }

    fn chunk_path(&self, chunk_id: u64) -> PathBuf {
        self.dir.join(format!("{}{:09}", INDEX_CHUNK_PREFIX, chunk_id))
    }

    fn slot_offset(&self, index: u64) -> u64 {
        (index % self.entries_per_chunk) * SLOT_SIZE
    }

    /// Returns the chunk file for `chunk_id`, opening or creating it on
    /// first touch.
    fn chunk(&self, chunk_id: u64, create: bool) -> Result<Option<Arc<File>>, LogError> {
        if let Some(file) = self.inner.read().chunks.get(&chunk_id) {
            return Ok(Some(file.clone()));
        }
        let path = self.chunk_path(chunk_id);
        if !create && !self.env.file_exists(&path) {
            return Ok(None);
        }
        let mut inner = self.inner.write();
        // Another thread may have opened it while we dropped the read
        // lock.
        if let Some(file) = inner.chunks.get(&chunk_id) {
            return Ok(Some(file.clone()));
        }
        let file = Arc::new(self.env.new_read_write_file(&path)?);
        debug!("Opened log index chunk {:?}", path);
        inner.chunks.insert(chunk_id, file.clone());
        Ok(Some(file))
    }

    /// Records where a replicate op lives. Writing the same index again
    /// overwrites the previous location.
    pub fn add_entry(&self, entry: LogIndexEntry) -> Result<(), LogError> {
        let index = entry.op_id.index;
        let chunk = self
            .chunk(self.chunk_id(index), true)?
            .expect("chunk created on demand");

        let mut slot = [0u8; SLOT_SIZE as usize];
        slot[0..8].copy_from_slice(&entry.op_id.term.to_le_bytes());
        slot[8..16].copy_from_slice(&entry.segment_sequence_number.to_le_bytes());
        slot[16..24].copy_from_slice(&entry.offset_in_segment.to_le_bytes());
        chunk.write_all_at(&slot, self.slot_offset(index))?;
        Ok(())
    }

    /// Resolves an op index to its segment and offset, or `None` when it
    /// was never indexed or its chunk has been GC'd.
    pub fn lookup(&self, index: u64) -> Result<Option<LogIndexEntry>, LogError> {
        let chunk = match self.chunk(self.chunk_id(index), false)? {
            Some(c) => c,
            None => return Ok(None),
        };
        let mut slot = [0u8; SLOT_SIZE as usize];
        match chunk.read_exact_at(&mut slot, self.slot_offset(index)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let term = u64::from_le_bytes(slot[0..8].try_into().unwrap());
        let segment_sequence_number = u64::from_le_bytes(slot[8..16].try_into().unwrap());
        let offset_in_segment = u64::from_le_bytes(slot[16..24].try_into().unwrap());
        if segment_sequence_number == 0 {
            return Ok(None);
        }
        Ok(Some(LogIndexEntry {
            op_id: OpId::new(term, index),
            segment_sequence_number,
            offset_in_segment,
        }))
    }

    /// Deletes chunks that lie entirely below `min_index_to_retain`.
    pub fn gc_below(&self, min_index_to_retain: u64) -> Result<usize, LogError> {
        let max_deletable_chunk = min_index_to_retain / self.entries_per_chunk;
        let mut deleted = 0;

        let candidates: Vec<PathBuf> = self
            .env
            .list_dir(&self.dir)?
            .into_iter()
            .filter(|p| chunk_id_from_path(p).is_some_and(|id| id < max_deletable_chunk))
            .collect();

        if candidates.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.write();
        for path in candidates {
            let id = chunk_id_from_path(&path).unwrap();
            inner.chunks.remove(&id);
            match self.env.delete_file(&path) {
                Ok(()) => {
                    info!("GCed log index chunk {:?}", path);
                    deleted += 1;
                }
                Err(e) => warn!("Failed to delete log index chunk {:?}: {}", path, e),
            }
        }
        Ok(deleted)
    }
}

fn chunk_id_from_path(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(INDEX_CHUNK_PREFIX)?
        .parse()
        .ok()
}

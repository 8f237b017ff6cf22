//! Ordered registry of a tablet's readable segments, plus the read paths
//! that serve bootstrap and peer catch-up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::env::FsEnv;
use crate::error::LogError;
use crate::storage::log::entry::{LogEntry, LogEntryBatchPb, ReplicateMsg};
use crate::storage::log::index::LogIndex;
use crate::storage::log::segment::ReadableLogSegment;

/// Formats the file name of a segment from its sequence number.
pub fn segment_file_name(sequence_number: u64) -> String {
    format!("wal-{:016}", sequence_number)
}

/// Parses a segment sequence number out of a file name, or `None` when
/// the name is not a segment's.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("wal-")?;
    if digits.len() != 16 {
        return None;
    }
    digits.parse().ok()
}

/// The ordered set of readable segments. Mutations (rollover, GC) are
/// rare; reads take a cheap snapshot of `Arc` handles so no lock is held
/// while segment bytes are touched.
pub struct LogReader {
    segments: RwLock<Vec<Arc<ReadableLogSegment>>>,
    index: Arc<LogIndex>,
}

impl LogReader {
    /// Opens the reader over every segment already present in `log_dir`,
    /// in sequence order. Sequence numbers must be contiguous.
    pub fn open(
        env: &Arc<dyn FsEnv>,
        log_dir: &Path,
        index: Arc<LogIndex>,
    ) -> Result<Self, LogError> {
        let mut found: Vec<(u64, PathBuf)> = env
            .list_dir(log_dir)?
            .into_iter()
            .filter_map(|path| {
                let seq = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_segment_file_name)?;
                Some((seq, path))
            })
            .collect();
        found.sort_by_key(|(seq, _)| *seq);

        let mut segments = Vec::with_capacity(found.len());
        for (seq, path) in found {
            if let Some(last) = segments.last() {
                let prev: &Arc<ReadableLogSegment> = last;
                if seq != prev.sequence_number() + 1 {
                    return Err(LogError::corruption(
                        0,
                        format!(
                            "segment sequence gap: {} follows {}",
                            seq,
                            prev.sequence_number()
                        ),
                    ));
                }
            }
            let file = env.new_random_access_file(&path)?;
            let segment = ReadableLogSegment::open(path.clone(), file)?;
            if segment.sequence_number() != seq {
                return Err(LogError::corruption(
                    0,
                    format!(
                        "segment {:?} header claims sequence {} but file name says {}",
                        path,
                        segment.sequence_number(),
                        seq
                    ),
                ));
            }
            segments.push(Arc::new(segment));
        }
        if !segments.is_empty() {
            info!(
                "Opened log reader over {} existing segments ({}..{})",
                segments.len(),
                segments[0].sequence_number(),
                segments[segments.len() - 1].sequence_number()
            );
        }
        Ok(Self {
            segments: RwLock::new(segments),
            index,
        })
    }

    pub fn num_segments(&self) -> usize {
        self.segments.read().len()
    }

    /// Cheap snapshot of the current segment handles, oldest first.
    pub fn segments_snapshot(&self) -> Vec<Arc<ReadableLogSegment>> {
        self.segments.read().clone()
    }

    pub fn segment_for_sequence(&self, seq: u64) -> Option<Arc<ReadableLogSegment>> {
        let segments = self.segments.read();
        let first = segments.first()?.sequence_number();
        if seq < first {
            return None;
        }
        segments.get((seq - first) as usize).cloned()
    }

    /// Registers a fresh, empty active segment after rollover.
    pub fn append_empty_segment(&self, segment: Arc<ReadableLogSegment>) -> Result<(), LogError> {
        let mut segments = self.segments.write();
        if let Some(last) = segments.last() {
            if segment.sequence_number() != last.sequence_number() + 1 {
                return Err(LogError::IllegalState(format!(
                    "appended segment {} does not follow {}",
                    segment.sequence_number(),
                    last.sequence_number()
                )));
            }
        }
        segments.push(segment);
        Ok(())
    }

    /// Swaps the (formerly active) last segment for its closed, footered
    /// replacement.
    pub fn replace_last_segment(&self, segment: Arc<ReadableLogSegment>) -> Result<(), LogError> {
        let mut segments = self.segments.write();
        let last = segments
            .last_mut()
            .ok_or_else(|| LogError::IllegalState("no segment to replace".to_string()))?;
        if last.sequence_number() != segment.sequence_number() {
            return Err(LogError::IllegalState(format!(
                "replacement segment {} does not match last segment {}",
                segment.sequence_number(),
                last.sequence_number()
            )));
        }
        *last = segment;
        Ok(())
    }

    /// Drops every segment with sequence number ≤ `seq` from the
    /// registry. The caller deletes the files afterwards, outside any
    /// lock.
    pub fn trim_segments_up_to_and_including(&self, seq: u64) -> Result<usize, LogError> {
        let mut segments = self.segments.write();
        let keep_from = segments
            .iter()
            .position(|s| s.sequence_number() > seq)
            .unwrap_or(segments.len());
        if keep_from == segments.len() {
            return Err(LogError::IllegalState(format!(
                "refusing to trim every segment (trim through {})",
                seq
            )));
        }
        segments.drain(0..keep_from);
        Ok(keep_from)
    }

    /// Publishes new durable bytes of the active (last) segment.
    pub fn update_last_segment_offset(&self, offset: u64) {
        let segments = self.segments.read();
        if let Some(last) = segments.last() {
            last.update_readable_to_offset(offset);
        }
    }

    /// The smallest `min_replicate_index` across remaining segments; the
    /// floor below which index chunks may be GC'd.
    pub fn min_replicate_index(&self) -> Option<u64> {
        self.segments
            .read()
            .iter()
            .filter_map(|s| s.min_replicate_index())
            .min()
    }

    /// Reads every entry across all segments in append order, for
    /// bootstrap.
    ///
    /// A damaged tail of the newest segment is a normal crash artifact and
    /// yields the valid prefix; damage in any earlier segment leaves a gap
    /// and is reported as `Corruption`.
    pub fn read_all_entries(&self) -> Result<Vec<LogEntry>, LogError> {
        let segments = self.segments_snapshot();
        let mut entries = Vec::new();
        for (pos, segment) in segments.iter().enumerate() {
            let scan = segment.read_all_batches()?;
            if let Some(reason) = &scan.corruption {
                if pos + 1 != segments.len() {
                    return Err(LogError::corruption(
                        scan.end_offset,
                        format!(
                            "segment {} damaged before the last segment: {}",
                            segment.sequence_number(),
                            reason
                        ),
                    ));
                }
                warn!(
                    "Last segment {} truncated at offset {}: {}",
                    segment.sequence_number(),
                    scan.end_offset,
                    reason
                );
            }
            entries.extend(scan.entries());
        }
        Ok(entries)
    }

    /// Reads the replicate ops with indexes in `[low, high]`, resolving
    /// each through the log index. Stops early once `max_bytes` of
    /// payload have been collected, but always returns at least one op
    /// when any is available.
    pub fn read_replicates_in_range(
        &self,
        low: u64,
        high: u64,
        max_bytes: usize,
    ) -> Result<Vec<ReplicateMsg>, LogError> {
        let mut out: Vec<ReplicateMsg> = Vec::new();
        let mut bytes = 0usize;
        // Consecutive ops usually share a batch; keep the last parsed one.
        let mut cached: Option<(u64, u64, LogEntryBatchPb)> = None;

        for idx in low..=high {
            let entry = match self.index.lookup(idx)? {
                Some(e) => e,
                None => {
                    return Err(LogError::InvalidArgument(format!(
                        "op index {} is not in the log index",
                        idx
                    )))
                }
            };

            let cache_hit = matches!(&cached, Some((seq, off, _))
                if *seq == entry.segment_sequence_number && *off == entry.offset_in_segment);
            if !cache_hit {
                let segment = self
                    .segment_for_sequence(entry.segment_sequence_number)
                    .ok_or_else(|| {
                        LogError::IllegalState(format!(
                            "segment {} referenced by index entry {} has been GCed",
                            entry.segment_sequence_number, idx
                        ))
                    })?;
                let batch = segment.read_batch_at(entry.offset_in_segment)?;
                cached = Some((
                    entry.segment_sequence_number,
                    entry.offset_in_segment,
                    batch,
                ));
            }
            let batch = &cached.as_ref().unwrap().2;

            let msg = batch
                .entries
                .iter()
                .filter_map(LogEntry::as_replicate)
                .find(|r| r.id.index == idx)
                .ok_or_else(|| {
                    LogError::corruption(
                        entry.offset_in_segment,
                        format!("indexed batch does not contain op {}", idx),
                    )
                })?;

            if !out.is_empty() && bytes + msg.payload.len() > max_bytes {
                break;
            }
            bytes += msg.payload.len();
            out.push(msg.clone());
        }
        Ok(out)
    }
}

//! Writable and readable views of a single WAL segment file.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::LogError;
use crate::storage::log::codec::{self, CompressionCodec};
use crate::storage::log::entry::{LogEntry, LogEntryBatchPb, SegmentFooter, SegmentHeader};

/// The append-only half of a segment. Owns the file handle and the write
/// offset; all writes are positioned so the handle also serves the footer
/// rewrite of a preallocated file.
///
/// `written_offset` only ever increases while the segment is active and is
/// the sole source of the safe-read watermark published to readers.
pub struct WritableLogSegment {
    path: PathBuf,
    file: File,
    header: Option<SegmentHeader>,
    first_entry_offset: u64,
    written_offset: u64,
    closed: bool,
}

impl WritableLogSegment {
    pub fn new(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file,
            header: None,
            first_entry_offset: 0,
            written_offset: 0,
            closed: false,
        }
    }

    /// Writes the segment preamble and header. Must be called exactly once
    /// before any batch is appended.
    pub fn write_header(&mut self, header: SegmentHeader) -> Result<(), LogError> {
        debug_assert!(self.header.is_none(), "header already written");
        let bytes = codec::encode_header(&header)?;
        self.file.write_all_at(&bytes, 0)?;
        self.first_entry_offset = bytes.len() as u64;
        self.written_offset = bytes.len() as u64;
        self.header = Some(header);
        Ok(())
    }

    /// Appends one framed entry batch; returns the offset the frame starts
    /// at.
    pub fn append_entry_batch(
        &mut self,
        batch_bytes: &[u8],
        compression: CompressionCodec,
    ) -> Result<u64, LogError> {
        debug_assert!(!self.closed, "append to closed segment");
        let frame = codec::encode_entry_frame(batch_bytes, compression)?;
        let start = self.written_offset;
        self.file.write_all_at(&frame, start)?;
        self.written_offset = start + frame.len() as u64;
        Ok(start)
    }

    /// Forces everything written so far onto stable storage.
    pub fn sync(&self) -> Result<(), LogError> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync segment {:?}: {}", self.path, e);
            LogError::from(e)
        })
    }

    /// Writes the footer trailer, trims any preallocated tail, and syncs.
    /// After this the segment is immutable.
    pub fn write_footer_and_close(&mut self, footer: &SegmentFooter) -> Result<(), LogError> {
        debug_assert!(!self.closed, "segment already closed");
        let bytes = codec::encode_footer(footer)?;
        self.file.write_all_at(&bytes, self.written_offset)?;
        self.written_offset += bytes.len() as u64;
        // Preallocation may have left the file longer than what was
        // written; trim so the footer trailer is the physical end.
        self.file.set_len(self.written_offset)?;
        self.file.sync_all()?;
        self.closed = true;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written_offset(&self) -> u64 {
        self.written_offset
    }

    pub fn first_entry_offset(&self) -> u64 {
        self.first_entry_offset
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn header(&self) -> Option<&SegmentHeader> {
        self.header.as_ref()
    }
}

/// The result of scanning a segment's entry frames.
pub struct SegmentScan {
    /// Parsed batches with the file offset each frame starts at.
    pub batches: Vec<(u64, LogEntryBatchPb)>,
    /// Offset one past the last valid frame.
    pub end_offset: u64,
    /// Set when the scan stopped early at a damaged frame.
    pub corruption: Option<String>,
}

impl SegmentScan {
    pub fn entries(self) -> Vec<LogEntry> {
        self.batches
            .into_iter()
            .flat_map(|(_, b)| b.entries)
            .collect()
    }
}

/// Random-access reader over a segment, either closed (footer present) or
/// actively written (reads clamp at the watermark published by the
/// appender).
pub struct ReadableLogSegment {
    path: PathBuf,
    file: File,
    header: SegmentHeader,
    compression: CompressionCodec,
    first_entry_offset: u64,
    footer: Option<SegmentFooter>,
    /// True when the footer above was reconstructed by scanning rather
    /// than read from disk; such segments still count as footerless for
    /// retention purposes.
    footer_rebuilt: bool,
    file_size: u64,
    readable_to_offset: AtomicU64,
}

impl ReadableLogSegment {
    /// Opens an existing segment file, parsing its header and footer. A
    /// missing footer (crash-truncated or formerly-active segment) is
    /// rebuilt by scanning the frames; the scan's end becomes the safe
    /// read limit.
    pub fn open(path: PathBuf, file: File) -> Result<Self, LogError> {
        let file_size = file.metadata()?.len();
        let (header, first_entry_offset) = codec::decode_header(&file, file_size)?;
        let compression = CompressionCodec::from_byte(header.compression_codec)?;

        let mut segment = Self {
            path,
            file,
            header,
            compression,
            first_entry_offset,
            footer: None,
            footer_rebuilt: false,
            file_size,
            readable_to_offset: AtomicU64::new(first_entry_offset),
        };

        match codec::decode_footer(&segment.file, file_size)? {
            Some((footer, footer_offset)) => {
                segment.footer = Some(footer);
                segment
                    .readable_to_offset
                    .store(footer_offset, Ordering::Release);
            }
            None => {
                let scan = segment.scan_frames(file_size)?;
                if let Some(reason) = &scan.corruption {
                    warn!(
                        "Segment {:?} truncated at offset {}: {}",
                        segment.path, scan.end_offset, reason
                    );
                }
                let mut footer = SegmentFooter::default();
                for (_, batch) in &scan.batches {
                    footer.accumulate(batch);
                }
                segment.footer = Some(footer);
                segment.footer_rebuilt = true;
                segment
                    .readable_to_offset
                    .store(scan.end_offset, Ordering::Release);
            }
        }
        Ok(segment)
    }

    /// A readable view over the segment currently being written. The safe
    /// read limit starts at the first entry offset and is advanced by the
    /// appender after each durable write.
    pub fn new_active(
        path: PathBuf,
        file: File,
        header: SegmentHeader,
        first_entry_offset: u64,
    ) -> Result<Self, LogError> {
        let compression = CompressionCodec::from_byte(header.compression_codec)?;
        Ok(Self {
            path,
            file,
            header,
            compression,
            first_entry_offset,
            footer: None,
            footer_rebuilt: false,
            file_size: first_entry_offset,
            readable_to_offset: AtomicU64::new(first_entry_offset),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    /// The footer, whether read from disk or rebuilt by scanning.
    pub fn footer(&self) -> Option<&SegmentFooter> {
        self.footer.as_ref()
    }

    /// True only when the footer was durably written at close time.
    /// Retention decisions key off this, not off a rebuilt footer.
    pub fn has_on_disk_footer(&self) -> bool {
        self.footer.is_some() && !self.footer_rebuilt
    }

    pub fn min_replicate_index(&self) -> Option<u64> {
        self.footer.as_ref().and_then(|f| f.min_replicate_index)
    }

    pub fn max_replicate_index(&self) -> Option<u64> {
        self.footer.as_ref().and_then(|f| f.max_replicate_index)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.max(self.readable_to_offset())
    }

    pub fn first_entry_offset(&self) -> u64 {
        self.first_entry_offset
    }

    pub fn readable_to_offset(&self) -> u64 {
        self.readable_to_offset.load(Ordering::Acquire)
    }

    /// Publishes new durable bytes to readers of an active segment.
    pub fn update_readable_to_offset(&self, offset: u64) {
        self.readable_to_offset.fetch_max(offset, Ordering::AcqRel);
    }

    /// Reads every entry batch up to the safe read limit, stopping at the
    /// first damaged frame.
    pub fn read_all_batches(&self) -> Result<SegmentScan, LogError> {
        self.scan_frames(self.readable_to_offset())
    }

    /// Reads the single batch whose frame starts at `offset`. Used by
    /// index-driven lookups, so a damaged frame here is an error rather
    /// than a truncation point.
    pub fn read_batch_at(&self, offset: u64) -> Result<LogEntryBatchPb, LogError> {
        let limit = self.readable_to_offset();
        match codec::read_entry_frame(&self.file, offset, limit, self.compression)? {
            Some((batch, _)) => Ok(batch),
            None => Err(LogError::corruption(
                offset,
                "no entry frame at indexed offset",
            )),
        }
    }

    fn scan_frames(&self, limit: u64) -> Result<SegmentScan, LogError> {
        let mut batches = Vec::new();
        let mut offset = self.first_entry_offset;
        let mut corruption = None;
        loop {
            match codec::read_entry_frame(&self.file, offset, limit, self.compression) {
                Ok(Some((batch, next))) => {
                    batches.push((offset, batch));
                    offset = next;
                }
                Ok(None) => break,
                Err(e) if e.is_corruption() => {
                    corruption = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(SegmentScan {
            batches,
            end_offset: offset,
            corruption,
        })
    }
}

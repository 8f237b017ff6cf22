//! On-disk encoding of segment files.
//!
//! Layout:
//!
//! ```text
//! [ magic (8) ][ version (4) ]
//! [ header len (4) ][ header crc (4) ][ header record ]
//! [ repeated: frame len (4) ][ frame crc (4) ][ frame payload ]
//! [ footer record ][ footer crc (4) ][ footer len (4) ][ footer magic (8) ]
//! ```
//!
//! Frame payloads are the bincode encoding of a `LogEntryBatchPb`, run
//! through the segment's compression codec. All integers are
//! little-endian; every variable-length region is covered by a CRC32.
//!
//! Readers never abort on a damaged region: a bad length, CRC, or
//! decompression failure is reported as `Corruption` carrying the offset,
//! and callers treat the segment as truncated at the last good frame.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::LogError;
use crate::storage::log::entry::{LogEntryBatchPb, SegmentFooter, SegmentHeader};

pub const SEGMENT_MAGIC: &[u8; 8] = b"raftwal\0";
pub const FOOTER_MAGIC: &[u8; 8] = b"walfoot\0";
pub const SEGMENT_VERSION: u32 = 1;

/// magic + version + header len + header crc
pub const SEGMENT_PREAMBLE_SIZE: u64 = 8 + 4 + 4 + 4;
/// frame len + frame crc
pub const FRAME_HEADER_SIZE: u64 = 8;
/// footer crc + footer len + footer magic
pub const FOOTER_TRAILER_SIZE: u64 = 4 + 4 + 8;

/// Per-batch compression codec, identified in the segment header by a
/// single-byte discriminant so that old segments remain readable after a
/// configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    None,
    Lz4,
    Zstd,
}

impl CompressionCodec {
    pub fn from_name(name: &str) -> Result<Self, LogError> {
        match name.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CompressionCodec::None),
            "lz4" => Ok(CompressionCodec::Lz4),
            "zstd" => Ok(CompressionCodec::Zstd),
            other => Err(LogError::NotSupported(format!(
                "unknown compression codec \"{}\"",
                other
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            CompressionCodec::None => 0,
            CompressionCodec::Lz4 => 1,
            CompressionCodec::Zstd => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, LogError> {
        match byte {
            0 => Ok(CompressionCodec::None),
            1 => Ok(CompressionCodec::Lz4),
            2 => Ok(CompressionCodec::Zstd),
            other => Err(LogError::NotSupported(format!(
                "unknown compression codec id {}",
                other
            ))),
        }
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>, LogError> {
        match self {
            CompressionCodec::None => Ok(data.to_vec()),
            CompressionCodec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionCodec::Zstd => {
                zstd::stream::encode_all(data, 0).map_err(LogError::from)
            }
        }
    }

    fn decompress(self, data: &[u8], offset: u64) -> Result<Vec<u8>, LogError> {
        match self {
            CompressionCodec::None => Ok(data.to_vec()),
            CompressionCodec::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| LogError::corruption(offset, format!("lz4 decompression: {}", e))),
            CompressionCodec::Zstd => zstd::stream::decode_all(data)
                .map_err(|e| LogError::corruption(offset, format!("zstd decompression: {}", e))),
        }
    }
}

fn encode_record<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, LogError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| LogError::InvalidArgument(format!("record encoding failed: {}", e)))
}

fn decode_record<T: bincode::Decode<()>>(data: &[u8], offset: u64) -> Result<T, LogError> {
    let (value, _) = bincode::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| LogError::corruption(offset, format!("record decoding failed: {}", e)))?;
    Ok(value)
}

/// Serializes the preamble and header record of a fresh segment.
pub fn encode_header(header: &SegmentHeader) -> Result<Vec<u8>, LogError> {
    let record = encode_record(header)?;
    let mut out = Vec::with_capacity(SEGMENT_PREAMBLE_SIZE as usize + record.len());
    out.extend_from_slice(SEGMENT_MAGIC);
    out.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
    out.extend_from_slice(&(record.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&record).to_le_bytes());
    out.extend_from_slice(&record);
    Ok(out)
}

/// Parses the header of a segment file; returns the header record and the
/// offset of the first entry frame.
pub fn decode_header(file: &File, file_len: u64) -> Result<(SegmentHeader, u64), LogError> {
    if file_len < SEGMENT_PREAMBLE_SIZE {
        return Err(LogError::corruption(0, "file too short for segment header"));
    }
    let mut preamble = [0u8; SEGMENT_PREAMBLE_SIZE as usize];
    file.read_exact_at(&mut preamble, 0)?;

    if &preamble[0..8] != SEGMENT_MAGIC {
        return Err(LogError::corruption(0, "bad segment magic"));
    }
    let version = u32::from_le_bytes(preamble[8..12].try_into().unwrap());
    if version != SEGMENT_VERSION {
        return Err(LogError::NotSupported(format!(
            "unsupported segment version {}",
            version
        )));
    }
    let header_len = u32::from_le_bytes(preamble[12..16].try_into().unwrap()) as u64;
    let header_crc = u32::from_le_bytes(preamble[16..20].try_into().unwrap());

    if SEGMENT_PREAMBLE_SIZE + header_len > file_len {
        return Err(LogError::corruption(0, "header length exceeds file size"));
    }
    let mut record = vec![0u8; header_len as usize];
    file.read_exact_at(&mut record, SEGMENT_PREAMBLE_SIZE)?;
    if crc32fast::hash(&record) != header_crc {
        return Err(LogError::corruption(SEGMENT_PREAMBLE_SIZE, "header CRC mismatch"));
    }

    let header: SegmentHeader = decode_record(&record, SEGMENT_PREAMBLE_SIZE)?;
    Ok((header, SEGMENT_PREAMBLE_SIZE + header_len))
}

/// Frames one serialized entry batch, compressing it per the codec.
pub fn encode_entry_frame(
    batch_bytes: &[u8],
    codec: CompressionCodec,
) -> Result<Vec<u8>, LogError> {
    let payload = codec.compress(batch_bytes)?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reads the entry frame starting at `offset`.
///
/// `limit` is the exclusive upper bound of readable bytes (the published
/// safe offset of an active segment, or the footer position of a closed
/// one). Returns `Ok(None)` at a clean end: exactly at the limit, or at a
/// zeroed region left by preallocation. Everything else that fails to
/// parse is `Corruption`.
pub fn read_entry_frame(
    file: &File,
    offset: u64,
    limit: u64,
    codec: CompressionCodec,
) -> Result<Option<(LogEntryBatchPb, u64)>, LogError> {
    if offset >= limit {
        return Ok(None);
    }
    if offset + FRAME_HEADER_SIZE > limit {
        return Err(LogError::corruption(offset, "truncated frame header"));
    }
    let mut frame_header = [0u8; FRAME_HEADER_SIZE as usize];
    file.read_exact_at(&mut frame_header, offset)?;
    let payload_len = u32::from_le_bytes(frame_header[0..4].try_into().unwrap()) as u64;
    let payload_crc = u32::from_le_bytes(frame_header[4..8].try_into().unwrap());

    if payload_len == 0 && payload_crc == 0 {
        // Zeroed tail of a preallocated segment.
        return Ok(None);
    }
    if offset + FRAME_HEADER_SIZE + payload_len > limit {
        return Err(LogError::corruption(offset, "frame length exceeds readable bytes"));
    }

    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact_at(&mut payload, offset + FRAME_HEADER_SIZE)?;
    if crc32fast::hash(&payload) != payload_crc {
        return Err(LogError::corruption(offset, "frame CRC mismatch"));
    }

    let batch_bytes = codec.decompress(&payload, offset)?;
    let batch = LogEntryBatchPb::deserialize(&batch_bytes)
        .map_err(|e| LogError::corruption(offset, format!("entry batch decoding failed: {}", e)))?;

    Ok(Some((batch, offset + FRAME_HEADER_SIZE + payload_len)))
}

/// Serializes the footer record plus its trailer.
pub fn encode_footer(footer: &SegmentFooter) -> Result<Vec<u8>, LogError> {
    let record = encode_record(footer)?;
    let mut out = Vec::with_capacity(record.len() + FOOTER_TRAILER_SIZE as usize);
    out.extend_from_slice(&record);
    out.extend_from_slice(&crc32fast::hash(&record).to_le_bytes());
    out.extend_from_slice(&(record.len() as u32).to_le_bytes());
    out.extend_from_slice(FOOTER_MAGIC);
    Ok(out)
}

/// Looks for a footer trailer at the end of the file.
///
/// Returns the footer record and the offset at which it starts (the end of
/// the last entry frame), or `None` when the file does not end with a
/// footer magic — the signature of an actively written or crash-truncated
/// segment.
pub fn decode_footer(file: &File, file_len: u64) -> Result<Option<(SegmentFooter, u64)>, LogError> {
    if file_len < SEGMENT_PREAMBLE_SIZE + FOOTER_TRAILER_SIZE {
        return Ok(None);
    }
    let trailer_off = file_len - FOOTER_TRAILER_SIZE;
    let mut trailer = [0u8; FOOTER_TRAILER_SIZE as usize];
    file.read_exact_at(&mut trailer, trailer_off)?;
    if &trailer[8..16] != FOOTER_MAGIC {
        return Ok(None);
    }
    let footer_crc = u32::from_le_bytes(trailer[0..4].try_into().unwrap());
    let footer_len = u32::from_le_bytes(trailer[4..8].try_into().unwrap()) as u64;
    if footer_len > trailer_off {
        return Err(LogError::corruption(trailer_off, "footer length exceeds file size"));
    }
    let footer_off = trailer_off - footer_len;
    let mut record = vec![0u8; footer_len as usize];
    file.read_exact_at(&mut record, footer_off)?;
    if crc32fast::hash(&record) != footer_crc {
        return Err(LogError::corruption(footer_off, "footer CRC mismatch"));
    }
    let footer: SegmentFooter = decode_record(&record, footer_off)?;
    Ok(Some((footer, footer_off)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::log::entry::{LogEntry, ReplicateMsg};
    use crate::types::{OpId, Schema};
    use std::io::Write;
    use tempfile::TempDir;

    fn test_header(seq: u64) -> SegmentHeader {
        SegmentHeader {
            sequence_number: seq,
            tablet_id: "tablet-test".to_string(),
            compression_codec: CompressionCodec::None.as_byte(),
            schema: Schema::default(),
            schema_version: 0,
        }
    }

    fn test_batch(indexes: &[u64]) -> LogEntryBatchPb {
        LogEntryBatchPb::from_entries(
            indexes
                .iter()
                .map(|&i| {
                    LogEntry::Replicate(ReplicateMsg::new(OpId::new(1, i), 42, vec![i as u8; 64]))
                })
                .collect(),
        )
    }

    fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> File {
        let path = dir.path().join(name);
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn test_header_round_trip() {
        let dir = TempDir::new().unwrap();
        let header = test_header(7);
        let bytes = encode_header(&header).unwrap();
        let file = write_file(&dir, "seg", &bytes);
        let (decoded, first_entry) = decode_header(&file, bytes.len() as u64).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(first_entry, bytes.len() as u64);
    }

    #[test]
    fn test_header_bad_magic() {
        let dir = TempDir::new().unwrap();
        let mut bytes = encode_header(&test_header(1)).unwrap();
        bytes[0] ^= 0xff;
        let file = write_file(&dir, "seg", &bytes);
        let err = decode_header(&file, bytes.len() as u64).unwrap_err();
        assert!(err.is_corruption(), "expected corruption, got {}", err);
    }

    #[test]
    fn test_header_unknown_version() {
        let dir = TempDir::new().unwrap();
        let mut bytes = encode_header(&test_header(1)).unwrap();
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        let file = write_file(&dir, "seg", &bytes);
        let err = decode_header(&file, bytes.len() as u64).unwrap_err();
        assert!(matches!(err, LogError::NotSupported(_)), "got {}", err);
    }

    #[test]
    fn test_frame_round_trip_all_codecs() {
        let dir = TempDir::new().unwrap();
        for codec in [
            CompressionCodec::None,
            CompressionCodec::Lz4,
            CompressionCodec::Zstd,
        ] {
            let batch = test_batch(&[1, 2, 3]);
            let bytes = batch.serialize().unwrap();
            let frame = encode_entry_frame(&bytes, codec).unwrap();
            let file = write_file(&dir, "seg", &frame);
            let (decoded, next) = read_entry_frame(&file, 0, frame.len() as u64, codec)
                .unwrap()
                .unwrap();
            assert_eq!(decoded, batch);
            assert_eq!(next, frame.len() as u64);
        }
    }

    #[test]
    fn test_frame_crc_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let bytes = test_batch(&[1]).serialize().unwrap();
        let mut frame = encode_entry_frame(&bytes, CompressionCodec::None).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let file = write_file(&dir, "seg", &frame);
        let err = read_entry_frame(&file, 0, frame.len() as u64, CompressionCodec::None)
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_frame_zeroed_tail_is_clean_end() {
        let dir = TempDir::new().unwrap();
        let file = write_file(&dir, "seg", &[0u8; 64]);
        let result = read_entry_frame(&file, 0, 64, CompressionCodec::None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_frame_overlong_length_is_corruption() {
        let dir = TempDir::new().unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&1_000_000u32.to_le_bytes());
        frame.extend_from_slice(&7u32.to_le_bytes());
        let file = write_file(&dir, "seg", &frame);
        let err =
            read_entry_frame(&file, 0, frame.len() as u64, CompressionCodec::None).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_footer_round_trip() {
        let dir = TempDir::new().unwrap();
        let header_bytes = encode_header(&test_header(1)).unwrap();
        let footer = SegmentFooter {
            num_entries: 12,
            min_replicate_index: Some(3),
            max_replicate_index: Some(14),
            close_timestamp_micros: 123_456,
        };
        let mut bytes = header_bytes.clone();
        bytes.extend_from_slice(&encode_footer(&footer).unwrap());
        let file = write_file(&dir, "seg", &bytes);
        let (decoded, footer_off) = decode_footer(&file, bytes.len() as u64).unwrap().unwrap();
        assert_eq!(decoded, footer);
        assert_eq!(footer_off, header_bytes.len() as u64);
    }

    #[test]
    fn test_missing_footer_reports_none() {
        let dir = TempDir::new().unwrap();
        let bytes = encode_header(&test_header(1)).unwrap();
        let file = write_file(&dir, "seg", &bytes);
        assert!(decode_footer(&file, bytes.len() as u64).unwrap().is_none());
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(
            CompressionCodec::from_name("LZ4").unwrap(),
            CompressionCodec::Lz4
        );
        assert_eq!(
            CompressionCodec::from_name("").unwrap(),
            CompressionCodec::None
        );
        assert!(CompressionCodec::from_name("snappy").is_err());
        assert!(CompressionCodec::from_byte(9).is_err());
    }
}

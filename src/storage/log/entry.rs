use anyhow::Result;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{OpId, Schema, TabletId};

/// A replicated operation: the Raft id assigned by the leader, the
/// timestamp it was proposed at, and the opaque write payload owned by the
/// storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ReplicateMsg {
    pub id: OpId,
    pub timestamp_micros: i64,
    pub payload: Vec<u8>,
}

impl ReplicateMsg {
    pub fn new(id: OpId, timestamp_micros: i64, payload: Vec<u8>) -> Self {
        Self {
            id,
            timestamp_micros,
            payload,
        }
    }

    /// A no-op replicate, written by a new leader as the first op of its
    /// term.
    pub fn noop(id: OpId, timestamp_micros: i64) -> Self {
        Self::new(id, timestamp_micros, Vec::new())
    }
}

/// Records the commit decision for a previously replicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct CommitMsg {
    pub committed_op_id: OpId,
}

/// One durable record of the WAL.
///
/// `FlushMarker` never reaches disk: it exists only to ride the append
/// queue and synchronize a caller with the appender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum LogEntry {
    Replicate(ReplicateMsg),
    Commit(CommitMsg),
    FlushMarker,
}

impl LogEntry {
    pub fn entry_type(&self) -> EntryType {
        match self {
            LogEntry::Replicate(_) => EntryType::Replicate,
            LogEntry::Commit(_) => EntryType::Commit,
            LogEntry::FlushMarker => EntryType::FlushMarker,
        }
    }

    pub fn as_replicate(&self) -> Option<&ReplicateMsg> {
        match self {
            LogEntry::Replicate(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_commit(&self) -> Option<&CommitMsg> {
        match self {
            LogEntry::Commit(msg) => Some(msg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Replicate,
    Commit,
    FlushMarker,
}

/// The serialized unit of appending: one or more entries of uniform type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogEntryBatchPb {
    pub entries: Vec<LogEntry>,
}

impl LogEntryBatchPb {
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard();
        let (batch, _) = bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize entry batch: {}", e);
            e
        })?;
        Ok(batch)
    }

    /// Upper-bound estimate of the serialized size, used for queue byte
    /// accounting before the batch has actually been encoded.
    pub fn size_hint(&self) -> usize {
        const PER_ENTRY_OVERHEAD: usize = 32;
        self.entries
            .iter()
            .map(|e| {
                PER_ENTRY_OVERHEAD
                    + match e {
                        LogEntry::Replicate(r) => r.payload.len(),
                        LogEntry::Commit(_) | LogEntry::FlushMarker => 0,
                    }
            })
            .sum()
    }

    /// The highest replicate OpId in the batch, if any.
    pub fn max_replicate_op_id(&self) -> Option<OpId> {
        self.entries
            .iter()
            .filter_map(LogEntry::as_replicate)
            .map(|r| r.id)
            .max()
    }
}

/// Written at the front of every segment file. Identifies the tablet, the
/// segment's position in the sequence, the compression codec of its entry
/// frames, and the schema the entries were written under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SegmentHeader {
    pub sequence_number: u64,
    pub tablet_id: TabletId,
    /// Single-byte codec discriminant; see `CompressionCodec`.
    pub compression_codec: u8,
    pub schema: Schema,
    pub schema_version: u32,
}

/// Written when a segment is closed. A segment without a footer is either
/// actively written or was truncated by a crash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SegmentFooter {
    pub num_entries: u64,
    pub min_replicate_index: Option<u64>,
    pub max_replicate_index: Option<u64>,
    pub close_timestamp_micros: i64,
}

impl SegmentFooter {
    /// Folds one appended batch into the footer accumulator.
    pub fn accumulate(&mut self, batch: &LogEntryBatchPb) {
        self.num_entries += batch.entries.len() as u64;
        for entry in &batch.entries {
            if let LogEntry::Replicate(r) = entry {
                let idx = r.id.index;
                self.min_replicate_index =
                    Some(self.min_replicate_index.map_or(idx, |m| m.min(idx)));
                self.max_replicate_index =
                    Some(self.max_replicate_index.map_or(idx, |m| m.max(idx)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicate(term: u64, index: u64) -> LogEntry {
        LogEntry::Replicate(ReplicateMsg::new(
            OpId::new(term, index),
            1000,
            vec![0u8; 16],
        ))
    }

    #[test]
    fn test_batch_round_trip() {
        let batch = LogEntryBatchPb::from_entries(vec![replicate(1, 1), replicate(1, 2)]);
        let bytes = batch.serialize().unwrap();
        let decoded = LogEntryBatchPb::deserialize(&bytes).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_size_hint_covers_encoding() {
        let batch = LogEntryBatchPb::from_entries(vec![replicate(1, 1), replicate(1, 2)]);
        let bytes = batch.serialize().unwrap();
        assert!(batch.size_hint() >= bytes.len());
    }

    #[test]
    fn test_max_replicate_op_id() {
        let batch = LogEntryBatchPb::from_entries(vec![replicate(2, 5), replicate(2, 7)]);
        assert_eq!(batch.max_replicate_op_id(), Some(OpId::new(2, 7)));

        let commits = LogEntryBatchPb::from_entries(vec![LogEntry::Commit(CommitMsg {
            committed_op_id: OpId::new(2, 5),
        })]);
        assert_eq!(commits.max_replicate_op_id(), None);
    }

    #[test]
    fn test_footer_accumulate_bounds() {
        let mut footer = SegmentFooter::default();
        footer.accumulate(&LogEntryBatchPb::from_entries(vec![replicate(1, 10)]));
        footer.accumulate(&LogEntryBatchPb::from_entries(vec![
            replicate(1, 11),
            LogEntry::Commit(CommitMsg {
                committed_op_id: OpId::new(1, 10),
            }),
        ]));
        assert_eq!(footer.num_entries, 3);
        assert_eq!(footer.min_replicate_index, Some(10));
        assert_eq!(footer.max_replicate_index, Some(11));
    }
}

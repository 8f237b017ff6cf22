//! The in-memory unit of appending.
//!
//! A batch is created by a producer, reserved into the entry queue, then
//! serialized by the producer while the appender may still be working on
//! earlier batches. The `Ready` transition is the rendezvous: the producer
//! sends the finished batch through a oneshot that the appender awaits,
//! preserving FIFO delivery while overlapping serialization with I/O.

use tokio::sync::oneshot;

use crate::error::LogError;
use crate::storage::log::entry::{EntryType, LogEntry, LogEntryBatchPb};
use crate::types::OpId;

/// Receives the append outcome once the appender has made the batch
/// durable (or failed trying).
pub type AppendCompletion = oneshot::Receiver<Result<(), LogError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchState {
    Initialized,
    Reserved,
    Serialized,
    Ready,
    FailedAppend,
}

#[derive(Debug)]
pub(crate) struct LogEntryBatch {
    entry_type: EntryType,
    pb: LogEntryBatchPb,
    buffer: Vec<u8>,
    count: usize,
    total_size_bytes: usize,
    state: BatchState,
}

impl LogEntryBatch {
    /// Builds a batch of uniform entry type. Replicate payloads stay owned
    /// by the batch until the appender consumes it, keeping them alive for
    /// the duration of the append.
    pub fn new(entry_type: EntryType, pb: LogEntryBatchPb) -> Self {
        debug_assert!(
            pb.entries.iter().all(|e| e.entry_type() == entry_type),
            "mixed entry types in one batch"
        );
        let count = pb.entries.len();
        let is_flush_marker =
            count == 1 && matches!(pb.entries[0], LogEntry::FlushMarker);
        let total_size_bytes = if is_flush_marker { 0 } else { pb.size_hint() };
        Self {
            entry_type,
            pb,
            buffer: Vec::new(),
            count,
            total_size_bytes,
            state: BatchState::Initialized,
        }
    }

    pub fn mark_reserved(&mut self) {
        debug_assert_eq!(self.state, BatchState::Initialized);
        self.state = BatchState::Reserved;
    }

    /// Serializes the entries into the cached buffer. Flush markers never
    /// reach disk, so they serialize to nothing.
    pub fn serialize(&mut self) -> Result<(), LogError> {
        debug_assert_eq!(self.state, BatchState::Reserved);
        self.buffer.clear();
        if self.total_size_bytes == 0 && self.entry_type == EntryType::FlushMarker {
            self.state = BatchState::Serialized;
            return Ok(());
        }
        self.buffer = self
            .pb
            .serialize()
            .map_err(|e| LogError::InvalidArgument(format!("batch serialization failed: {}", e)))?;
        self.state = BatchState::Serialized;
        Ok(())
    }

    pub fn mark_ready(&mut self) {
        debug_assert_eq!(self.state, BatchState::Serialized);
        self.state = BatchState::Ready;
    }

    pub fn set_failed_to_append(&mut self) {
        self.state = BatchState::FailedAppend;
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn data(&self) -> &[u8] {
        debug_assert!(matches!(
            self.state,
            BatchState::Ready | BatchState::FailedAppend
        ));
        &self.buffer
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn total_size_bytes(&self) -> usize {
        self.total_size_bytes
    }

    pub fn pb(&self) -> &LogEntryBatchPb {
        &self.pb
    }

    pub fn max_replicate_op_id(&self) -> Option<OpId> {
        self.pb.max_replicate_op_id()
    }
}

/// Producer-side handle returned by `reserve`: the batch itself plus the
/// sender half of the ready rendezvous.
#[derive(Debug)]
pub(crate) struct ReservedBatch {
    batch: LogEntryBatch,
    ready_tx: oneshot::Sender<LogEntryBatch>,
}

impl ReservedBatch {
    pub fn new(batch: LogEntryBatch, ready_tx: oneshot::Sender<LogEntryBatch>) -> Self {
        Self { batch, ready_tx }
    }

    /// Serializes the batch and hands it to the appender. If the appender
    /// is already gone (shutdown), the batch is dropped and the producer's
    /// completion fires with a closed-channel error.
    pub fn serialize_and_mark_ready(mut self) -> Result<(), LogError> {
        self.batch.serialize()?;
        self.batch.mark_ready();
        let _ = self.ready_tx.send(self.batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::log::entry::ReplicateMsg;

    fn replicate_pb(indexes: &[u64]) -> LogEntryBatchPb {
        LogEntryBatchPb::from_entries(
            indexes
                .iter()
                .map(|&i| LogEntry::Replicate(ReplicateMsg::new(OpId::new(1, i), 5, vec![1, 2, 3])))
                .collect(),
        )
    }

    #[test]
    fn test_state_transitions() {
        let mut batch = LogEntryBatch::new(EntryType::Replicate, replicate_pb(&[1, 2]));
        assert_eq!(batch.count(), 2);
        batch.mark_reserved();
        batch.serialize().unwrap();
        batch.mark_ready();
        assert!(!batch.data().is_empty());
        assert_eq!(batch.max_replicate_op_id(), Some(OpId::new(1, 2)));
    }

    #[test]
    fn test_flush_marker_serializes_to_nothing() {
        let pb = LogEntryBatchPb::from_entries(vec![LogEntry::FlushMarker]);
        let mut batch = LogEntryBatch::new(EntryType::FlushMarker, pb);
        assert_eq!(batch.total_size_bytes(), 0);
        batch.mark_reserved();
        batch.serialize().unwrap();
        batch.mark_ready();
        assert!(batch.data().is_empty());
    }

    #[tokio::test]
    async fn test_ready_rendezvous_delivers_batch() {
        let (tx, rx) = oneshot::channel();
        let mut batch = LogEntryBatch::new(EntryType::Replicate, replicate_pb(&[1]));
        batch.mark_reserved();
        let reserved = ReservedBatch::new(batch, tx);
        reserved.serialize_and_mark_ready().unwrap();
        let delivered = rx.await.unwrap();
        assert_eq!(delivered.count(), 1);
        assert!(!delivered.data().is_empty());
    }
}

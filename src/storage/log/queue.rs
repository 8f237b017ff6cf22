//! The byte-bounded entry queue between producers and the appender.
//!
//! Ordering comes from an unbounded mpsc channel; backpressure comes from
//! a semaphore whose permits represent serialized bytes. A producer's
//! `reserve` acquires permits for the batch before enqueueing and blocks
//! while the queue is over budget. The permit rides on the queued item and
//! is released when the appender finalizes the batch, so memory is handed
//! back in completion order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

use crate::error::LogError;
use crate::storage::log::batch::{AppendCompletion, LogEntryBatch, ReservedBatch};

/// One slot of the queue, as seen by the appender. The batch itself
/// arrives through `ready_rx` once the producer finishes serializing.
/// Dropping `permit` releases the batch's byte budget back to producers;
/// the appender does so as each batch is finalized, before later
/// callbacks run.
pub(crate) struct QueuedBatch {
    pub ready_rx: oneshot::Receiver<LogEntryBatch>,
    pub result_tx: oneshot::Sender<Result<(), LogError>>,
    pub permit: Option<OwnedSemaphorePermit>,
}

pub(crate) struct EntryQueue {
    tx: Mutex<Option<UnboundedSender<QueuedBatch>>>,
    bytes: Arc<Semaphore>,
    budget: usize,
}

impl EntryQueue {
    pub fn new(budget_bytes: usize) -> (Self, UnboundedReceiver<QueuedBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
                bytes: Arc::new(Semaphore::new(budget_bytes)),
                budget: budget_bytes,
            },
            rx,
        )
    }

    /// Charges the batch against the byte budget (blocking while over it)
    /// and enqueues its slot. Returns the producer-side handle and the
    /// completion the caller can await.
    ///
    /// A batch larger than the whole budget is clamped so it can still be
    /// admitted once the queue drains empty.
    pub async fn reserve(
        &self,
        mut batch: LogEntryBatch,
    ) -> Result<(ReservedBatch, AppendCompletion), LogError> {
        let charge = batch
            .total_size_bytes()
            .min(self.budget)
            .min(u32::MAX as usize) as u32;
        let permit = if charge > 0 {
            Some(
                self.bytes
                    .clone()
                    .acquire_many_owned(charge)
                    .await
                    .map_err(|_| LogError::shutting_down())?,
            )
        } else {
            if self.bytes.is_closed() {
                return Err(LogError::shutting_down());
            }
            None
        };

        batch.mark_reserved();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        let guard = self.tx.lock();
        let sender = guard.as_ref().ok_or_else(LogError::shutting_down)?;
        sender
            .send(QueuedBatch {
                ready_rx,
                result_tx,
                permit,
            })
            .map_err(|_| LogError::shutting_down())?;

        Ok((ReservedBatch::new(batch, ready_tx), result_rx))
    }

    /// Rejects all future reservations and lets the appender drain what is
    /// already enqueued. Producers blocked on the byte budget wake with
    /// `ServiceUnavailable`.
    pub fn shutdown(&self) {
        self.bytes.close();
        *self.tx.lock() = None;
    }
}

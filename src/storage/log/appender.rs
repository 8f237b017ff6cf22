//! The single consumer of the entry queue.
//!
//! One appender task runs per log. Each drain of the queue is one group
//! commit: every ready batch is written in FIFO order, one sync covers the
//! whole group (unless it was all COMMIT messages, which may ride on the
//! next sync), and completions fire in reserve order afterwards.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::LogError;
use crate::metrics::names;
use crate::storage::log::entry::EntryType;
use crate::storage::log::log::LogContext;
use crate::storage::log::queue::QueuedBatch;

/// Upper bound on batches taken per drain. Bounds callback latency of the
/// first batch in a deep queue without giving up group commit.
const MAX_BATCHES_PER_DRAIN: usize = 64;

pub(crate) fn spawn_appender(
    ctx: Arc<LogContext>,
    mut rx: UnboundedReceiver<QueuedBatch>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Starting log append task for tablet {}", ctx.tablet_id);
        let mut shutting_down = false;
        while !shutting_down {
            let mut drained = Vec::with_capacity(MAX_BATCHES_PER_DRAIN);
            // A closed, fully drained queue is the shutdown signal; any
            // batches returned alongside it still get a final pass.
            if rx.recv_many(&mut drained, MAX_BATCHES_PER_DRAIN).await == 0 {
                shutting_down = true;
            }
            if drained.is_empty() {
                continue;
            }
            ctx.metrics
                .counter(names::ENTRY_BATCHES_PER_GROUP, drained.len() as u64);
            let group_start = Instant::now();

            // Completions held until after the group's sync, in FIFO
            // order.
            let mut completed: Vec<oneshot::Sender<Result<(), LogError>>> = Vec::new();
            let mut is_all_commits = true;

            for queued in drained {
                let QueuedBatch {
                    ready_rx,
                    result_tx,
                    permit,
                } = queued;
                let mut batch = match ready_rx.await {
                    Ok(batch) => batch,
                    Err(_) => {
                        // Producer dropped its reservation without marking
                        // ready; nothing to append.
                        warn!("Reserved batch abandoned before serialization");
                        continue;
                    }
                };
                if is_all_commits && batch.entry_type() != EntryType::Commit {
                    is_all_commits = false;
                }
                let append_result = ctx.do_append(&batch).await;
                // Free the queue budget as each batch is finalized so
                // blocked producers make progress before callbacks run.
                drop(permit);
                match append_result {
                    Ok(()) => completed.push(result_tx),
                    Err(e) => {
                        error!("Error appending to the log: {}", e);
                        batch.set_failed_to_append();
                        // Later batches in the drain are still attempted;
                        // this one's producer learns its fate now.
                        let _ = result_tx.send(Err(e));
                    }
                }
            }

            let sync_result = if is_all_commits {
                Ok(())
            } else {
                ctx.sync()
            };
            match sync_result {
                Ok(()) => {
                    for tx in completed {
                        let _ = tx.send(Ok(()));
                    }
                }
                Err(e) => {
                    error!("Error syncing log: {}", e);
                    for tx in completed {
                        let _ = tx.send(Err(e.clone()));
                    }
                }
            }
            ctx.metrics
                .observe_since(names::GROUP_COMMIT_LATENCY, group_start);
        }
        debug!("Exiting log append task for tablet {}", ctx.tablet_id);
    })
}

//! The log facade: lifecycle, rollover, segment allocation, retention.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{maybe_fault, LogOptions};
use crate::env::FsEnv;
use crate::error::LogError;
use crate::metrics::{names, LogMetrics};
use crate::storage::log::appender::spawn_appender;
use crate::storage::log::batch::{AppendCompletion, LogEntryBatch};
use crate::storage::log::codec::{CompressionCodec, FRAME_HEADER_SIZE};
use crate::storage::log::entry::{
    CommitMsg, EntryType, LogEntry, LogEntryBatchPb, ReplicateMsg, SegmentFooter, SegmentHeader,
};
use crate::storage::log::index::{LogIndex, LogIndexEntry};
use crate::storage::log::queue::EntryQueue;
use crate::storage::log::reader::{segment_file_name, LogReader};
use crate::storage::log::segment::{ReadableLogSegment, WritableLogSegment};
use crate::types::{OpId, RetentionIndexes, Schema, TabletId};

const PLACEHOLDER_PREFIX: &str = ".tmp.newsegment";

/// A segment file created ahead of need, still under its temporary name.
pub(crate) struct PlaceholderSegment {
    path: PathBuf,
    file: File,
}

type AllocResult = Result<PlaceholderSegment, LogError>;

enum AllocationState {
    NotStarted,
    InProgress(oneshot::Receiver<AllocResult>),
    Finished(AllocResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocationPoll {
    NotStarted,
    InProgress,
    Finished,
}

/// The active segment plus the footer being accumulated for it.
struct ActiveSegment {
    segment: WritableLogSegment,
    footer: SegmentFooter,
}

/// State shared between the facade, the appender task, and the allocation
/// task.
pub(crate) struct LogContext {
    pub(crate) options: LogOptions,
    pub(crate) env: Arc<dyn FsEnv>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: LogMetrics,
    pub(crate) tablet_id: TabletId,
    pub(crate) log_dir: PathBuf,
    pub(crate) compression: CompressionCodec,
    pub(crate) index: Arc<LogIndex>,
    pub(crate) reader: Arc<LogReader>,

    active: Mutex<Option<ActiveSegment>>,
    active_seq: AtomicU64,
    last_entry_op_id: RwLock<OpId>,
    schema: RwLock<(Schema, u32)>,
    allocation: Mutex<AllocationState>,
    sync_disabled: AtomicBool,
}

impl LogContext {
    /// Appends one ready batch to the active segment: the workhorse of the
    /// appender task.
    pub(crate) async fn do_append(self: &Arc<Self>, batch: &LogEntryBatch) -> Result<(), LogError> {
        if batch.count() == 0 {
            return Ok(());
        }
        if maybe_fault(self.options.inject_io_error_on_append_fraction) {
            return Err(LogError::Io(Arc::new(io::Error::new(
                io::ErrorKind::Other,
                "Injected IOError in do_append()",
            ))));
        }
        let data = batch.data();
        if data.is_empty() {
            // Flush markers carry no bytes; their completion still rides
            // the group sync.
            return Ok(());
        }

        if batch.entry_type() == EntryType::Replicate {
            // Tracked before the write (and before the fsync) so that
            // consensus can bootstrap from it; callers must not treat it
            // as a durability watermark.
            if let Some(max) = batch.max_replicate_op_id() {
                *self.last_entry_op_id.write() = max;
            }
        }

        match self.poll_allocation() {
            AllocationPoll::NotStarted => {
                let projected = self.active_written_offset()? + data.len() as u64 + FRAME_HEADER_SIZE;
                if projected > self.options.max_segment_size() {
                    info!(
                        "T {}: Max segment size reached. Starting new segment allocation",
                        self.tablet_id
                    );
                    self.async_allocate_segment()?;
                    if !self.options.async_preallocate_segments {
                        self.roll_over().await?;
                    }
                }
            }
            AllocationPoll::Finished => self.roll_over().await?,
            AllocationPoll::InProgress => {
                debug!("Segment allocation already in progress...")
            }
        }

        let append_start = Instant::now();
        let (start_offset, written_offset) = {
            let mut active = self.active.lock();
            let state = active
                .as_mut()
                .ok_or_else(|| LogError::IllegalState("log has no active segment".to_string()))?;
            let start = state.segment.append_entry_batch(data, self.compression)?;
            state.footer.accumulate(batch.pb());
            (start, state.segment.written_offset())
        };
        self.metrics.observe_since(names::APPEND_LATENCY, append_start);
        self.metrics.counter(names::BYTES_LOGGED, data.len() as u64);

        // Expose the new bytes to readers of the active segment.
        self.reader.update_last_segment_offset(written_offset);

        if batch.entry_type() == EntryType::Replicate {
            let segment_sequence_number = self.active_seq.load(Ordering::Acquire);
            for entry in &batch.pb().entries {
                if let LogEntry::Replicate(msg) = entry {
                    // One index entry per op, all pointing at the start of
                    // the batch; readers seek to the batch and stream to
                    // the specific entry.
                    self.index.add_entry(LogIndexEntry {
                        op_id: msg.id,
                        segment_sequence_number,
                        offset_in_segment: start_offset,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Makes everything appended so far durable, honoring the fsync policy
    /// and the test-only latency injection.
    pub(crate) fn sync(&self) -> Result<(), LogError> {
        if !self.sync_disabled.load(Ordering::Acquire) {
            if let Some(latency) = self.options.sample_sync_latency() {
                warn!(
                    "T {}: Injecting {}ms of latency in sync()",
                    self.tablet_id,
                    latency.as_millis()
                );
                std::thread::sleep(latency);
            }
        }
        if self.options.force_fsync_all && !self.sync_disabled.load(Ordering::Acquire) {
            let active = self.active.lock();
            if let Some(state) = active.as_ref() {
                self.metrics.time(names::SYNC_LATENCY, || state.segment.sync())?;
            }
        }
        Ok(())
    }

    pub(crate) fn set_sync_disabled(&self, disabled: bool) {
        self.sync_disabled.store(disabled, Ordering::Release);
    }

    pub(crate) fn latest_entry_op_id(&self) -> OpId {
        *self.last_entry_op_id.read()
    }

    pub(crate) fn set_schema_for_next_segment(&self, schema: Schema, version: u32) {
        *self.schema.write() = (schema, version);
    }

    fn active_written_offset(&self) -> Result<u64, LogError> {
        let active = self.active.lock();
        let state = active
            .as_ref()
            .ok_or_else(|| LogError::IllegalState("log has no active segment".to_string()))?;
        Ok(state.segment.written_offset())
    }

    /// Starts the background allocation of the next segment. At most one
    /// allocation is in flight.
    pub(crate) fn async_allocate_segment(self: &Arc<Self>) -> Result<(), LogError> {
        let mut allocation = self.allocation.lock();
        if !matches!(*allocation, AllocationState::NotStarted) {
            return Err(LogError::IllegalState(
                "segment allocation already started".to_string(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let result = ctx.preallocate_new_segment();
            // A dropped receiver just means the log lost interest
            // (shutdown mid-allocation).
            let _ = tx.send(result);
        });
        *allocation = AllocationState::InProgress(rx);
        Ok(())
    }

    fn poll_allocation(&self) -> AllocationPoll {
        let mut allocation = self.allocation.lock();
        match &mut *allocation {
            AllocationState::NotStarted => AllocationPoll::NotStarted,
            AllocationState::Finished(_) => AllocationPoll::Finished,
            AllocationState::InProgress(rx) => match rx.try_recv() {
                Ok(result) => {
                    *allocation = AllocationState::Finished(result);
                    AllocationPoll::Finished
                }
                Err(oneshot::error::TryRecvError::Empty) => AllocationPoll::InProgress,
                Err(oneshot::error::TryRecvError::Closed) => {
                    *allocation = AllocationState::Finished(Err(LogError::IllegalState(
                        "segment allocation task aborted".to_string(),
                    )));
                    AllocationPoll::Finished
                }
            },
        }
    }

    /// Waits out any in-flight allocation and consumes its result,
    /// resetting the state machine to NotStarted.
    async fn take_finished_allocation(&self) -> Result<PlaceholderSegment, LogError> {
        let taken = {
            let mut allocation = self.allocation.lock();
            std::mem::replace(&mut *allocation, AllocationState::NotStarted)
        };
        match taken {
            AllocationState::NotStarted => Err(LogError::IllegalState(
                "no segment allocation in flight".to_string(),
            )),
            AllocationState::Finished(result) => result,
            AllocationState::InProgress(rx) => rx.await.unwrap_or_else(|_| {
                Err(LogError::IllegalState(
                    "segment allocation task aborted".to_string(),
                ))
            }),
        }
    }

    /// Runs on the allocation task: creates the placeholder file and,
    /// when configured, extends it to the full segment size up front.
    fn preallocate_new_segment(&self) -> Result<PlaceholderSegment, LogError> {
        let (path, file) = self
            .env
            .new_temp_writable_file(&self.log_dir, PLACEHOLDER_PREFIX)?;
        debug!("Created next WAL segment, placeholder path: {:?}", path);

        if maybe_fault(self.options.inject_io_error_on_preallocate_fraction) {
            return Err(LogError::Io(Arc::new(io::Error::new(
                io::ErrorKind::Other,
                "Injected IOError in preallocate_new_segment()",
            ))));
        }

        if self.options.preallocate_segments {
            let needed = self.options.max_segment_size();
            let available = self.env.available_space(&self.log_dir)?;
            if available.saturating_sub(self.options.wal_dir_reserved_bytes) < needed {
                return Err(LogError::Io(Arc::new(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "insufficient disk space to preallocate {} byte segment",
                        needed
                    ),
                ))));
            }
            file.set_len(needed)?;
        }
        Ok(PlaceholderSegment { path, file })
    }

    /// Syncs and closes the current segment, switches to the preallocated
    /// one, and republishes both through the reader.
    pub(crate) async fn roll_over(self: &Arc<Self>) -> Result<(), LogError> {
        let start = Instant::now();
        let placeholder = self.take_finished_allocation().await?;
        self.sync()?;
        self.close_current_segment()?;
        self.switch_to_allocated_segment(placeholder)?;
        self.metrics.observe_since(names::ROLL_LATENCY, start);
        let active = self.active.lock();
        if let Some(state) = active.as_ref() {
            info!(
                "T {}: Rolled over to a new log segment at {:?}",
                self.tablet_id,
                state.segment.path()
            );
        }
        Ok(())
    }

    /// Stamps and writes the active segment's footer. The segment is
    /// immutable afterwards but still registered as active until
    /// `replace_current_in_reader` or `switch_to_allocated_segment` runs.
    pub(crate) fn close_current_segment(&self) -> Result<(), LogError> {
        let mut active = self.active.lock();
        let state = active
            .as_mut()
            .ok_or_else(|| LogError::IllegalState("log has no active segment".to_string()))?;
        if state.footer.min_replicate_index.is_none() {
            debug!(
                "Writing a segment without any REPLICATE message. Segment: {:?}",
                state.segment.path()
            );
        }
        state.footer.close_timestamp_micros = self.clock.now_micros();
        let footer = state.footer.clone();
        state.segment.write_footer_and_close(&footer)
    }

    /// Re-opens the closed active segment as a readable one and swaps it
    /// into the reader's last slot.
    pub(crate) fn replace_current_in_reader(&self) -> Result<(), LogError> {
        let taken = self.active.lock().take();
        if let Some(state) = taken {
            debug_assert!(state.segment.is_closed());
            let path = state.segment.path().to_path_buf();
            let file = self.env.new_random_access_file(&path)?;
            let readable = ReadableLogSegment::open(path, file)?;
            self.reader.replace_last_segment(Arc::new(readable))?;
        }
        Ok(())
    }

    /// Renames the placeholder into place as the next numbered segment and
    /// makes it the active one.
    pub(crate) fn switch_to_allocated_segment(
        &self,
        placeholder: PlaceholderSegment,
    ) -> Result<(), LogError> {
        let new_seq = self.active_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let new_path = self.log_dir.join(segment_file_name(new_seq));
        self.env.rename_file(&placeholder.path, &new_path)?;
        if self.options.force_fsync_all {
            self.env.sync_dir(&self.log_dir)?;
        }

        let (schema, schema_version) = self.schema.read().clone();
        let header = SegmentHeader {
            sequence_number: new_seq,
            tablet_id: self.tablet_id.clone(),
            compression_codec: self.compression.as_byte(),
            schema,
            schema_version,
        };

        let mut segment = WritableLogSegment::new(new_path.clone(), placeholder.file);
        segment.write_header(header.clone())?;

        // The previously active segment (already footered by
        // close_current_segment) becomes a plain closed segment in the
        // reader.
        self.replace_current_in_reader()?;

        // Register a readable view of the new segment; its watermark
        // advances as the appender publishes durable bytes.
        let readable_file = self.env.new_random_access_file(&new_path)?;
        let readable = ReadableLogSegment::new_active(
            new_path,
            readable_file,
            header,
            segment.first_entry_offset(),
        )?;
        self.reader.append_empty_segment(Arc::new(readable))?;

        *self.active.lock() = Some(ActiveSegment {
            segment,
            footer: SegmentFooter::default(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Writing,
    Closed,
}

/// A single tablet's write-ahead log.
///
/// Producers append through the async `append_*` methods, which reserve a
/// slot in the group-commit queue and return a completion that fires once
/// the batch is durable per the fsync policy. A background appender task
/// drains the queue; a background allocation task keeps the next segment
/// ready before the active one fills up.
pub struct Log {
    ctx: Arc<LogContext>,
    queue: EntryQueue,
    appender: Mutex<Option<JoinHandle<()>>>,
    state: RwLock<LogState>,
}

impl Log {
    /// Opens the WAL for `tablet_id` under `wal_root`, creating the
    /// directory if needed. Existing segments are picked up by the reader
    /// and sequence numbering resumes after them; appends always go to a
    /// fresh segment.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        options: LogOptions,
        env: Arc<dyn FsEnv>,
        clock: Arc<dyn Clock>,
        metrics: LogMetrics,
        wal_root: &Path,
        tablet_id: &str,
        schema: Schema,
        schema_version: u32,
    ) -> Result<Log, LogError> {
        options.validate()?;
        let compression = CompressionCodec::from_name(&options.compression_codec)?;

        let log_dir = wal_root.join(tablet_id);
        env.create_dir_if_missing(&log_dir)?;

        let index = Arc::new(LogIndex::open(
            env.clone(),
            log_dir.clone(),
            options.entries_per_index_chunk,
        )?);
        let reader = Arc::new(LogReader::open(&env, &log_dir, index.clone())?);

        // Continue the sequence where a previous incarnation left off.
        let last_seq = reader
            .segments_snapshot()
            .last()
            .map(|s| s.sequence_number())
            .unwrap_or(0);

        if options.force_fsync_all {
            info!("T {}: Log is configured to fsync() on all append groups", tablet_id);
        } else {
            info!(
                "T {}: Log is configured to *not* fsync() on all append groups",
                tablet_id
            );
        }

        let ctx = Arc::new(LogContext {
            options: options.clone(),
            env,
            clock,
            metrics,
            tablet_id: tablet_id.to_string(),
            log_dir,
            compression,
            index,
            reader,
            active: Mutex::new(None),
            active_seq: AtomicU64::new(last_seq),
            last_entry_op_id: RwLock::new(OpId::MIN),
            schema: RwLock::new((schema, schema_version)),
            allocation: Mutex::new(AllocationState::NotStarted),
            sync_disabled: AtomicBool::new(false),
        });

        // Always start a fresh segment on open.
        ctx.async_allocate_segment()?;
        let placeholder = ctx.take_finished_allocation().await?;
        ctx.switch_to_allocated_segment(placeholder)?;

        let (queue, rx) = EntryQueue::new(options.group_commit_queue_size_bytes);
        let appender = spawn_appender(ctx.clone(), rx);

        Ok(Log {
            ctx,
            queue,
            appender: Mutex::new(Some(appender)),
            state: RwLock::new(LogState::Writing),
        })
    }

    fn check_writing(&self) -> Result<(), LogError> {
        match *self.state.read() {
            LogState::Writing => Ok(()),
            LogState::Closed => Err(LogError::shutting_down()),
        }
    }

    async fn reserve_and_append(
        &self,
        entry_type: EntryType,
        pb: LogEntryBatchPb,
    ) -> Result<AppendCompletion, LogError> {
        self.check_writing()?;
        let batch = LogEntryBatch::new(entry_type, pb);
        let (reserved, completion) = self.queue.reserve(batch).await?;
        // Serialization happens on the producer, in parallel with the
        // appender working through earlier batches.
        reserved.serialize_and_mark_ready()?;
        Ok(completion)
    }

    /// Queues a batch of replicate messages. The returned completion fires
    /// once the batch (and everything reserved before it) is durable.
    pub async fn append_replicates(
        &self,
        replicates: Vec<ReplicateMsg>,
    ) -> Result<AppendCompletion, LogError> {
        let entries = replicates.into_iter().map(LogEntry::Replicate).collect();
        self.reserve_and_append(EntryType::Replicate, LogEntryBatchPb::from_entries(entries))
            .await
    }

    /// Queues a single commit record.
    pub async fn append_commit(&self, commit: CommitMsg) -> Result<AppendCompletion, LogError> {
        if maybe_fault(self.ctx.options.crash_before_append_commit_fraction) {
            panic!("Injected crash before appending COMMIT to the log");
        }
        let pb = LogEntryBatchPb::from_entries(vec![LogEntry::Commit(commit)]);
        self.reserve_and_append(EntryType::Commit, pb).await
    }

    /// Pushes a flush marker through the queue and waits for it, which
    /// transitively waits for every batch reserved before it.
    pub async fn wait_until_all_flushed(&self) -> Result<(), LogError> {
        let pb = LogEntryBatchPb::from_entries(vec![LogEntry::FlushMarker]);
        let completion = self.reserve_and_append(EntryType::FlushMarker, pb).await?;
        completion.await.map_err(|_| LogError::shutting_down())?
    }

    /// Synchronously appends and syncs a single entry, bypassing the
    /// queue. Only safe while no concurrent producers are active; used by
    /// bootstrap-style writers and tests.
    pub async fn append_entry(&self, entry: LogEntry) -> Result<(), LogError> {
        self.check_writing()?;
        let entry_type = entry.entry_type();
        let mut batch =
            LogEntryBatch::new(entry_type, LogEntryBatchPb::from_entries(vec![entry]));
        batch.mark_reserved();
        batch.serialize()?;
        batch.mark_ready();
        self.ctx.do_append(&batch).await?;
        self.ctx.sync()
    }

    /// The highest OpId ever appended, `OpId::MIN` when none. May be
    /// momentarily ahead of what is durable; see `do_append`.
    pub fn latest_entry_op_id(&self) -> OpId {
        self.ctx.latest_entry_op_id()
    }

    pub fn reader(&self) -> Arc<LogReader> {
        self.ctx.reader.clone()
    }

    pub fn tablet_id(&self) -> &str {
        &self.ctx.tablet_id
    }

    /// The tablet's WAL directory.
    pub fn log_dir(&self) -> &Path {
        &self.ctx.log_dir
    }

    /// Records the schema to stamp into the *next* segment's header;
    /// the in-flight segment is unaffected.
    pub fn set_schema_for_next_segment(&self, schema: Schema, version: u32) {
        self.ctx.set_schema_for_next_segment(schema, version);
    }

    /// Disables fsync entirely, injections included. Test hook.
    pub fn set_sync_disabled(&self, disabled: bool) {
        self.ctx.set_sync_disabled(disabled);
    }

    /// Forces allocation of a fresh segment and rolls onto it. Callers
    /// must be quiesced: this races with an active appender.
    pub async fn allocate_segment_and_roll_over(&self) -> Result<(), LogError> {
        self.check_writing()?;
        self.ctx.async_allocate_segment()?;
        self.ctx.roll_over().await
    }

    /// Computes the deletable prefix of closed segments under the
    /// retention rules and removes it, then GCs index chunks below the
    /// new replicate floor. Returns the number of segments deleted.
    pub fn gc(&self, retention: RetentionIndexes) -> Result<usize, LogError> {
        let deleted = {
            let state = self.state.write();
            if *state != LogState::Writing {
                return Err(LogError::IllegalState("log is not open".to_string()));
            }
            debug!(
                "T {}: Running Log GC: retaining ops >= {} for durability, ops >= {} for peers",
                self.ctx.tablet_id, retention.for_durability, retention.for_peers
            );
            let snapshot = self.ctx.reader.segments_snapshot();
            let prefix = gcable_prefix_len(&snapshot, retention, &self.ctx.options);
            if prefix == 0 {
                debug!("T {}: No segments to delete", self.ctx.tablet_id);
                return Ok(0);
            }
            let through_seq = snapshot[prefix - 1].sequence_number();
            self.ctx
                .reader
                .trim_segments_up_to_and_including(through_seq)?;
            snapshot.into_iter().take(prefix).collect::<Vec<_>>()
        };

        // Files are unlinked outside the state lock; they are no longer
        // reachable through the reader.
        let mut num_gced = 0;
        for segment in &deleted {
            let ops = match (segment.min_replicate_index(), segment.max_replicate_index()) {
                (Some(min), Some(max)) => format!(" (ops {}-{})", min, max),
                _ => String::new(),
            };
            info!(
                "T {}: Deleting log segment in path: {:?}{}",
                self.ctx.tablet_id,
                segment.path(),
                ops
            );
            self.ctx.env.delete_file(segment.path())?;
            num_gced += 1;
        }

        if let Some(min_idx) = self.ctx.reader.min_replicate_index() {
            self.ctx.index.gc_below(min_idx)?;
        }
        Ok(num_gced)
    }

    /// Total file size of the prefix `gc` would delete, without mutating
    /// anything.
    pub fn gcable_data_size(&self, retention: RetentionIndexes) -> Result<u64, LogError> {
        self.check_writing()?;
        let snapshot = self.ctx.reader.segments_snapshot();
        let prefix = gcable_prefix_len(&snapshot, retention, &self.ctx.options);
        Ok(snapshot
            .iter()
            .take(prefix)
            .map(|s| s.file_size())
            .sum())
    }

    /// Maps each closed segment's `max_replicate_index` to the cumulative
    /// size of that segment and everything after it. Maintenance
    /// schedulers use it to estimate replay cost at a given retention
    /// point.
    pub fn replay_size_map(&self) -> Result<BTreeMap<u64, u64>, LogError> {
        self.check_writing()?;
        let snapshot = self.ctx.reader.segments_snapshot();
        let mut map = BTreeMap::new();
        let mut cumulative = 0u64;
        for segment in snapshot.iter().rev() {
            if !segment.has_on_disk_footer() {
                continue;
            }
            cumulative += segment.file_size();
            map.insert(segment.max_replicate_index().unwrap_or(0), cumulative);
        }
        Ok(map)
    }

    /// Shuts down the appender, writes the active segment's footer, and
    /// releases file handles. Idempotent.
    pub async fn close(&self) -> Result<(), LogError> {
        self.queue.shutdown();
        let appender = self.appender.lock().take();
        if let Some(handle) = appender {
            if let Err(e) = handle.await {
                warn!("Log append task exited abnormally: {}", e);
            }
        }

        let mut state = self.state.write();
        match *state {
            LogState::Writing => {
                self.ctx.sync()?;
                self.ctx.close_current_segment()?;
                self.ctx.replace_current_in_reader()?;
                *state = LogState::Closed;
                debug!("T {}: Log closed", self.ctx.tablet_id);
                Ok(())
            }
            LogState::Closed => {
                debug!("T {}: Log already closed", self.ctx.tablet_id);
                Ok(())
            }
        }
    }

    /// Whether any WAL data exists for the tablet.
    pub fn has_on_disk_data(env: &dyn FsEnv, wal_root: &Path, tablet_id: &str) -> bool {
        env.file_exists(&wal_root.join(tablet_id))
    }

    /// Recursively removes the tablet's WAL directory.
    pub fn delete_on_disk_data(
        env: &dyn FsEnv,
        wal_root: &Path,
        tablet_id: &str,
    ) -> Result<(), LogError> {
        let dir = wal_root.join(tablet_id);
        if !env.file_exists(&dir) {
            return Ok(());
        }
        info!("T {}: Deleting WAL directory at {:?}", tablet_id, dir);
        env.delete_recursively(&dir)?;
        Ok(())
    }
}

/// Walks segments oldest-first and counts how many may be deleted without
/// violating the retention rules.
fn gcable_prefix_len(
    segments: &[Arc<ReadableLogSegment>],
    retention: RetentionIndexes,
    options: &LogOptions,
) -> usize {
    let mut remaining = segments.len();
    let mut prefix = 0;
    for segment in segments {
        if remaining <= options.min_segments_to_retain {
            break;
        }
        // An unfootered segment is either active or crash-truncated;
        // neither it nor anything after it may go.
        if !segment.has_on_disk_footer() {
            break;
        }
        let max_idx = segment.max_replicate_index().unwrap_or(0);
        if max_idx >= retention.for_durability {
            break;
        }
        // Peers get priority, but only up to the segment-count ceiling.
        if max_idx >= retention.for_peers && remaining <= options.max_segments_to_retain {
            break;
        }
        prefix += 1;
        remaining -= 1;
    }
    prefix
}

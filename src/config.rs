use std::time::Duration;

use crate::error::LogError;

/// Default maximum segment size (8MB). Production deployments typically
/// raise this to 64MB.
pub const DEFAULT_SEGMENT_SIZE_MB: usize = 8;

/// Default byte budget of the group-commit entry queue.
pub const DEFAULT_GROUP_COMMIT_QUEUE_SIZE_BYTES: usize = 4 * 1024 * 1024;

/// Default number of replicate index entries per on-disk index chunk.
pub const DEFAULT_ENTRIES_PER_INDEX_CHUNK: u64 = 1_000_000;

/// Configuration for a single tablet's write-ahead log.
///
/// This record replaces process-wide flags: it is constructed once at open
/// time and handed to the log, so two logs in the same process can run with
/// different settings. The `inject_*` fields are test-only fault and
/// latency injection knobs and default to "off".
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Maximum segment size in megabytes before rollover.
    pub segment_size_mb: usize,

    /// Floor on the number of past segments to keep at all times,
    /// regardless of what durability requires. Must be at least 1.
    pub min_segments_to_retain: usize,

    /// Ceiling on the number of past segments kept for the purpose of
    /// catching up lagging peers.
    pub max_segments_to_retain: usize,

    /// Byte budget of the entry queue; producers block in `reserve` while
    /// the queue holds this many serialized bytes.
    pub group_commit_queue_size_bytes: usize,

    /// Name of the compression codec for entry batches. One of "none",
    /// "lz4", "zstd"; the empty string also disables compression.
    pub compression_codec: String,

    /// Whether to fsync() the active segment on every appended group.
    pub force_fsync_all: bool,

    /// Whether the next segment is preallocated by a background task. When
    /// false, hitting the size budget rolls the segment synchronously on
    /// the appender.
    pub async_preallocate_segments: bool,

    /// Whether placeholder segments are extended to the full segment size
    /// at allocation time.
    pub preallocate_segments: bool,

    /// Bytes to leave free on the WAL volume for non-log usage; checked
    /// before preallocating a segment.
    pub wal_dir_reserved_bytes: u64,

    /// Replicate index entries per index chunk file. Tests use small
    /// values to exercise chunk rollover and GC.
    pub entries_per_index_chunk: u64,

    /// Mean/stddev of artificial latency injected into `sync()`, in
    /// milliseconds. Zero mean disables injection.
    pub inject_latency_ms_mean: u64,
    pub inject_latency_ms_stddev: u64,

    /// Fraction of appends that fail with an injected IO error.
    pub inject_io_error_on_append_fraction: f64,

    /// Fraction of preallocations that fail with an injected IO error.
    pub inject_io_error_on_preallocate_fraction: f64,

    /// Fraction of COMMIT appends that panic before enqueueing, to
    /// simulate a crash between replicating and committing.
    pub crash_before_append_commit_fraction: f64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            segment_size_mb: DEFAULT_SEGMENT_SIZE_MB,
            min_segments_to_retain: 2,
            max_segments_to_retain: 10,
            group_commit_queue_size_bytes: DEFAULT_GROUP_COMMIT_QUEUE_SIZE_BYTES,
            compression_codec: "lz4".to_string(),
            force_fsync_all: false,
            async_preallocate_segments: true,
            preallocate_segments: true,
            wal_dir_reserved_bytes: 0,
            entries_per_index_chunk: DEFAULT_ENTRIES_PER_INDEX_CHUNK,
            inject_latency_ms_mean: 0,
            inject_latency_ms_stddev: 0,
            inject_io_error_on_append_fraction: 0.0,
            inject_io_error_on_preallocate_fraction: 0.0,
            crash_before_append_commit_fraction: 0.0,
        }
    }
}

impl LogOptions {
    pub fn max_segment_size(&self) -> u64 {
        self.segment_size_mb as u64 * 1024 * 1024
    }

    /// Validates option ranges; called once in `Log::open`.
    pub fn validate(&self) -> Result<(), LogError> {
        if self.min_segments_to_retain < 1 {
            return Err(LogError::InvalidArgument(format!(
                "min_segments_to_retain must be at least 1, value {} is invalid",
                self.min_segments_to_retain
            )));
        }
        if self.segment_size_mb == 0 {
            return Err(LogError::InvalidArgument(
                "segment_size_mb must be non-zero".to_string(),
            ));
        }
        if self.entries_per_index_chunk == 0 {
            return Err(LogError::InvalidArgument(
                "entries_per_index_chunk must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Samples the configured sync latency injection, if any.
    pub(crate) fn sample_sync_latency(&self) -> Option<Duration> {
        if self.inject_latency_ms_mean == 0 {
            return None;
        }
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * self.inject_latency_ms_stddev as f64;
        let ms = self.inject_latency_ms_mean as f64 + jitter;
        if ms <= 0.0 {
            return None;
        }
        Some(Duration::from_millis(ms as u64))
    }
}

/// Returns true with probability `fraction`; used by the fault-injection
/// paths.
pub(crate) fn maybe_fault(fraction: f64) -> bool {
    fraction > 0.0 && rand::random::<f64>() < fraction
}

/// Configuration for the consensus driver above the log.
#[derive(Debug, Clone)]
pub struct ConsensusOptions {
    /// Soft limit on the total payload bytes of replicated-but-uncommitted
    /// operations held by this replica.
    pub max_pending_bytes: usize,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        Self {
            max_pending_bytes: 64 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        LogOptions::default().validate().unwrap();
    }

    #[test]
    fn test_min_segments_to_retain_validated() {
        let opts = LogOptions {
            min_segments_to_retain: 0,
            ..Default::default()
        };
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("must be at least 1"));
    }

    #[test]
    fn test_maybe_fault_extremes() {
        assert!(!maybe_fault(0.0));
        assert!(maybe_fault(1.0));
    }
}

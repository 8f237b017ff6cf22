//! A per-tablet, replicated, segment-based write-ahead log together with
//! the Raft consensus surface that drives it.
//!
//! The [`storage::log::Log`] durably records replicate and commit entries
//! in numbered segment files with group commit, background segment
//! preallocation, and retention-driven garbage collection. The
//! [`consensus::RaftConsensus`] driver sits above the log: it accepts (or
//! rejects) leader pushes, truncates divergent tails, advances the commit
//! index, and answers vote requests.
//!
//! The tablet storage engine, RPC framing, and cluster metadata are
//! external collaborators, reached through the [`env::FsEnv`],
//! [`clock::Clock`], and [`metrics::MetricSink`] traits.

pub mod clock;
pub mod config;
pub mod consensus;
pub mod env;
pub mod error;
pub mod message;
pub mod metrics;
pub mod storage;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use config::{ConsensusOptions, LogOptions};
pub use consensus::RaftConsensus;
pub use env::{FsEnv, StdFsEnv};
pub use error::{ConsensusError, LogError};
pub use metrics::{LogMetrics, MetricSink};
pub use storage::log::Log;
pub use types::{OpId, RetentionIndexes, Schema};

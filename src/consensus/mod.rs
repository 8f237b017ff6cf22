//! The Raft consensus surface that drives the write-ahead log.

mod driver;
mod state;

pub use driver::RaftConsensus;
pub use state::{bootstrap_from_log, BootstrapInfo, ConsensusMetadata, Role};

use std::sync::Arc;

use thiserror::Error;

use crate::message::ConsensusErrorCode;

/// Errors surfaced by the write-ahead log.
///
/// `Io` is cloneable because a single sync failure has to be delivered to
/// every batch of a group-commit drain; the underlying `std::io::Error` is
/// shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        LogError::Io(Arc::new(e))
    }
}

impl LogError {
    pub fn corruption(offset: u64, reason: impl Into<String>) -> Self {
        LogError::Corruption {
            offset,
            reason: reason.into(),
        }
    }

    /// An I/O failure on the append or sync path means some prefix of a
    /// batch may be on disk while its tail is not. Acknowledging anything
    /// after that point would let a follower lie about what it has, so the
    /// embedding server is expected to terminate the process when this
    /// returns true.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogError::Io(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, LogError::Corruption { .. })
    }

    /// The status every producer receives once the WAL has begun shutting
    /// down.
    pub fn shutting_down() -> Self {
        LogError::ServiceUnavailable("WAL is shutting down".to_string())
    }
}

/// Errors returned from the consensus surface at the transport level.
///
/// Consensus-protocol rejections (invalid term, LMP mismatch, mis-ordered
/// ops) are not errors at this level: they travel inside the
/// `ConsensusResponse` status so the caller can read the replica's state.
#[derive(Debug, Clone, Error)]
pub enum ConsensusError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Soft memory limit exceeded: {requested} bytes requested, {used} of {limit} in use")]
    SoftMemoryLimitExceeded {
        requested: usize,
        used: usize,
        limit: usize,
    },

    #[error("{message}")]
    Rejected {
        code: ConsensusErrorCode,
        message: String,
    },

    #[error("log error: {0}")]
    Log(#[from] LogError),
}

impl ConsensusError {
    pub fn not_the_leader(msg: impl Into<String>) -> Self {
        ConsensusError::Rejected {
            code: ConsensusErrorCode::NotTheLeader,
            message: msg.into(),
        }
    }

    pub fn cas_failed(msg: impl Into<String>) -> Self {
        ConsensusError::Rejected {
            code: ConsensusErrorCode::CasFailed,
            message: msg.into(),
        }
    }

    pub fn code(&self) -> Option<ConsensusErrorCode> {
        match self {
            ConsensusError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Identifies the tablet a WAL belongs to.
pub type TabletId = String;

/// Identifies a peer in a Raft configuration.
pub type PeerUuid = String;

/// Identifier of a single Raft operation: the term it was proposed in and
/// its position in the log.
///
/// Ordering is lexicographic on `(term, index)`. Within a single term the
/// index advances by exactly one per operation.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    /// The sentinel minimum OpId, used before any operation has been
    /// received or appended.
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// The pair of retention floors handed to the log by the consensus layer.
///
/// `for_durability` is the lowest op index still required for local
/// recovery; `for_peers` is the lowest index some lagging peer may still
/// need. Peer retention is best-effort and bounded by
/// `max_segments_to_retain`, durability retention is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionIndexes {
    pub for_durability: u64,
    pub for_peers: u64,
}

impl RetentionIndexes {
    pub fn new(for_durability: u64, for_peers: u64) -> Self {
        Self {
            for_durability,
            for_peers,
        }
    }
}

/// Opaque serialized schema of the tablet, as produced by the storage
/// engine. The log records it in each segment header so that bootstrap can
/// decode the entries written under it; the log itself never inspects it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Schema {
    pub raw: Vec<u8>,
}

impl Schema {
    pub fn from_bytes(raw: Vec<u8>) -> Self {
        Self { raw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_ordering() {
        assert!(OpId::new(1, 5) < OpId::new(2, 1));
        assert!(OpId::new(2, 1) < OpId::new(2, 2));
        assert_eq!(OpId::new(3, 7), OpId::new(3, 7));
        assert!(OpId::MIN < OpId::new(0, 1));
    }

    #[test]
    fn test_op_id_display() {
        assert_eq!(OpId::new(2, 6).to_string(), "2.6");
        assert_eq!(OpId::MIN.to_string(), "0.0");
    }
}

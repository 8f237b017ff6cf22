//! Request and response records for the consensus surface.
//!
//! These are the in-process equivalents of the wire messages a consensus
//! RPC layer would carry; the RPC framing itself lives outside this crate.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::storage::log::ReplicateMsg;
use crate::types::{OpId, PeerUuid};

/// A leader's push of operations to a follower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub tablet_id: String,
    pub caller_uuid: PeerUuid,
    pub caller_term: u64,
    /// The op the leader believes immediately precedes `ops[0]` on this
    /// replica.
    pub preceding_op_id: OpId,
    pub ops: Vec<ReplicateMsg>,
    /// Highest index the leader has committed.
    pub committed_index: u64,
    /// Lowest index that is durable on every voter; advisory, used for
    /// retention.
    pub all_replicated_index: u64,
}

/// Error codes carried inside a consensus response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum ConsensusErrorCode {
    InvalidTerm,
    PrecedingEntryDidntMatch,
    CannotPrepare,
    CasFailed,
    NotTheLeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusStatusError {
    pub code: ConsensusErrorCode,
    pub message: String,
}

/// The replica's view of its own log, included in every response so the
/// leader can reconcile after rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusStatus {
    /// Highest op this replica has ever received, from any leader.
    pub last_received: OpId,
    /// Highest op received from the current leader's term; `OpId::MIN`
    /// when none has arrived yet this term.
    pub last_received_current_leader: OpId,
    pub last_committed_idx: u64,
    pub error: Option<ConsensusStatusError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResponse {
    pub responder_uuid: PeerUuid,
    pub responder_term: u64,
    pub status: ConsensusStatus,
}

impl ConsensusResponse {
    pub fn is_error(&self) -> bool {
        self.status.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub tablet_id: String,
    pub candidate_uuid: PeerUuid,
    pub candidate_term: u64,
    /// The candidate's last received op, for the log-recency check.
    pub candidate_last_op_id: OpId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub responder_uuid: PeerUuid,
    pub responder_term: u64,
    pub vote_granted: bool,
}

/// A Raft configuration: the set of voting peers plus the opid index of
/// the config-change operation that committed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RaftConfig {
    /// Index of the operation that committed this configuration; -1 for
    /// the initial configuration which precedes the log.
    pub opid_index: i64,
    pub voter_uuids: Vec<PeerUuid>,
}

impl RaftConfig {
    pub fn initial(voter_uuids: Vec<PeerUuid>) -> Self {
        Self {
            opid_index: -1,
            voter_uuids,
        }
    }

    pub fn majority_size(&self) -> usize {
        self.voter_uuids.len() / 2 + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConfigRequest {
    pub tablet_id: String,
    /// When set, the change only applies if the committed config's
    /// opid_index matches; otherwise the request fails with `CAS_FAILED`.
    pub cas_config_opid_index: Option<i64>,
    pub new_voter_uuids: Vec<PeerUuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConfigResponse {
    /// The opid of the config-change operation now replicating.
    pub config_change_op_id: OpId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_size() {
        assert_eq!(RaftConfig::initial(vec!["a".into()]).majority_size(), 1);
        assert_eq!(
            RaftConfig::initial(vec!["a".into(), "b".into(), "c".into()]).majority_size(),
            2
        );
        assert_eq!(
            RaftConfig::initial(vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()])
                .majority_size(),
            3
        );
    }
}

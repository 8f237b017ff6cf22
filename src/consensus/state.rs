//! Durable and volatile replica state, plus bootstrap from the WAL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::env::FsEnv;
use crate::error::LogError;
use crate::message::RaftConfig;
use crate::storage::log::{LogEntry, LogReader};
use crate::types::{OpId, PeerUuid};

const META_FILE_NAME: &str = "consensus-meta";
const META_TMP_PREFIX: &str = ".tmp.cmeta";

/// The part of consensus state that must survive restarts: the current
/// term and who we voted for in it. Persisted with write-to-temp +
/// rename so a crash never leaves a half-written file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ConsensusMetadata {
    pub current_term: u64,
    pub voted_for: Option<PeerUuid>,
}

impl ConsensusMetadata {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(META_FILE_NAME)
    }

    pub fn load(env: &Arc<dyn FsEnv>, dir: &Path) -> Result<Option<Self>, LogError> {
        let path = Self::path(dir);
        if !env.file_exists(&path) {
            return Ok(None);
        }
        let file = env.new_random_access_file(&path)?;
        let len = file.metadata()?.len();
        if len < 8 {
            return Err(LogError::corruption(0, "consensus metadata too short"));
        }
        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; len as usize];
        file.read_exact_at(&mut buf, 0)?;
        let crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let record_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        if 8 + record_len > buf.len() {
            return Err(LogError::corruption(0, "consensus metadata length mismatch"));
        }
        let record = &buf[8..8 + record_len];
        if crc32fast::hash(record) != crc {
            return Err(LogError::corruption(0, "consensus metadata CRC mismatch"));
        }
        let (meta, _) = bincode::decode_from_slice(record, bincode::config::standard())
            .map_err(|e| LogError::corruption(0, format!("consensus metadata decoding: {}", e)))?;
        Ok(Some(meta))
    }

    pub fn persist(&self, env: &Arc<dyn FsEnv>, dir: &Path) -> Result<(), LogError> {
        use std::io::Write;
        let record = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::InvalidArgument(format!("metadata encoding: {}", e)))?;
        let mut buf = Vec::with_capacity(8 + record.len());
        buf.extend_from_slice(&crc32fast::hash(&record).to_le_bytes());
        buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
        buf.extend_from_slice(&record);

        let (tmp_path, mut tmp_file) = env.new_temp_writable_file(dir, META_TMP_PREFIX)?;
        tmp_file.write_all(&buf)?;
        tmp_file.sync_all()?;
        drop(tmp_file);
        env.rename_file(&tmp_path, &Self::path(dir))?;
        env.sync_dir(dir)?;
        Ok(())
    }
}

/// Consensus roles this replica can hold. There is no standing candidate
/// state: elections are driven by the embedding server, which calls
/// `become_leader` after winning one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// What bootstrap recovered from the WAL.
#[derive(Debug, Clone, Default)]
pub struct BootstrapInfo {
    /// Highest surviving replicate op.
    pub last_id: OpId,
    /// Highest committed index found in COMMIT records.
    pub committed_index: u64,
    /// Surviving replicate ops by index (later same-index appends
    /// superseding earlier ones).
    pub received: BTreeMap<u64, OpId>,
}

/// Replays the WAL to reconstruct the replica's op state.
///
/// Replicates extend the received map; a replicate re-appearing at an
/// existing index means a leader replaced the tail, so everything at and
/// after that index is superseded by the new op. Commit records advance
/// the committed floor.
pub fn bootstrap_from_log(reader: &LogReader) -> Result<BootstrapInfo, LogError> {
    let entries = reader.read_all_entries()?;
    let mut info = BootstrapInfo::default();
    for entry in entries {
        match entry {
            LogEntry::Replicate(msg) => {
                let replaced = info.received.split_off(&msg.id.index);
                if replaced.len() > 1 {
                    debug!(
                        "Bootstrap: op {} supersedes {} previously received ops",
                        msg.id,
                        replaced.len()
                    );
                }
                info.received.insert(msg.id.index, msg.id);
            }
            LogEntry::Commit(msg) => {
                info.committed_index = info.committed_index.max(msg.committed_op_id.index);
            }
            LogEntry::FlushMarker => {
                warn!("Flush marker found in durable log; ignoring");
            }
        }
    }
    info.last_id = info
        .received
        .values()
        .next_back()
        .copied()
        .unwrap_or(OpId::MIN);
    Ok(info)
}

/// Volatile replica state, guarded by the driver's lock.
pub(crate) struct ReplicaState {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<PeerUuid>,
    pub leader_uuid: Option<PeerUuid>,

    /// Ops present locally, pruned below the committed index (the
    /// committed boundary op itself is retained for matching).
    pub received: BTreeMap<u64, OpId>,
    pub last_received: OpId,
    pub last_received_current_leader: OpId,
    pub committed_index: u64,

    /// Payload bytes of replicated-but-uncommitted ops, by index.
    pub pending: BTreeMap<u64, usize>,
    pub pending_bytes: usize,

    pub committed_config: RaftConfig,
    /// A config change op that is replicating but not yet committed:
    /// (op index, the config it installs).
    pub pending_config: Option<(u64, RaftConfig)>,

    /// Advisory low-water mark from the leader, for retention.
    pub all_replicated_index: u64,
}

impl ReplicaState {
    pub fn new(meta: ConsensusMetadata, bootstrap: BootstrapInfo, config: RaftConfig) -> Self {
        let mut state = Self {
            role: Role::Follower,
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            leader_uuid: None,
            received: bootstrap.received,
            last_received: bootstrap.last_id,
            last_received_current_leader: OpId::MIN,
            committed_index: bootstrap.committed_index,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            committed_config: config,
            pending_config: None,
            all_replicated_index: 0,
        };
        state.prune_below_committed();
        state
    }

    /// Whether the local log contains exactly `op` at its index.
    /// Index 0 is the (0,0) sentinel; indexes at or below the committed
    /// floor whose entries were pruned are assumed matching, since
    /// committed ops are immutable and identical on every replica.
    pub fn matches_op(&self, op: OpId) -> bool {
        if op.index == 0 {
            return op.term == 0;
        }
        match self.received.get(&op.index) {
            Some(local) => local.term == op.term,
            None => op.index <= self.committed_index,
        }
    }

    /// Discards every op with index greater than `index`, aborting their
    /// pending records. Callers guarantee `index >= committed_index`.
    pub fn truncate_after(&mut self, index: u64) {
        debug_assert!(index >= self.committed_index);
        let dropped = self.received.split_off(&(index + 1));
        if dropped.is_empty() {
            return;
        }
        for (_, bytes) in self.pending.split_off(&(index + 1)) {
            self.pending_bytes -= bytes;
        }
        if let Some((cfg_index, _)) = self.pending_config {
            if cfg_index > index {
                self.pending_config = None;
            }
        }
        self.last_received = self
            .received
            .values()
            .next_back()
            .copied()
            .unwrap_or(OpId::MIN);
        if self.last_received_current_leader.index > index {
            self.last_received_current_leader = OpId::MIN;
        }
    }

    /// Drops received entries strictly below the committed boundary.
    pub fn prune_below_committed(&mut self) {
        if self.committed_index > 0 {
            self.received = self.received.split_off(&self.committed_index);
        }
    }

    /// Term of the op at the committed index, 0 when nothing is
    /// committed.
    pub fn committed_term(&self) -> u64 {
        self.received
            .get(&self.committed_index)
            .map(|op| op.term)
            .unwrap_or(0)
    }
}
